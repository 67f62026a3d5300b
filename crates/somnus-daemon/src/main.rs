use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use somnus_core::alarm::AlarmManager;
use somnus_core::config::{init_logging, AppConfig, GatewayMode};
use somnus_core::dashboard::{summarize, TimeWindow};
use somnus_core::db::{with_db, Database, SharedDatabase};
use somnus_core::gateway::{self, GeminiGateway, HttpGateway};
use somnus_core::recording::{AudioInput, RecordingController, RecordingStatus};
use somnus_core::schema::NewAlarm;
use somnus_daemon::capture::{create_audio_input, file::FileInput};
use somnus_daemon::{build_router, AppState, Scheduler};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "somnus", about = "Somnus sleep tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP service and alarm loop (default when no subcommand given)
    Run,
    /// Manage alarms
    Alarms {
        #[command(subcommand)]
        action: AlarmAction,
    },
    /// Manage recorded sleep sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Print dashboard aggregates for a time window
    Dashboard {
        #[arg(long, value_enum, default_value = "week")]
        window: WindowArg,
    },
    /// Record for a fixed time, analyze, and print the results
    Record {
        /// How long to record, in seconds
        #[arg(long, default_value = "30")]
        seconds: u64,
        /// Replay this audio file instead of the configured input
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Show configuration and gateway reachability
    Status,
}

#[derive(Subcommand)]
enum AlarmAction {
    /// List all alarms
    List,
    /// Add an alarm
    Add {
        /// Time of day, HH:MM
        time: String,
        #[arg(long, default_value = "")]
        label: String,
        /// Weekday indices (0 = Sunday); omit for a one-shot alarm
        #[arg(long, value_delimiter = ',')]
        days: Vec<u8>,
    },
    /// Toggle an alarm on or off
    Toggle { id: String },
    /// Delete an alarm
    Delete { id: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, newest first
    List,
    /// Delete a session by its date key
    Delete { date: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum WindowArg {
    Week,
    Month,
    Year,
}

impl From<WindowArg> for TimeWindow {
    fn from(value: WindowArg) -> Self {
        match value {
            WindowArg::Week => TimeWindow::Week,
            WindowArg::Month => TimeWindow::Month,
            WindowArg::Year => TimeWindow::Year,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon().await,
        Command::Alarms { action } => run_alarms(action).await,
        Command::Sessions { action } => run_sessions(action).await,
        Command::Dashboard { window } => run_dashboard(window.into()).await,
        Command::Record { seconds, input } => run_record(seconds, input).await,
        Command::Status => run_status().await,
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<SharedDatabase> {
    config.ensure_dirs()?;
    let db_path = config.db_path()?;
    let db = Database::open(&db_path)?;
    info!(path = %db_path.display(), "database opened");
    Ok(db.into_shared())
}

async fn run_daemon() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::load()?;
    let db = open_store(&config)?;
    let gateway = gateway::from_config(&config);
    let input = create_audio_input(&config.recording)?;

    if config.gateway.mode == GatewayMode::Remote && config.server.serve_gateway {
        warn!(
            endpoint = %config.gateway.endpoint,
            "remote gateway mode with serve_gateway enabled; make sure the endpoint is not this server"
        );
    }

    let state = AppState::new(&config, db, gateway.clone(), input.clone());
    let loaded = state.alarms.load().await?;
    info!(
        alarms = loaded,
        gateway = gateway.name(),
        input = input.name(),
        "somnus starting"
    );

    let scheduler = Scheduler::spawn(
        state.clone(),
        Duration::from_millis(config.alarm.poll_interval_ms.max(100)),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "listening");

    let token = scheduler.token();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
                _ = token.cancelled() => {}
            }
        })
        .await?;

    scheduler.shutdown().await;
    info!("somnus stopped");
    Ok(())
}

async fn run_alarms(action: AlarmAction) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let manager = AlarmManager::new(open_store(&config)?, &config.alarm);
    manager.load().await?;

    match action {
        AlarmAction::List => {
            let alarms = manager.alarms();
            if alarms.is_empty() {
                println!("No alarms.");
            }
            for alarm in alarms {
                let days = if alarm.days.is_empty() {
                    "once".to_string()
                } else {
                    alarm
                        .days
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                };
                println!(
                    "{}  {}  [{}]  {:<5}  {}",
                    alarm.id,
                    alarm.time,
                    days,
                    if alarm.is_active { "on" } else { "off" },
                    alarm.label
                );
            }
        }
        AlarmAction::Add { time, label, days } => {
            let alarm = manager
                .create(NewAlarm {
                    time: time.parse()?,
                    label,
                    days: days.into_iter().collect(),
                })
                .await?;
            println!("Added alarm {} at {}", alarm.id, alarm.time);
        }
        AlarmAction::Toggle { id } => {
            let alarm = manager.toggle(&id).await?;
            println!(
                "Alarm {} is now {}",
                alarm.id,
                if alarm.is_active { "on" } else { "off" }
            );
        }
        AlarmAction::Delete { id } => {
            manager.delete(&id).await?;
            println!("Deleted alarm {id}");
        }
    }
    Ok(())
}

async fn run_sessions(action: SessionAction) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let db = open_store(&config)?;

    match action {
        SessionAction::List => {
            let sessions = with_db(&db, |db| db.get_all_sessions()).await?;
            if sessions.is_empty() {
                println!("No sessions recorded.");
            }
            for s in sessions {
                println!(
                    "{}  score {:>3}  {:>5.1} h  {} events  {}",
                    s.date,
                    s.sleep_score,
                    s.duration / 3600.0,
                    s.events.len(),
                    s.summary
                );
            }
        }
        SessionAction::Delete { date } => {
            let key = date.clone();
            if with_db(&db, move |db| db.delete_session(&key)).await? {
                println!("Deleted session {date}");
            } else {
                anyhow::bail!("no session with date {date}");
            }
        }
    }
    Ok(())
}

async fn run_dashboard(window: TimeWindow) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let db = open_store(&config)?;
    let sessions = with_db(&db, |db| db.get_all_sessions()).await?;

    let summary = summarize(&sessions, window, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_record(seconds: u64, input_file: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let db = open_store(&config)?;
    let gateway = gateway::from_config(&config);
    let input: Arc<dyn AudioInput> = match input_file {
        Some(path) => Arc::new(FileInput::new(path)),
        None => create_audio_input(&config.recording)?,
    };

    let mut controller = RecordingController::new(
        input,
        gateway,
        db,
        &config.recording,
        config.playback_dir().ok(),
    );

    controller.start().await?;
    println!("Recording for {seconds} s...");
    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if controller.poll() != RecordingStatus::Tracking {
            break;
        }
    }

    println!("Analyzing...");
    let outcome = controller.stop().await;
    println!("{}", serde_json::to_string_pretty(&controller.snapshot())?);
    outcome?;
    Ok(())
}

async fn run_status() -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;

    let reachable = match config.gateway.mode {
        GatewayMode::Direct => GeminiGateway::new(&config.model).health_check().await,
        GatewayMode::Remote => HttpGateway::new(&config.gateway).health_check().await,
    };

    let status = serde_json::json!({
        "database": config.db_path()?.display().to_string(),
        "listen_addr": config.server.listen_addr,
        "gateway_mode": config.gateway.mode,
        "gateway_reachable": reachable,
        "model": config.model.model,
        "recording_input": config.recording.input,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
