pub mod alarm;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod gateway;
pub mod recording;
pub mod sanitize;
pub mod schema;
pub mod shell;

pub use alarm::{AlarmEvaluator, AlarmManager, TickOutcome};
pub use config::AppConfig;
pub use dashboard::{Dashboard, DashboardSummary, TimeWindow};
pub use db::{Database, SharedDatabase};
pub use error::{CoreError, Result};
pub use gateway::AnalysisGateway;
pub use recording::{RecordingController, RecordingStatus};
pub use shell::{Shell, View};
