use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::gateway::AnalysisGateway;
use crate::sanitize::sanitize_html;
use crate::schema::{AnalysisData, EventKind, StageKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    #[default]
    Week,
    Month,
    Year,
}

impl TimeWindow {
    pub fn days(&self) -> i64 {
        match self {
            TimeWindow::Week => 7,
            TimeWindow::Month => 30,
            TimeWindow::Year => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Week => "week",
            TimeWindow::Month => "month",
            TimeWindow::Year => "year",
        }
    }

    /// Earliest instant still inside the window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(self.days())
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "week" => Ok(TimeWindow::Week),
            "month" => Ok(TimeWindow::Month),
            "year" => Ok(TimeWindow::Year),
            other => Err(CoreError::InvalidInput(format!(
                "unknown time window: {other} (expected week, month or year)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub window: TimeWindow,
    pub session_count: usize,
    pub average_score: f64,
    /// Seconds.
    pub average_duration: f64,
    pub event_breakdown: BTreeMap<EventKind, usize>,
    /// Seconds spent in each stage across all sessions in the window.
    pub stage_totals: BTreeMap<StageKind, f64>,
    /// Newest first, as loaded.
    pub sessions: Vec<AnalysisData>,
}

/// Sessions whose completion date falls inside `window`, order preserved.
pub fn sessions_in_window(
    sessions: &[AnalysisData],
    window: TimeWindow,
    now: DateTime<Utc>,
) -> Vec<AnalysisData> {
    let cutoff = window.cutoff(now);
    sessions
        .iter()
        .filter(|s| match DateTime::parse_from_rfc3339(&s.date) {
            Ok(date) => date.with_timezone(&Utc) >= cutoff,
            Err(e) => {
                debug!(date = %s.date, "skipping session with unparseable date: {e}");
                false
            }
        })
        .cloned()
        .collect()
}

pub fn summarize(
    sessions: &[AnalysisData],
    window: TimeWindow,
    now: DateTime<Utc>,
) -> DashboardSummary {
    let selected = sessions_in_window(sessions, window, now);
    let count = selected.len();

    let (average_score, average_duration) = if count == 0 {
        (0.0, 0.0)
    } else {
        let score_sum: f64 = selected.iter().map(|s| f64::from(s.sleep_score)).sum();
        let duration_sum: f64 = selected.iter().map(|s| s.duration).sum();
        (score_sum / count as f64, duration_sum / count as f64)
    };

    let mut event_breakdown: BTreeMap<EventKind, usize> =
        EventKind::ALL.iter().map(|k| (*k, 0)).collect();
    let mut stage_totals: BTreeMap<StageKind, f64> =
        StageKind::ALL.iter().map(|k| (*k, 0.0)).collect();
    for session in &selected {
        for event in &session.events {
            *event_breakdown.entry(event.kind).or_default() += 1;
        }
        for stage in &session.stages {
            *stage_totals.entry(stage.stage).or_default() += stage.length();
        }
    }

    DashboardSummary {
        window,
        session_count: count,
        average_score,
        average_duration,
        event_breakdown,
        stage_totals,
        sessions: selected,
    }
}

/// Dashboard view state: the selected window and narratives fetched for it.
#[derive(Debug, Default)]
pub struct Dashboard {
    window: TimeWindow,
    narratives: HashMap<TimeWindow, String>,
}

impl Dashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn select(&mut self, window: TimeWindow) {
        self.window = window;
    }

    pub fn summary(&self, sessions: &[AnalysisData], now: DateTime<Utc>) -> DashboardSummary {
        summarize(sessions, self.window, now)
    }

    pub fn cached_narrative(&self, window: TimeWindow) -> Option<&str> {
        self.narratives.get(&window).map(String::as_str)
    }

    /// Narrative for the selected window, fetched once and then served from cache.
    ///
    /// The year view has no narrative.
    pub async fn narrative(
        &mut self,
        gateway: &dyn AnalysisGateway,
        sessions: &[AnalysisData],
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let window = self.window;
        if window == TimeWindow::Year {
            return Ok(None);
        }
        if let Some(cached) = self.narratives.get(&window) {
            return Ok(Some(cached.clone()));
        }

        let selected = sessions_in_window(sessions, window, now);
        info!(%window, sessions = selected.len(), "requesting narrative");
        let raw = match window {
            TimeWindow::Week => gateway.weekly_narrative(&selected).await?,
            TimeWindow::Month => gateway.monthly_narrative(&selected).await?,
            TimeWindow::Year => return Ok(None),
        };

        let html = sanitize_html(&raw);
        self.narratives.insert(window, html.clone());
        Ok(Some(html))
    }

    /// Drop cached narratives, e.g. after a new session is saved.
    pub fn invalidate(&mut self) {
        self.narratives.clear();
    }
}
