use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

// -- Alarms --

/// Wall-clock time of day an alarm fires at, always rendered as zero-padded `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AlarmTime {
    hour: u8,
    minute: u8,
}

impl AlarmTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, CoreError> {
        if hour > 23 || minute > 59 {
            return Err(CoreError::InvalidInput(format!(
                "alarm time out of range: {hour}:{minute}"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for AlarmTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidInput(format!("alarm time must be HH:MM, got {s:?}"));
        let (h, m) = s.split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        AlarmTime::new(hour, minute)
    }
}

impl TryFrom<String> for AlarmTime {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlarmTime> for String {
    fn from(value: AlarmTime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    pub time: AlarmTime,
    pub label: String,
    pub is_active: bool,
    /// Weekday indices, 0 = Sunday. Empty means the alarm fires once.
    #[serde(default)]
    pub days: BTreeSet<u8>,
}

impl Alarm {
    pub fn is_one_shot(&self) -> bool {
        self.days.is_empty()
    }

    /// Whether this alarm is due at `time` on `weekday`, ignoring suppression.
    pub fn is_due(&self, time: AlarmTime, weekday: u8) -> bool {
        self.is_active && self.time == time && (self.days.is_empty() || self.days.contains(&weekday))
    }
}

/// Insert DTO: what a user submits to create an alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlarm {
    pub time: AlarmTime,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub days: BTreeSet<u8>,
}

impl NewAlarm {
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(day) = self.days.iter().find(|d| **d > 6) {
            return Err(CoreError::InvalidInput(format!(
                "weekday index must be 0..=6, got {day}"
            )));
        }
        Ok(())
    }

    /// Build the stored record with a fresh time-ordered id.
    pub fn into_alarm(self) -> Alarm {
        Alarm {
            id: uuid::Uuid::now_v7().to_string(),
            time: self.time,
            label: self.label,
            is_active: true,
            days: self.days,
        }
    }
}

// -- Sleep analysis --

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Snore,
    Talk,
    Cough,
    Fart,
    Movement,
    #[serde(other)]
    Other,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Snore,
        EventKind::Talk,
        EventKind::Cough,
        EventKind::Fart,
        EventKind::Movement,
        EventKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Snore => "Snore",
            EventKind::Talk => "Talk",
            EventKind::Cough => "Cough",
            EventKind::Fart => "Fart",
            EventKind::Movement => "Movement",
            EventKind::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Awake,
    Light,
    Deep,
    #[serde(rename = "REM")]
    Rem,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Awake,
        StageKind::Light,
        StageKind::Deep,
        StageKind::Rem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Awake => "Awake",
            StageKind::Light => "Light",
            StageKind::Deep => "Deep",
            StageKind::Rem => "REM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepEvent {
    /// Offset from the start of the session, in seconds.
    pub time: f64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub description: String,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepStage {
    pub stage: StageKind,
    pub start_time: f64,
    pub end_time: f64,
}

impl SleepStage {
    pub fn length(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Structured result of the audio-analysis call, before it is keyed by date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepAnalysis {
    pub sleep_score: u32,
    pub summary: String,
    #[serde(default)]
    pub events: Vec<SleepEvent>,
    #[serde(default)]
    pub stages: Vec<SleepStage>,
    /// Total session length in seconds.
    pub duration: f64,
}

impl SleepAnalysis {
    /// Key the analysis by its completion timestamp.
    pub fn into_record(self, date: String) -> AnalysisData {
        AnalysisData {
            date,
            sleep_score: self.sleep_score,
            summary: self.summary,
            events: self.events,
            stages: self.stages,
            duration: self.duration,
        }
    }
}

/// A persisted sleep session, keyed by `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisData {
    /// RFC 3339 UTC completion timestamp.
    pub date: String,
    pub sleep_score: u32,
    pub summary: String,
    #[serde(default)]
    pub events: Vec<SleepEvent>,
    #[serde(default)]
    pub stages: Vec<SleepStage>,
    pub duration: f64,
}
