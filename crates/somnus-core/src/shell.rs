use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::recording::RecordingStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    #[default]
    Dashboard,
    Alarms,
    Tracking,
}

/// Top-level tab state. Switching away is refused while a recording is in progress.
#[derive(Debug, Default)]
pub struct Shell {
    current: View,
    locked: bool,
}

impl Shell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> View {
        self.current
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn select(&mut self, view: View) -> Result<View> {
        if view == self.current {
            return Ok(view);
        }
        if self.locked {
            return Err(CoreError::NavigationLocked);
        }
        debug!(from = ?self.current, to = ?view, "view selected");
        self.current = view;
        Ok(view)
    }

    /// Follow the recording controller. An active session pins the tracking view.
    pub fn sync(&mut self, status: RecordingStatus) {
        self.locked = status.is_active();
        if self.locked {
            self.current = View::Tracking;
        }
    }
}
