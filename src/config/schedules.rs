//! Recurring job declarations from TOML.
//!
//! ```toml
//! [[schedule]]
//! type = "heartbeat"
//! schedule = "every 30 seconds"
//! priority = 5
//! input = { wait = 100 }
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::director::AutoSchedule;
use crate::error::{Error, Result};
use crate::model::check_timeout_ms;
use crate::schedule::Schedule;

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    #[serde(rename = "type")]
    pub work_type: String,
    pub schedule: String,
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retries: u32,
    pub timeout_ms: Option<u64>,
    pub input: Option<toml::Value>,
}

impl ScheduleEntry {
    pub fn into_auto_schedule(self) -> Result<AutoSchedule> {
        let schedule = Schedule::parse(&self.schedule)?;
        let mut auto = AutoSchedule::new(self.work_type, schedule)
            .priority(self.priority)
            .retries(self.retries);
        if let Some(id) = self.schedule_id {
            auto = auto.schedule_id(id);
        }
        if let Some(ms) = self.timeout_ms {
            check_timeout_ms(ms).map_err(|e| {
                Error::Config(format!("schedule '{}': {e}", self.schedule))
            })?;
            auto = auto.timeout(Duration::from_millis(ms));
        }
        if let Some(input) = self.input {
            auto = auto.static_input(serde_json::to_value(input)?);
        }
        Ok(auto)
    }
}

pub fn parse_schedules(content: &str) -> Result<Vec<AutoSchedule>> {
    let file: ScheduleFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad schedule file: {e}")))?;
    file.schedule
        .into_iter()
        .map(ScheduleEntry::into_auto_schedule)
        .collect()
}

pub fn load_schedules(path: &Path) -> Result<Vec<AutoSchedule>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read schedule file {}: {e}", path.display()))
    })?;
    parse_schedules(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
