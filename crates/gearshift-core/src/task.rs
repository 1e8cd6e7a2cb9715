use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GearshiftError, Result};
use crate::interval::RepeatInterval;

/// Connection used when a task does not name one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Urgency of a task on the broker side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A directive to run one capability on the broker: what to run, with which
/// payload, when, how urgently, and whether the caller waits for the result.
///
/// Setters return `&mut Task` so they chain:
///
/// ```
/// use gearshift_core::task::{Priority, Task};
///
/// let mut task = Task::new("reports.render");
/// task.set_payload("2026-10")
///     .set_priority(Priority::High)
///     .set_connection_name("reports");
/// assert!(!task.is_scheduled());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    connection_name: String,
    background: bool,
    priority: Priority,
    capability: String,
    payload: Vec<u8>,
    context: Option<String>,
    start: DateTime<Utc>,
    repeat_remaining: u32,
    repeat_interval: Option<RepeatInterval>,
}

impl Default for Task {
    fn default() -> Self {
        Self::new("")
    }
}

impl Task {
    /// New immediate, foreground, normal-priority task with a fresh UUIDv7 id.
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            connection_name: DEFAULT_CONNECTION.to_string(),
            background: false,
            priority: Priority::Normal,
            capability: capability.into(),
            payload: Vec::new(),
            context: None,
            start: Utc::now().trunc_subsecs(6),
            repeat_remaining: 1,
            repeat_interval: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = id.into();
        self
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn set_connection_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.connection_name = name.into();
        self
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn set_background(&mut self, background: bool) -> &mut Self {
        self.background = background;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) -> &mut Self {
        self.priority = priority;
        self
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn set_capability(&mut self, capability: impl Into<String>) -> &mut Self {
        self.capability = capability.into();
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.payload = payload.into();
        self
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn set_context(&mut self, context: impl Into<String>) -> &mut Self {
        self.context = Some(context.into());
        self
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Set the earliest dispatch time. Any time zone is accepted and
    /// converted to UTC; precision is kept to the microsecond.
    pub fn set_start<Tz: TimeZone>(&mut self, start: DateTime<Tz>) -> &mut Self {
        self.start = start.with_timezone(&Utc).trunc_subsecs(6);
        self
    }

    pub fn repeat_remaining(&self) -> u32 {
        self.repeat_remaining
    }

    pub fn repeat_interval(&self) -> Option<&RepeatInterval> {
        self.repeat_interval.as_ref()
    }

    /// Make the task recurring: `times` dispatches, `interval` apart.
    ///
    /// Recurring tasks always run in the background. On an unparsable
    /// interval the task is left untouched.
    pub fn set_repeat(&mut self, times: u32, interval: &str) -> Result<&mut Self> {
        let interval: RepeatInterval = interval
            .parse()
            .map_err(|_| GearshiftError::domain("Task repetition settings invalid"))?;
        self.repeat_remaining = times;
        self.repeat_interval = Some(interval);
        self.background = true;
        Ok(self)
    }

    /// Restore repeat bookkeeping exactly as persisted, without touching the
    /// background flag. Meant for storage backends rebuilding a task.
    pub fn restore_repeat(
        &mut self,
        remaining: u32,
        interval: Option<RepeatInterval>,
    ) -> &mut Self {
        self.repeat_remaining = remaining;
        self.repeat_interval = interval;
        self
    }

    /// True when the task belongs in the scheduler queue rather than being
    /// dispatched right away.
    pub fn is_scheduled(&self) -> bool {
        self.is_scheduled_at(Utc::now())
    }

    pub fn is_scheduled_at(&self, now: DateTime<Utc>) -> bool {
        self.start > now || (self.repeat_remaining > 1 && self.repeat_interval.is_some())
    }

    /// Record one dispatch of a recurring task: one fewer repeat left and the
    /// start moved one interval forward. Must run at most once per promotion.
    pub fn decay_once(&mut self) {
        if self.repeat_remaining == 0 {
            return;
        }
        self.repeat_remaining -= 1;
        if let Some(next) = self
            .repeat_interval
            .as_ref()
            .and_then(|interval| interval.advance(self.start))
        {
            self.start = next;
        }
    }
}
