//! Core data model.
//!
//! A message is an opaque JSON body addressed by a [`MessageId`]. The id is
//! also the filename and the sort key: priority digit first, then arrival time.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Message priority in `[1, 9]`. Lower value = claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(9);
    pub const DEFAULT: Priority = Priority(5);

    /// Validate a raw priority value.
    pub fn new(value: u8) -> Result<Self> {
        if (Self::HIGHEST.0..=Self::LOWEST.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidArgument(format!(
                "priority has to be between {} and {}, got {value}",
                Self::HIGHEST.0,
                Self::LOWEST.0
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Message identifier
// ---------------------------------------------------------------------------

/// Width of the zero-padded timestamp. `u64::MAX` has 20 digits, so string
/// order and numeric order agree for every value.
const TIMESTAMP_WIDTH: usize = 20;

/// Highest timestamp handed out by this process. Ids are strictly increasing
/// even when the wall clock stalls or steps backwards.
static HIGH_WATER_NS: AtomicU64 = AtomicU64::new(0);

/// `<priority>_<nanoseconds since UNIX epoch, 20 digits>`.
///
/// Field order matters: the derived `Ord` is priority-major, time-minor, which
/// is exactly the lexicographic order of the rendered filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    priority: Priority,
    timestamp_ns: u64,
}

impl MessageId {
    /// Allocate a fresh id for `priority` from the current wall clock.
    pub fn generate(priority: Priority) -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64;
        let mut issued = now;
        // fetch_update only fails when the closure returns None, which it never does.
        let _ = HIGH_WATER_NS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            issued = if now > last { now } else { last + 1 };
            Some(issued)
        });
        Self {
            priority,
            timestamp_ns: issued,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Wall-clock time the message was enqueued.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns.min(i64::MAX as u64) as i64)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{:0width$}",
            self.priority,
            self.timestamp_ns,
            width = TIMESTAMP_WIDTH
        )
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("not a message id: {s:?}"));

        let (priority, timestamp) = s.split_once('_').ok_or_else(invalid)?;
        if priority.len() != 1
            || timestamp.len() != TIMESTAMP_WIDTH
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let priority = priority.parse::<u8>().map_err(|_| invalid())?;

        Ok(Self {
            priority: Priority::new(priority)?,
            timestamp_ns: timestamp.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// A message this consumer exclusively owns.
#[derive(Debug, Clone)]
pub struct Claimed<T> {
    pub id: MessageId,
    pub body: T,
}

/// Metadata handed to the handler alongside the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Prior failed invocations for the current claim. Not persisted.
    pub attempt_count: u32,
    pub claimed_at: DateTime<Utc>,
}

/// What a handler decided about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done; the message is deleted.
    Success,
    /// Failed; deliver the same claim again with `attempt_count + 1`.
    Retry(String),
    /// Terminal failure; the message moves to the abort area.
    Abort(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry(_) => "retry",
            Outcome::Abort(_) => "abort",
        }
    }
}

impl<E: fmt::Display> From<std::result::Result<(), E>> for Outcome {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}

/// How [`crate::consumer::Consumer::process_next`] finished with a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded after `attempts` invocations; message deleted.
    Completed { id: MessageId, attempts: u32 },
    /// Handler (or a body that would not decode) aborted it.
    Aborted { id: MessageId, attempts: u32 },
    /// Shutdown was requested before a claim finished.
    Interrupted,
}
