//! Device sources that do not need a live device.
//!
//! [`ReplaySource`] plays back a recorded session. The JSON-lines format has
//! one record per line; blank lines and lines starting with `#` are skipped:
//!
//! ```text
//! {"app_id":"com.whatsapp","root":{"role":"FrameLayout"},"captured_at":"2026-05-01T09:00:00Z"}
//! {"unreachable":"adb: device offline"}
//! ```
//!
//! A line carrying only `unreachable` makes the next pull fail with
//! [`DeviceError::Unreachable`]. Once the recording is exhausted every pull
//! returns [`DeviceError::Closed`].

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use async_trait::async_trait;
use pbrain_types::RawSnapshot;
use serde::Deserialize;
use thiserror::Error;

use crate::driver::{DeviceError, DeviceSource};

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One recorded pull result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReplayEvent {
    Unreachable { unreachable: String },
    Snapshot(RawSnapshot),
}

#[derive(Debug, Default)]
pub struct ReplaySource {
    events: VecDeque<ReplayEvent>,
}

impl ReplaySource {
    pub fn new(events: impl IntoIterator<Item = ReplayEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, ReplayError> {
        let mut events = VecDeque::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let event = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
                line: i + 1,
                source,
            })?;
            events.push_back(event);
        }
        Ok(Self { events })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Events not yet pulled.
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl DeviceSource for ReplaySource {
    async fn pull(&mut self) -> Result<RawSnapshot, DeviceError> {
        match self.events.pop_front() {
            Some(ReplayEvent::Snapshot(snapshot)) => Ok(snapshot),
            Some(ReplayEvent::Unreachable { unreachable }) => Err(DeviceError::Unreachable(unreachable)),
            None => Err(DeviceError::Closed),
        }
    }
}
