//!
//! src/bus.rs  Andrew Belles  Oct 6th, 2025
//!
//! Progress bus between running jobs and the websocket delivery loop.
//! Events travel as json envelopes keyed by user id. Nothing is stored,
//! an event published after the delivery loop stopped is gone.
//!

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::UserId;
use crate::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    TrackProgress { found_count: u32, not_found_count: u32 },
    JobFinished,
    JobFailed { reason: String },
    CsvFileError
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    TrackProgress,
    JobFinished,
    CsvFileError,
    JobFailed
}

/// Wire form of an event on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    #[serde(default)]
    pub msg: Value,
    #[serde(rename = "userID")]
    pub user_id: String
}

impl Envelope {
    pub fn encode(user: &UserId, event: &ProgressEvent) -> Self {
        let (msg_type, msg) = match event {
            ProgressEvent::TrackProgress { found_count, not_found_count } => (
                MsgType::TrackProgress,
                json!({ "foundCount": found_count, "notFoundCount": not_found_count })
            ),
            ProgressEvent::JobFinished => (MsgType::JobFinished, Value::Null),
            ProgressEvent::JobFailed { reason } => (
                MsgType::JobFailed,
                json!({ "error": reason })
            ),
            ProgressEvent::CsvFileError => (
                MsgType::CsvFileError,
                json!({ "error": "CSV file error" })
            )
        };
        Self { msg_type, msg, user_id: user.0.clone() }
    }

    pub fn decode(self) -> Result<(UserId, ProgressEvent), TransferError> {
        let count = |key: &str| -> Result<u32, TransferError> {
            self.msg.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| TransferError::Parse(format!("envelope missing {key}")))
        };

        let event = match self.msg_type {
            MsgType::TrackProgress => ProgressEvent::TrackProgress {
                found_count: count("foundCount")?,
                not_found_count: count("notFoundCount")?
            },
            MsgType::JobFinished => ProgressEvent::JobFinished,
            MsgType::JobFailed => ProgressEvent::JobFailed {
                reason: self.msg.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("job failed")
                    .to_string()
            },
            MsgType::CsvFileError => ProgressEvent::CsvFileError
        };
        Ok((UserId(self.user_id), event))
    }
}

/// Publishing half, cloned into every job
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: mpsc::UnboundedSender<String>
}

impl ProgressBus {
    /// The bus and its single consumer. Nothing is dropped while the
    /// consumer is alive.
    pub fn channel() -> (Self, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Subscription { rx })
    }

    /// False once the consumer is gone and the event was lost
    pub fn publish(&self, user: &UserId, event: &ProgressEvent) -> bool {
        let payload = match serde_json::to_string(&Envelope::encode(user, event)) {
            Ok(p) => p,
            Err(e) => {
                warn!(user = %user, error = %e, "bus.encode.failed");
                return false;
            }
        };
        match self.tx.send(payload) {
            Ok(()) => true,
            Err(_) => {
                debug!(user = %user, ?event, "bus.no_subscriber");
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>
}

impl Subscription {
    /// Next decodable event, `None` once every publisher is gone
    pub async fn next(&mut self) -> Option<(UserId, ProgressEvent)> {
        while let Some(payload) = self.rx.recv().await {
            let decoded = serde_json::from_str::<Envelope>(&payload)
                .map_err(TransferError::from)
                .and_then(Envelope::decode);
            match decoded {
                Ok(event) => return Some(event),
                Err(e) => warn!(error = %e, "bus.decode.failed")
            }
        }
        None
    }
}
