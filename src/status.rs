use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

pub const BROADCAST_CAPACITY: usize = 256;
pub const RETAINED_FINISHED_CAP: usize = 256; //done/error keys kept for new clients

/// One message per lifecycle transition of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Accepted,
    Deferred,
    SentToBox,
    BoxAck,
    Applied,
    Completed,
    Error,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Completed | TxStatus::Error)
    }
}

/// Coarse per-`request_key` projection for dashboards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Queued,
    Sent,
    Acked,
    Applied,
    Done,
    Error,
}

impl KeyState {
    /// States that make a new identical request a duplicate.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            KeyState::Queued | KeyState::Sent | KeyState::Acked | KeyState::Applied
        )
    }
}

/// Status-specific extension fields; each key is only set where noted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultExtra {
    /// deferred, error: delivery attempts so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// deferred: seconds until the next attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_in: Option<u64>,
    /// sent_to_box, box_ack: device connection carrying the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<u64>,
    /// sent_to_box: device the frame was addressed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// applied: value reported before the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    /// any status of a system-generated maintenance transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub tx_id: Option<String>,
    pub request_key: Option<String>,
    pub tbl_name: Option<String>,
    pub tbl_item: Option<String>,
    pub new_value: Option<String>,
    pub status: TxStatus,
    pub error: Option<String>,
    pub detail: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: ResultExtra,
}

impl CommandResult {
    pub fn new(status: TxStatus) -> Self {
        Self {
            tx_id: None,
            request_key: None,
            tbl_name: None,
            tbl_item: None,
            new_value: None,
            status,
            error: None,
            detail: None,
            ts: Utc::now(),
            extra: ResultExtra::default(),
        }
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Wire envelope on the administrative socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Result(CommandResult),
    KeyStatus {
        request_key: String,
        state: KeyState,
        ts: DateTime<Utc>,
    },
}

/// Outward boundary of the command pipeline.
pub trait ResultSink: Send + Sync {
    fn publish_result(&self, result: &CommandResult);
    fn publish_key_state(&self, request_key: &str, state: KeyState);
}

#[derive(Default)]
struct Retained {
    states: BTreeMap<String, ControlMessage>,
    //finished keys, oldest first
    finished: VecDeque<String>,
}

impl Retained {
    fn insert(&mut self, request_key: &str, state: KeyState, msg: ControlMessage) {
        self.finished.retain(|k| k != request_key);
        self.states.insert(request_key.to_string(), msg);
        if state.is_pending() {
            return;
        }
        self.finished.push_back(request_key.to_string());
        while self.finished.len() > RETAINED_FINISHED_CAP {
            if let Some(oldest) = self.finished.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

/// Fans messages out to every control client and retains key states.
///
/// Pending keys are retained until they finish, finished ones only up to
/// [`RETAINED_FINISHED_CAP`].
pub struct BroadcastSink {
    pub name: String,
    sender: broadcast::Sender<ControlMessage>,
    retained: Mutex<Retained>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            name: "results".to_string(),
            sender,
            retained: Mutex::new(Retained::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.sender.subscribe()
    }

    /// Last key state per `request_key`, replayed to new clients.
    pub fn retained(&self) -> Vec<ControlMessage> {
        self.retained
            .lock()
            .map(|r| r.states.values().cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, msg: ControlMessage) {
        //no subscribers is fine
        let _ = self.sender.send(msg);
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        BroadcastSink::new()
    }
}

impl ResultSink for BroadcastSink {
    fn publish_result(&self, result: &CommandResult) {
        let level = if result.status.is_terminal() {
            log::Level::Info
        } else {
            log::Level::Debug
        };
        log!(
            level,
            "{}: tx {} {}: {:?}{}{}",
            self.name,
            result.tx_id.as_deref().unwrap_or("-"),
            result.request_key.as_deref().unwrap_or("-"),
            result.status,
            result
                .error
                .as_ref()
                .map(|e| format!(", error: {}", e))
                .unwrap_or_default(),
            result
                .detail
                .as_ref()
                .map(|d| format!(", detail: {}", d))
                .unwrap_or_default(),
        );
        self.send(ControlMessage::Result(result.clone()));
    }

    fn publish_key_state(&self, request_key: &str, state: KeyState) {
        let msg = ControlMessage::KeyStatus {
            request_key: request_key.to_string(),
            state,
            ts: Utc::now(),
        };
        if let Ok(mut retained) = self.retained.lock() {
            retained.insert(request_key, state, msg.clone());
        }
        self.send(msg);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_with_flat_extra() {
        let mut r = CommandResult::new(TxStatus::Deferred).with_detail("timeout_waiting_ack");
        r.tx_id = Some("t1".into());
        r.extra.attempts = Some(2);
        r.extra.next_attempt_in = Some(120);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "deferred");
        assert_eq!(v["detail"], "timeout_waiting_ack");
        assert_eq!(v["attempts"], 2);
        assert_eq!(v["next_attempt_in"], 120);
        assert!(v.get("conn_id").is_none());
        assert!(v["error"].is_null());
    }

    #[test]
    fn envelope_is_tagged() {
        let msg = ControlMessage::KeyStatus {
            request_key: "tbl_box_prms/MODE/2".into(),
            state: KeyState::Acked,
            ts: Utc::now(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "key_status");
        assert_eq!(v["state"], "acked");

        let v = serde_json::to_value(&ControlMessage::Result(CommandResult::new(
            TxStatus::SentToBox,
        )))
        .unwrap();
        assert_eq!(v["type"], "result");
        assert_eq!(v["status"], "sent_to_box");
    }

    #[tokio::test]
    async fn broadcast_sink_retains_last_key_state() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        sink.publish_key_state("k", KeyState::Queued);
        sink.publish_key_state("k", KeyState::Sent);
        sink.publish_result(&CommandResult::new(TxStatus::Accepted));

        assert!(matches!(
            rx.recv().await.unwrap(),
            ControlMessage::KeyStatus {
                state: KeyState::Queued,
                ..
            }
        ));
        let retained = sink.retained();
        assert_eq!(retained.len(), 1);
        assert!(matches!(
            &retained[0],
            ControlMessage::KeyStatus {
                state: KeyState::Sent,
                ..
            }
        ));
    }

    #[test]
    fn finished_keys_are_evicted_oldest_first() {
        let sink = BroadcastSink::new();
        sink.publish_key_state("pending", KeyState::Acked);
        for i in 0..RETAINED_FINISHED_CAP + 10 {
            sink.publish_key_state(&format!("k{}", i), KeyState::Done);
        }
        //refreshing a key moves it to the back
        sink.publish_key_state("k10", KeyState::Error);
        sink.publish_key_state("k11", KeyState::Done);

        let keys: Vec<String> = sink
            .retained()
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::KeyStatus { request_key, .. } => Some(request_key),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), RETAINED_FINISHED_CAP + 1);
        assert!(keys.contains(&"pending".to_string()));
        assert!(!keys.contains(&"k0".to_string()));
        assert!(!keys.contains(&"k9".to_string()));
        assert!(keys.contains(&"k10".to_string()));
        assert!(keys.contains(&"k11".to_string()));
        assert!(keys.contains(&format!("k{}", RETAINED_FINISHED_CAP + 9)));
    }
}
