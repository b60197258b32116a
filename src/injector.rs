use crate::error::ProxyError;
use crate::frame::{build_setting_frame, SettingFrame, DEFAULT_CONFIRM};
use crate::session::SessionState;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub const ACK_TEXT: &str = "<Result>ACK</Result>";
pub const NACK_TEXT: &str = "<Result>NACK</Result>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack,
}

/// Device answer to a delivered command, correlated to its transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub tx_id: String,
    pub request_key: String,
    pub conn_id: u64,
    pub outcome: AckOutcome,
}

#[derive(Clone, Debug)]
pub struct StageRequest<'a> {
    pub tx_id: &'a str,
    pub request_key: &'a str,
    pub device_id: &'a str,
    pub table: &'a str,
    pub item: &'a str,
    pub value: &'a str,
    pub confirm: Option<&'a str>,
}

#[derive(Clone, Debug)]
struct Delivered {
    conn_id: u64,
    at: Instant,
    //the next frame on `conn_id` was not an ACK/NACK
    unanswered: bool,
}

/// The single command frame waiting for (or just past) delivery.
#[derive(Clone, Debug)]
pub struct PendingDelivery {
    pub tx_id: String,
    pub request_key: String,
    pub frame: String,
    pub frame_id: u64,
    pub id_set: u64,
    delivered: Option<Delivered>,
}

impl PendingDelivery {
    pub fn delivered_on(&self) -> Option<u64> {
        self.delivered.as_ref().map(|d| d.conn_id)
    }
}

pub struct SettingsInjector {
    pub name: String,
    ack_timeout: Duration,
    session: Arc<SessionState>,
    slot: Mutex<Option<PendingDelivery>>,
    next_id: AtomicU64,
}

impl SettingsInjector {
    pub fn new(session: Arc<SessionState>, ack_timeout: Duration) -> Self {
        Self {
            name: "injector".to_string(),
            ack_timeout,
            session,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(Utc::now().timestamp().max(0) as u64),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PendingDelivery>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds the command frame and parks it until the next delivery poll.
    pub fn stage(&self, req: &StageRequest) -> Result<u64, ProxyError> {
        let mut slot = self.slot();
        if let Some(pending) = slot.as_ref() {
            if pending.tx_id != req.tx_id {
                return Err(ProxyError::SlotBusy(pending.tx_id.clone()));
            }
        }

        let id_set = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame_id = id_set % 1_000_000;
        let frame = build_setting_frame(&SettingFrame {
            id: frame_id,
            id_set,
            device_id: req.device_id,
            table: req.table,
            item: req.item,
            new_value: req.value,
            confirm: req.confirm.unwrap_or(DEFAULT_CONFIRM),
            now: Utc::now(),
        });
        debug!(
            "{}: staged tx {} ({}) as ID_Set {}",
            self.name, req.tx_id, req.request_key, id_set
        );
        *slot = Some(PendingDelivery {
            tx_id: req.tx_id.to_string(),
            request_key: req.request_key.to_string(),
            frame,
            frame_id,
            id_set,
            delivered: None,
        });
        Ok(id_set)
    }

    /// Hands out the staged frame once, recording the connection that got it.
    ///
    /// Only the current device connection gets it, never an older one still draining.
    pub fn take_for_delivery(&self, conn_id: u64) -> Option<String> {
        let mut slot = self.slot();
        let pending = slot.as_mut()?;
        if pending.delivered.is_some() {
            return None;
        }
        let current = self.session.current_conn_id();
        if current != Some(conn_id) {
            debug!(
                "{}: poll on conn {} but the current connection is {:?}, keeping tx {}",
                self.name, conn_id, current, pending.tx_id
            );
            return None;
        }
        pending.delivered = Some(Delivered {
            conn_id,
            at: Instant::now(),
            unanswered: false,
        });
        info!(
            "{}: 📤 delivering tx {} ({}) on conn {}",
            self.name, pending.tx_id, pending.request_key, conn_id
        );
        Some(pending.frame.clone())
    }

    /// Correlates a device frame with the delivered command.
    ///
    /// Only the first frame the delivering connection sends after the command
    /// counts. If that frame is not an ACK/NACK, the delivery stays unanswered
    /// until the pipeline's ack timer gives up on it.
    pub fn observe(&self, conn_id: u64, frame: &str) -> Option<DeliveryResponse> {
        let outcome = if frame.contains(NACK_TEXT) {
            Some(AckOutcome::Nack)
        } else if frame.contains(ACK_TEXT) {
            Some(AckOutcome::Ack)
        } else {
            None
        };

        let mut slot = self.slot();
        let pending = slot.as_mut()?;
        let delivered = match pending.delivered.as_mut() {
            Some(d) => d,
            None => {
                if let Some(outcome) = outcome {
                    debug!(
                        "{}: {:?} on conn {} but tx {} not delivered yet, ignoring",
                        self.name, outcome, conn_id, pending.tx_id
                    );
                }
                return None;
            }
        };
        if delivered.conn_id != conn_id {
            if let Some(outcome) = outcome {
                let err = ProxyError::ForeignAck {
                    tx_id: pending.tx_id.clone(),
                    expected: delivered.conn_id,
                    got: conn_id,
                };
                warn!("{}: ignoring {:?}: {}", self.name, outcome, err);
                self.session.foreign_acks.fetch_add(1, Ordering::SeqCst);
            }
            return None;
        }
        if delivered.unanswered {
            if let Some(outcome) = outcome {
                debug!(
                    "{}: {:?} on conn {} no longer answers tx {}, ignoring",
                    self.name, outcome, conn_id, pending.tx_id
                );
            }
            return None;
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                delivered.unanswered = true;
                warn!(
                    "{}: conn {} did not answer tx {}, waiting for the ack timeout",
                    self.name, conn_id, pending.tx_id
                );
                return None;
            }
        };
        if delivered.at.elapsed() > self.ack_timeout {
            delivered.unanswered = true;
            warn!(
                "{}: late {:?} for tx {} after {:?}, ignoring",
                self.name,
                outcome,
                pending.tx_id,
                delivered.at.elapsed()
            );
            return None;
        }

        let pending = slot.take()?;
        info!(
            "{}: 📥 device {:?} for tx {} on conn {}",
            self.name, outcome, pending.tx_id, conn_id
        );
        Some(DeliveryResponse {
            tx_id: pending.tx_id,
            request_key: pending.request_key,
            conn_id,
            outcome,
        })
    }

    /// Undelivered frames survive a reconnect, delivered-but-unanswered ones do not.
    pub fn on_disconnect(&self, conn_id: u64) -> Option<String> {
        let mut slot = self.slot();
        match slot.as_ref().map(|p| p.delivered_on()) {
            Some(Some(delivered_on)) if delivered_on == conn_id => {
                let pending = slot.take()?;
                warn!(
                    "{}: conn {} closed before answering tx {}, discarding delivery",
                    self.name, conn_id, pending.tx_id
                );
                Some(pending.tx_id)
            }
            Some(None) => {
                debug!(
                    "{}: conn {} closed, keeping undelivered command for the next connection",
                    self.name, conn_id
                );
                None
            }
            _ => None,
        }
    }

    pub fn cancel(&self, tx_id: &str) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().map(|p| p.tx_id == tx_id).unwrap_or(false) {
            *slot = None;
            debug!("{}: tx {} removed from delivery slot", self.name, tx_id);
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> Option<PendingDelivery> {
        self.slot().clone()
    }

    pub fn is_free(&self) -> bool {
        self.slot().is_none()
    }
}
