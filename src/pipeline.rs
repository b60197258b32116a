use crate::config::ControlConfig;
use crate::error::{CommandError, ProxyError};
use crate::event_log::{parse_setting_event, SettingChange};
use crate::frame::{tag_pairs, FrameKind};
use crate::injector::{AckOutcome, DeliveryResponse, SettingsInjector, StageRequest};
use crate::pending_store::PendingStore;
use crate::session::SessionState;
use crate::status::{CommandResult, KeyState, ResultSink, TxStatus};
use crate::whitelist::{
    is_known_table, is_maintenance_item, is_mode_item, lookup, normalize, request_key,
    same_value, split_request_key, MAINTENANCE_ITEM, MAINTENANCE_TABLE, MAINTENANCE_VALUE,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub const DETAIL_DUPLICATE: &str = "duplicate_ignored";
pub const DETAIL_NOOP: &str = "noop_already_set";
pub const DETAIL_APPLIED: &str = "applied";
pub const DETAIL_MARKER: &str = "marker_frame_confirmed";
pub const DETAIL_QUIET: &str = "mode_quiet_elapsed";
pub const DETAIL_CANCELED: &str = "canceled";
pub const REASON_NOT_CONNECTED: &str = "box_not_connected";
pub const REASON_ACK_TIMEOUT: &str = "timeout_waiting_ack";
pub const REASON_APPLIED_TIMEOUT: &str = "timeout_waiting_applied";
pub const REASON_NACK: &str = "box_nack";
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";
pub const REASON_RESTART: &str = "proxy_restart";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Deferred,
    SentToBox,
    BoxAck,
    Applied,
    Completed,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Ack,
    Applied,
    Quiet,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    tx_id: Option<Value>,
    tbl_name: Option<String>,
    tbl_item: Option<String>,
    new_value: Option<Value>,
    confirm: Option<String>,
    request_key: Option<String>,
}

struct Transaction {
    tx_id: String,
    table: String,
    item: String,
    value: String,
    confirm: Option<String>,
    request_key: String,
    stage: Stage,
    attempts: u32,
    internal: bool,
    created_at: Instant,
    sent_at: Option<Instant>,
    acked_at: Option<Instant>,
    applied_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    conn_id: Option<u64>,
    generation: u64,
    timers: Vec<JoinHandle<()>>,
}

impl Transaction {
    fn is_item(&self, table: &str, item: &str) -> bool {
        self.table == table && self.item == item
    }
}

struct TimerRequest {
    tx_id: String,
    generation: u64,
    kind: TimerKind,
    delay: Duration,
}

/// Work that must happen after the state lock is released.
#[derive(Default)]
struct Effects {
    timers: Vec<TimerRequest>,
    wake: Option<Duration>,
}

#[derive(Default)]
struct PipelineState {
    queue: VecDeque<Transaction>,
    inflight: Option<Transaction>,
    key_states: HashMap<String, KeyState>,
    last_values: HashMap<(String, String), String>,
    persisted: BTreeSet<String>,
    wake: Option<JoinHandle<()>>,
}

impl PipelineState {
    fn has_item(&self, table: &str, item: &str) -> bool {
        self.inflight
            .iter()
            .chain(self.queue.iter())
            .any(|tx| tx.is_item(table, item))
    }

    fn pending_keys(&self) -> BTreeSet<String> {
        self.inflight
            .iter()
            .chain(self.queue.iter())
            .map(|tx| tx.request_key.clone())
            .collect()
    }
}

/// Runs operator commands through delivery, device acknowledgement and
/// applied-value confirmation, one transaction at a time.
///
/// Every transition happens under a single mutex. Stage timers are spawned
/// only after it is released and carry the generation they were armed for,
/// so a timer that lost the race against a newer transition does nothing.
pub struct CommandPipeline {
    pub name: String,
    cfg: ControlConfig,
    session: Arc<SessionState>,
    injector: Arc<SettingsInjector>,
    sink: Arc<dyn ResultSink>,
    store: PendingStore,
    state: Mutex<PipelineState>,
    generation: AtomicU64,
    next_internal: AtomicU64,
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl CommandPipeline {
    pub fn new(
        cfg: ControlConfig,
        session: Arc<SessionState>,
        injector: Arc<SettingsInjector>,
        sink: Arc<dyn ResultSink>,
        store: PendingStore,
    ) -> Self {
        Self {
            name: "pipeline".to_string(),
            cfg,
            session,
            injector,
            sink,
            store,
            state: Mutex::new(PipelineState::default()),
            generation: AtomicU64::new(0),
            next_internal: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `(tx_id, stage)` of the transaction currently holding the inflight slot.
    pub fn inflight(&self) -> Option<(String, Stage)> {
        self.state()
            .inflight
            .as_ref()
            .map(|tx| (tx.tx_id.clone(), tx.stage))
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    fn result(&self, tx: &Transaction, status: TxStatus) -> CommandResult {
        let mut r = CommandResult::new(status);
        r.tx_id = Some(tx.tx_id.clone());
        r.request_key = Some(tx.request_key.clone());
        r.tbl_name = Some(tx.table.clone());
        r.tbl_item = Some(tx.item.clone());
        r.new_value = Some(tx.value.clone());
        if tx.internal {
            r.extra.internal = Some(true);
        }
        r
    }

    fn set_key(&self, keys: &mut HashMap<String, KeyState>, key: &str, state: KeyState) {
        //only pending keys gate duplicates, finished ones are dropped
        if state.is_pending() {
            keys.insert(key.to_string(), state);
        } else {
            keys.remove(key);
        }
        self.sink.publish_key_state(key, state);
    }

    fn transition(&self, tx: &mut Transaction, stage: Stage) {
        for timer in tx.timers.drain(..) {
            timer.abort();
        }
        tx.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "{}: tx {} {:?} -> {:?}",
            self.name, tx.tx_id, tx.stage, stage
        );
        tx.stage = stage;
    }

    fn arm(&self, tx: &Transaction, kind: TimerKind, delay: Duration, fx: &mut Effects) {
        fx.timers.push(TimerRequest {
            tx_id: tx.tx_id.clone(),
            generation: tx.generation,
            kind,
            delay,
        });
    }

    fn persist(&self, st: &mut PipelineState) {
        let keys = st.pending_keys();
        if keys == st.persisted {
            return;
        }
        match self.store.save(&keys) {
            Ok(()) => st.persisted = keys,
            Err(e) => error!("{}: cannot persist pending keys: {}", self.name, e),
        }
    }

    fn reject(&self, tx_id: Option<String>, err: &CommandError) -> CommandError {
        warn!(
            "{}: tx {}: {}",
            self.name,
            tx_id.as_deref().unwrap_or("-"),
            ProxyError::from(err.clone())
        );
        let mut r = CommandResult::new(TxStatus::Error)
            .with_error(err.code())
            .with_detail(&err.to_string());
        r.tx_id = tx_id;
        self.sink.publish_result(&r);
        err.clone()
    }

    /// Validates and enqueues an operator command given as a JSON object.
    ///
    /// Returns the status reported for it: `accepted`, or `completed` for a
    /// duplicate or no-op request.
    pub fn submit(self: &Arc<Self>, json: &str) -> Result<TxStatus, CommandError> {
        let value: Value = match serde_json::from_str(json) {
            Ok(v @ Value::Object(_)) => v,
            Ok(other) => {
                let err = CommandError::BadJson(format!("not an object: {}", other));
                return Err(self.reject(None, &err));
            }
            Err(e) => return Err(self.reject(None, &CommandError::BadJson(e.to_string()))),
        };
        let tx_hint = value.get("tx_id").filter(|v| !v.is_null()).map(text);
        let req: CommandRequest = serde_json::from_value(value)
            .map_err(|e| self.reject(tx_hint.clone(), &CommandError::BadJson(e.to_string())))?;

        let mut missing = vec![];
        if req.tx_id.as_ref().map_or(true, |v| v.is_null()) {
            missing.push("tx_id");
        }
        if req.tbl_name.is_none() {
            missing.push("tbl_name");
        }
        if req.tbl_item.is_none() {
            missing.push("tbl_item");
        }
        if req.new_value.as_ref().map_or(true, |v| v.is_null()) {
            missing.push("new_value");
        }
        let fields = (req.tx_id, req.tbl_name, req.tbl_item, req.new_value);
        let (tx_id, table, item, new_value) = match fields {
            (Some(tx_id), Some(table), Some(item), Some(new_value)) if missing.is_empty() => {
                (text(&tx_id), table, item, new_value)
            }
            _ => {
                let err = CommandError::MissingFields(missing.join(", "));
                return Err(self.reject(tx_hint, &err));
            }
        };

        let value = normalize(&table, &item, &new_value)
            .map_err(|e| self.reject(Some(tx_id.clone()), &e))?;
        let key = request_key(&table, &item, &value);
        if let Some(given) = req.request_key.as_deref().filter(|k| *k != key) {
            debug!(
                "{}: tx {} request_key {} normalized to {}",
                self.name, tx_id, given, key
            );
        }

        let tx = Transaction {
            tx_id,
            table,
            item,
            value,
            confirm: req.confirm,
            request_key: key,
            stage: Stage::Queued,
            attempts: 0,
            internal: false,
            created_at: Instant::now(),
            sent_at: None,
            acked_at: None,
            applied_at: None,
            next_attempt_at: None,
            conn_id: None,
            generation: 0,
            timers: vec![],
        };

        let mut guard = self.state();
        let st = &mut *guard;
        let mut fx = Effects::default();
        let status = self.admit(st, tx);
        self.pump_locked(st, &mut fx);
        self.persist(st);
        drop(guard);
        self.schedule(fx);
        Ok(status)
    }

    fn admit(&self, st: &mut PipelineState, tx: Transaction) -> TxStatus {
        if !tx.internal {
            self.preempt_internal(st, &tx);
        }

        if st
            .key_states
            .get(&tx.request_key)
            .map_or(false, |s| s.is_pending())
        {
            info!(
                "{}: tx {} duplicates pending {}, ignoring",
                self.name, tx.tx_id, tx.request_key
            );
            let r = self
                .result(&tx, TxStatus::Completed)
                .with_detail(DETAIL_DUPLICATE);
            self.sink.publish_result(&r);
            return TxStatus::Completed;
        }

        let current = st.last_values.get(&(tx.table.clone(), tx.item.clone()));
        let already_set = current.map_or(false, |v| same_value(v, &tx.value));
        if already_set && !st.has_item(&tx.table, &tx.item) {
            info!(
                "{}: tx {}: {}/{} is already {}",
                self.name, tx.tx_id, tx.table, tx.item, tx.value
            );
            self.sink
                .publish_result(&self.result(&tx, TxStatus::Completed).with_detail(DETAIL_NOOP));
            return TxStatus::Completed;
        }

        info!(
            "{}: tx {} accepted: {} ({}), {} ahead",
            self.name,
            tx.tx_id,
            tx.request_key,
            lookup(&tx.table, &tx.item).map_or("", |w| w.desc),
            st.queue.len() + st.inflight.iter().count()
        );
        self.sink.publish_result(&self.result(&tx, TxStatus::Accepted));
        self.set_key(&mut st.key_states, &tx.request_key, KeyState::Queued);
        st.queue.push_back(tx);
        TxStatus::Accepted
    }

    /// Drops or cancels the internal maintenance transaction when a user targets its item.
    fn preempt_internal(&self, st: &mut PipelineState, user: &Transaction) {
        let mut dropped = vec![];
        let mut i = 0;
        while i < st.queue.len() {
            if st.queue[i].internal && st.queue[i].is_item(&user.table, &user.item) {
                if let Some(tx) = st.queue.remove(i) {
                    dropped.push(tx);
                }
            } else {
                i += 1;
            }
        }
        if st
            .inflight
            .as_ref()
            .map_or(false, |tx| tx.internal && tx.is_item(&user.table, &user.item))
        {
            if let Some(tx) = st.inflight.take() {
                dropped.push(tx);
            }
        }
        for tx in dropped {
            info!(
                "{}: user tx {} preempts internal tx {} ({:?})",
                self.name, user.tx_id, tx.tx_id, tx.stage
            );
            self.finish(st, tx, TxStatus::Completed, None, DETAIL_CANCELED);
        }
    }

    fn enqueue_maintenance(&self, st: &mut PipelineState) {
        let key = request_key(MAINTENANCE_TABLE, MAINTENANCE_ITEM, MAINTENANCE_VALUE);
        if st.key_states.get(&key).map_or(false, |s| s.is_pending()) {
            return;
        }
        let seq = self.next_internal.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction {
            tx_id: format!("internal-{}-{}", chrono::Utc::now().timestamp(), seq),
            table: MAINTENANCE_TABLE.to_string(),
            item: MAINTENANCE_ITEM.to_string(),
            value: MAINTENANCE_VALUE.to_string(),
            confirm: None,
            request_key: key,
            stage: Stage::Queued,
            attempts: 0,
            internal: true,
            created_at: Instant::now(),
            sent_at: None,
            acked_at: None,
            applied_at: None,
            next_attempt_at: None,
            conn_id: None,
            generation: 0,
            timers: vec![],
        };
        info!("{}: 🔄 queue drained, scheduling re-sync tx {}", self.name, tx.tx_id);
        self.sink.publish_result(&self.result(&tx, TxStatus::Accepted));
        self.set_key(&mut st.key_states, &tx.request_key, KeyState::Queued);
        st.queue.push_back(tx);
    }

    /// Moves a transaction to a terminal stage.
    ///
    /// It must already be out of the queue and the inflight slot.
    fn finish(
        &self,
        st: &mut PipelineState,
        mut tx: Transaction,
        status: TxStatus,
        error: Option<&str>,
        detail: &str,
    ) {
        let ok = status == TxStatus::Completed;
        self.transition(&mut tx, if ok { Stage::Completed } else { Stage::Error });
        self.injector.cancel(&tx.tx_id);

        let mut r = self.result(&tx, status).with_detail(detail);
        if let Some(error) = error {
            r = r.with_error(error);
        }
        if !ok {
            r.extra.attempts = Some(tx.attempts);
        }
        self.sink.publish_result(&r);
        self.set_key(
            &mut st.key_states,
            &tx.request_key,
            if ok { KeyState::Done } else { KeyState::Error },
        );
        if ok {
            info!(
                "{}: ✅ tx {} {} completed ({}) after {:?}",
                self.name,
                tx.tx_id,
                tx.request_key,
                detail,
                tx.created_at.elapsed()
            );
        } else {
            let err = ProxyError::Lifecycle {
                tx_id: tx.tx_id.clone(),
                detail: error.unwrap_or(detail).to_string(),
            };
            error!("{}: {} ({}, after {:?})", self.name, err, detail, tx.created_at.elapsed());
        }
        debug!(
            "{}: tx {} timings: sent {:?} ago, acked {:?} ago, applied {:?} ago",
            self.name,
            tx.tx_id,
            tx.sent_at.map(|t| t.elapsed()),
            tx.acked_at.map(|t| t.elapsed()),
            tx.applied_at.map(|t| t.elapsed())
        );

        let trivial = detail == DETAIL_CANCELED;
        if ok && !trivial {
            st.last_values
                .insert((tx.table.clone(), tx.item.clone()), tx.value.clone());
        }
        if ok
            && !trivial
            && !tx.internal
            && self.cfg.maintenance
            && !is_maintenance_item(&tx.table, &tx.item)
            && st.queue.is_empty()
            && st.inflight.is_none()
        {
            self.enqueue_maintenance(st);
        }
    }

    fn pump_locked(&self, st: &mut PipelineState, fx: &mut Effects) {
        if st.inflight.is_some() {
            return;
        }
        let now = Instant::now();
        match st.queue.front() {
            None => return,
            Some(head) => {
                if let Some(at) = head.next_attempt_at.filter(|at| *at > now) {
                    fx.wake = Some(at - now);
                    return;
                }
            }
        }
        if !self
            .session
            .is_device_ready(self.cfg.min_uptime, self.cfg.data_fresh)
        {
            trace!("{}: device not ready, {} queued", self.name, st.queue.len());
            return;
        }
        let (conn_id, device_id) = match self.session.device() {
            Some(link) => match link.device_id {
                Some(id) => (link.conn_id, id),
                None => return,
            },
            None => return,
        };
        let mut tx = match st.queue.pop_front() {
            Some(tx) => tx,
            None => return,
        };

        let staged = self.injector.stage(&StageRequest {
            tx_id: &tx.tx_id,
            request_key: &tx.request_key,
            device_id: &device_id,
            table: &tx.table,
            item: &tx.item,
            value: &tx.value,
            confirm: tx.confirm.as_deref(),
        });
        if let Err(e) = staged {
            debug!("{}: cannot stage tx {}: {}", self.name, tx.tx_id, e);
            st.queue.push_front(tx);
            return;
        }

        self.transition(&mut tx, Stage::SentToBox);
        tx.sent_at = Some(now);
        tx.next_attempt_at = None;
        tx.conn_id = Some(conn_id);
        let mut r = self.result(&tx, TxStatus::SentToBox);
        r.extra.conn_id = Some(conn_id);
        r.extra.device_id = Some(device_id);
        self.sink.publish_result(&r);
        self.set_key(&mut st.key_states, &tx.request_key, KeyState::Sent);
        self.arm(&tx, TimerKind::Ack, self.cfg.ack_timeout, fx);
        st.inflight = Some(tx);
    }

    /// Starts the next queued transaction if the device and the delivery slot allow it.
    pub fn pump(self: &Arc<Self>) {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut fx = Effects::default();
        self.pump_locked(st, &mut fx);
        self.persist(st);
        drop(guard);
        self.schedule(fx);
    }

    /// Feeds one device frame, after the injector and forwarder have seen it.
    pub fn observe_frame(
        self: &Arc<Self>,
        conn_id: u64,
        frame: &str,
        kind: &FrameKind,
        response: Option<&DeliveryResponse>,
    ) {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut fx = Effects::default();

        if let FrameKind::Table(table) = kind {
            if is_known_table(table) {
                for (tag, value) in tag_pairs(frame) {
                    if lookup(table, tag).is_some() {
                        st.last_values
                            .insert((table.clone(), tag.to_string()), value.to_string());
                    }
                }
            }
        }

        if let Some(resp) = response {
            self.on_response(st, resp, &mut fx);
        } else if let Some(change) = parse_setting_event(frame) {
            debug!(
                "{}: conn {} reports {}/{}: [{}]->[{}]",
                self.name, conn_id, change.table, change.item, change.old, change.new
            );
            st.last_values
                .insert((change.table.clone(), change.item.clone()), change.new.clone());
            self.on_setting_change(st, &change, &mut fx);
        } else if kind.is_marker() {
            self.on_marker(st, conn_id, kind);
        }

        self.pump_locked(st, &mut fx);
        self.persist(st);
        drop(guard);
        self.schedule(fx);
    }

    fn on_response(&self, st: &mut PipelineState, resp: &DeliveryResponse, fx: &mut Effects) {
        let matches = st
            .inflight
            .as_ref()
            .map_or(false, |tx| tx.tx_id == resp.tx_id && tx.stage == Stage::SentToBox);
        if !matches {
            warn!(
                "{}: {:?} for tx {} does not match the inflight transaction",
                self.name, resp.outcome, resp.tx_id
            );
            return;
        }
        match resp.outcome {
            AckOutcome::Ack => {
                if let Some(tx) = st.inflight.as_mut() {
                    self.transition(tx, Stage::BoxAck);
                    tx.acked_at = Some(Instant::now());
                    let mut r = self.result(tx, TxStatus::BoxAck);
                    r.extra.conn_id = Some(resp.conn_id);
                    self.sink.publish_result(&r);
                    self.set_key(&mut st.key_states, &tx.request_key, KeyState::Acked);
                    self.arm(tx, TimerKind::Applied, self.cfg.applied_timeout, fx);
                }
            }
            AckOutcome::Nack => {
                if let Some(tx) = st.inflight.take() {
                    self.finish(st, tx, TxStatus::Error, Some(REASON_NACK), REASON_NACK);
                }
            }
        }
    }

    fn on_setting_change(&self, st: &mut PipelineState, change: &SettingChange, fx: &mut Effects) {
        let stage = match st.inflight.as_ref() {
            Some(tx) if change.confirms(&tx.table, &tx.item, &tx.value) => tx.stage,
            _ => return,
        };
        match stage {
            Stage::BoxAck => {
                let quiet = match st.inflight.as_mut() {
                    Some(tx) => {
                        self.transition(tx, Stage::Applied);
                        tx.applied_at = Some(Instant::now());
                        let mut r = self.result(tx, TxStatus::Applied);
                        r.extra.old_value = Some(change.old.clone());
                        self.sink.publish_result(&r);
                        self.set_key(&mut st.key_states, &tx.request_key, KeyState::Applied);
                        let quiet = is_mode_item(&tx.table, &tx.item);
                        if quiet {
                            self.arm(tx, TimerKind::Quiet, self.cfg.mode_quiet, fx);
                        }
                        quiet
                    }
                    None => return,
                };
                if !quiet {
                    if let Some(tx) = st.inflight.take() {
                        self.finish(st, tx, TxStatus::Completed, None, DETAIL_APPLIED);
                    }
                }
            }
            Stage::Applied => {
                if let Some(tx) = st.inflight.as_mut() {
                    debug!(
                        "{}: tx {} confirmed again, restarting {:?} quiet window",
                        self.name, tx.tx_id, self.cfg.mode_quiet
                    );
                    self.transition(tx, Stage::Applied);
                    self.arm(tx, TimerKind::Quiet, self.cfg.mode_quiet, fx);
                }
            }
            other => debug!(
                "{}: setting event for {}/{} while {:?}, ignoring",
                self.name, change.table, change.item, other
            ),
        }
    }

    fn on_marker(&self, st: &mut PipelineState, conn_id: u64, kind: &FrameKind) {
        if self.session.current_conn_id() != Some(conn_id) {
            debug!("{}: {:?} from stale conn {}, ignoring", self.name, kind, conn_id);
            return;
        }
        let confirmable = st
            .inflight
            .as_ref()
            .map_or(false, |tx| matches!(tx.stage, Stage::BoxAck | Stage::Applied));
        if !confirmable {
            return;
        }
        if let Some(tx) = st.inflight.take() {
            debug!("{}: {:?} closes the round trip of tx {}", self.name, kind, tx.tx_id);
            self.finish(st, tx, TxStatus::Completed, None, DETAIL_MARKER);
        }
    }

    fn on_timer(self: &Arc<Self>, tx_id: &str, generation: u64, kind: TimerKind) {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut fx = Effects::default();

        let stage = match st.inflight.as_ref() {
            Some(tx) if tx.tx_id == tx_id && tx.generation == generation => tx.stage,
            _ => {
                trace!("{}: stale {:?} timer for tx {}", self.name, kind, tx_id);
                return;
            }
        };
        match (kind, stage) {
            (TimerKind::Ack, Stage::SentToBox) => {
                if let Some(tx) = st.inflight.take() {
                    self.on_ack_timeout(st, tx);
                }
            }
            (TimerKind::Applied, Stage::BoxAck) => {
                if let Some(tx) = st.inflight.take() {
                    warn!(
                        "{}: tx {} acknowledged but not applied within {:?}",
                        self.name, tx.tx_id, self.cfg.applied_timeout
                    );
                    self.finish(
                        st,
                        tx,
                        TxStatus::Error,
                        Some(REASON_APPLIED_TIMEOUT),
                        REASON_APPLIED_TIMEOUT,
                    );
                }
            }
            (TimerKind::Quiet, Stage::Applied) => {
                if let Some(tx) = st.inflight.take() {
                    self.finish(st, tx, TxStatus::Completed, None, DETAIL_QUIET);
                }
            }
            _ => {
                trace!("{}: {:?} timer does not apply to {:?}", self.name, kind, stage);
                return;
            }
        }

        self.pump_locked(st, &mut fx);
        self.persist(st);
        drop(guard);
        self.schedule(fx);
    }

    fn on_ack_timeout(&self, st: &mut PipelineState, mut tx: Transaction) {
        let delivered_on = self
            .injector
            .pending()
            .filter(|p| p.tx_id == tx.tx_id)
            .and_then(|p| p.delivered_on())
            .or(tx.conn_id);
        self.injector.cancel(&tx.tx_id);
        let current = self.session.current_conn_id();
        let reason = if current.is_none() || current != delivered_on {
            REASON_NOT_CONNECTED
        } else {
            REASON_ACK_TIMEOUT
        };
        tx.attempts += 1;

        if tx.attempts >= self.cfg.max_attempts {
            error!(
                "{}: tx {} gave up after {} attempts ({})",
                self.name, tx.tx_id, tx.attempts, reason
            );
            self.finish(st, tx, TxStatus::Error, Some(REASON_MAX_ATTEMPTS), reason);
            return;
        }

        self.transition(&mut tx, Stage::Deferred);
        tx.next_attempt_at = Some(Instant::now() + self.cfg.retry_delay);
        warn!(
            "{}: tx {} deferred ({}), attempt {}/{}, retry in {}",
            self.name,
            tx.tx_id,
            reason,
            tx.attempts,
            self.cfg.max_attempts,
            humantime::format_duration(self.cfg.retry_delay)
        );
        let mut r = self.result(&tx, TxStatus::Deferred).with_detail(reason);
        r.extra.attempts = Some(tx.attempts);
        r.extra.next_attempt_in = Some(self.cfg.retry_delay.as_secs());
        self.sink.publish_result(&r);
        self.set_key(&mut st.key_states, &tx.request_key, KeyState::Queued);
        st.queue.push_front(tx);
    }

    fn schedule(self: &Arc<Self>, fx: Effects) {
        for req in fx.timers {
            let pipeline = Arc::clone(self);
            let (tx_id, generation, kind) = (req.tx_id.clone(), req.generation, req.kind);
            let delay = req.delay;
            let handle = tokio::spawn(async move {
                sleep(delay).await;
                pipeline.on_timer(&tx_id, generation, kind);
            });
            let mut st = self.state();
            match st
                .inflight
                .as_mut()
                .filter(|tx| tx.tx_id == req.tx_id && tx.generation == req.generation)
            {
                Some(tx) => tx.timers.push(handle),
                None => handle.abort(),
            }
        }

        if let Some(delay) = fx.wake {
            let pipeline = Arc::clone(self);
            let handle = tokio::spawn(async move {
                sleep(delay).await;
                pipeline.pump();
            });
            if let Some(old) = self.state().wake.replace(handle) {
                old.abort();
            }
        }
    }

    /// Reports commands left unfinished by the previous run, then forgets them.
    pub fn recover_from_restart(&self) -> usize {
        let keys = match self.store.load() {
            Ok(keys) => keys,
            Err(e) => {
                error!("{}: cannot read restart state: {}", self.name, e);
                return 0;
            }
        };
        let mut guard = self.state();
        let st = &mut *guard;
        for key in &keys {
            warn!("{}: {} was pending when the proxy stopped", self.name, key);
            let mut r = CommandResult::new(TxStatus::Error)
                .with_error(REASON_RESTART)
                .with_detail(REASON_RESTART);
            r.request_key = Some(key.clone());
            if let Some((table, item, value)) = split_request_key(key) {
                r.tbl_name = Some(table.to_string());
                r.tbl_item = Some(item.to_string());
                r.new_value = Some(value.to_string());
            }
            self.sink.publish_result(&r);
            self.set_key(&mut st.key_states, key, KeyState::Error);
        }
        if let Err(e) = self.store.clear() {
            error!("{}: cannot clear restart state: {}", self.name, e);
        }
        st.persisted.clear();
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::Mode;
    use crate::frame::{classify, tag_value};
    use crate::status::testing::MemorySink;
    use tempfile::TempDir;

    const DEVICE: &str = "2206237016";
    const ACK: &str = "<Frame><ID_Device>2206237016</ID_Device><Result>ACK</Result><Reason>Setting</Reason></Frame>";
    const NACK: &str = "<Frame><ID_Device>2206237016</ID_Device><Result>NACK</Result><Reason>Setting</Reason></Frame>";
    const POLL: &str = "<Frame><ID_Device>2206237016</ID_Device><Result>IsNewSet</Result></Frame>";

    fn event(table: &str, item: &str, old: &str, new: &str) -> String {
        format!(
            "<Frame><TblName>tbl_events</TblName><ID_Device>{}</ID_Device><Type>Setting</Type>\
             <Content>Remotely : {} / {}: [{}]->[{}]</Content></Frame>",
            DEVICE, table, item, old, new
        )
    }

    fn command(tx_id: &str, table: &str, item: &str, value: &str) -> String {
        format!(
            r#"{{"tx_id":"{}","tbl_name":"{}","tbl_item":"{}","new_value":"{}"}}"#,
            tx_id, table, item, value
        )
    }

    fn test_cfg() -> ControlConfig {
        ControlConfig {
            min_uptime: Duration::ZERO,
            data_fresh: Duration::from_secs(3600),
            maintenance: false,
            ..ControlConfig::default()
        }
    }

    struct Harness {
        session: Arc<SessionState>,
        injector: Arc<SettingsInjector>,
        sink: Arc<MemorySink>,
        pipeline: Arc<CommandPipeline>,
        conn: u64,
        dir: TempDir,
    }

    impl Harness {
        fn new(cfg: ControlConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let session = Arc::new(SessionState::new(Mode::Online, 3, Duration::from_secs(60)));
            let injector = Arc::new(SettingsInjector::new(session.clone(), cfg.ack_timeout));
            let sink = Arc::new(MemorySink::default());
            let pipeline = Arc::new(CommandPipeline::new(
                cfg,
                session.clone(),
                injector.clone(),
                sink.clone(),
                PendingStore::new(dir.path().join("state.json")),
            ));
            let mut h = Harness {
                session,
                injector,
                sink,
                pipeline,
                conn: 0,
                dir,
            };
            h.connect();
            h
        }

        fn connect(&mut self) {
            self.conn = self.session.next_conn_id();
            self.session
                .device_connected(self.conn, "10.0.0.5:40000".into());
            self.session.frame_received(self.conn, Some(DEVICE));
        }

        fn disconnect(&self) {
            self.injector.on_disconnect(self.conn);
            self.session.device_disconnected(self.conn);
        }

        fn frame_on(&self, conn: u64, frame: &str) {
            let resp = self.injector.observe(conn, frame);
            self.session
                .frame_received(conn, tag_value(frame, "ID_Device"));
            self.pipeline
                .observe_frame(conn, frame, &classify(frame), resp.as_ref());
        }

        fn frame(&self, frame: &str) {
            self.frame_on(self.conn, frame);
        }

        fn deliver(&self) -> String {
            self.injector.take_for_delivery(self.conn).unwrap()
        }

        fn submit(&self, tx: &str, table: &str, item: &str, value: &str) -> TxStatus {
            self.pipeline
                .submit(&command(tx, table, item, value))
                .unwrap()
        }

        fn stored(&self) -> BTreeSet<String> {
            PendingStore::new(self.dir.path().join("state.json"))
                .load()
                .unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_round_trip_with_quiet_restart() {
        let h = Harness::new(test_cfg());
        assert_eq!(h.submit("t1", "tbl_box_prms", "MODE", "2"), TxStatus::Accepted);
        assert_eq!(h.sink.statuses("t1"), vec![TxStatus::Accepted, TxStatus::SentToBox]);
        assert_eq!(h.stored().len(), 1);

        let frame = h.deliver();
        assert_eq!(tag_value(&frame, "NewValue"), Some("2"));
        assert_eq!(tag_value(&frame, "ID_Device"), Some(DEVICE));

        h.frame(ACK);
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::BoxAck)));
        assert_eq!(
            h.sink.last_key_state("tbl_box_prms/MODE/2"),
            Some(KeyState::Acked)
        );

        h.frame(&event("tbl_box_prms", "MODE", "1", "2"));
        let applied = h.sink.last("t1").unwrap();
        assert_eq!(applied.status, TxStatus::Applied);
        assert_eq!(applied.extra.old_value.as_deref(), Some("1"));

        sleep(Duration::from_secs(10)).await;
        h.frame(&event("tbl_box_prms", "MODE", "1", "2"));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::Applied)));

        sleep(Duration::from_secs(6)).await;
        assert_eq!(
            h.sink.statuses("t1"),
            vec![
                TxStatus::Accepted,
                TxStatus::SentToBox,
                TxStatus::BoxAck,
                TxStatus::Applied,
                TxStatus::Completed
            ]
        );
        assert_eq!(h.sink.last("t1").unwrap().detail.as_deref(), Some(DETAIL_QUIET));
        assert_eq!(h.sink.last_key_state("tbl_box_prms/MODE/2"), Some(KeyState::Done));
        assert!(h.pipeline.inflight().is_none());
        assert!(h.stored().is_empty());
        assert!(h.pipeline.state().key_states.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_and_noops_never_enter_the_pipeline() {
        let h = Harness::new(test_cfg());
        h.submit("t1", "tbl_box_prms", "MODE", "2");
        assert_eq!(h.submit("t2", "tbl_box_prms", "MODE", "2.0"), TxStatus::Completed);
        assert_eq!(h.sink.statuses("t2"), vec![TxStatus::Completed]);
        assert_eq!(
            h.sink.last("t2").unwrap().detail.as_deref(),
            Some(DETAIL_DUPLICATE)
        );

        h.frame("<Frame><TblName>tbl_batt_prms</TblName><ID_Device>2206237016</ID_Device><BAT_MIN>30</BAT_MIN></Frame>");
        assert_eq!(h.submit("t3", "tbl_batt_prms", "BAT_MIN", "30"), TxStatus::Completed);
        assert_eq!(h.sink.last("t3").unwrap().detail.as_deref(), Some(DETAIL_NOOP));

        assert_eq!(h.submit("t4", "tbl_batt_prms", "BAT_MIN", "40"), TxStatus::Accepted);
        assert_eq!(h.pipeline.queue_len(), 1);
    }

    #[tokio::test]
    async fn invalid_commands_are_rejected_with_codes() {
        let h = Harness::new(test_cfg());
        let not_allowed = command("b", "tbl_box_prms", "ID_Device", "1");
        let bad_value = command("c", "tbl_box_prms", "MODE", "9");
        let cases = [
            ("{not json", "bad_json"),
            ("[1,2]", "bad_json"),
            (r#"{"tx_id":"a","tbl_name":"tbl_box_prms"}"#, "missing_fields"),
            (not_allowed.as_str(), "not_allowed"),
            (bad_value.as_str(), "bad_value"),
        ];
        for (json, code) in cases.iter() {
            let err = h.pipeline.submit(json).unwrap_err();
            assert_eq!(err.code(), *code, "{}", json);
        }
        let results = h.sink.results();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.status == TxStatus::Error));
        assert_eq!(results[2].tx_id.as_deref(), Some("a"));
        assert_eq!(results[2].detail.as_deref().map(|d| d.contains("tbl_item")), Some(true));
        assert_eq!(results[3].error.as_deref(), Some("not_allowed"));
        assert!(h.pipeline.inflight().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_keep_one_inflight() {
        let h = Harness::new(test_cfg());
        let items = [
            ("tbl_box_prms", "MODE", "1"),
            ("tbl_batt_prms", "BAT_MIN", "25"),
            ("tbl_boiler_prms", "ISON", "1"),
            ("tbl_boiler_prms", "MANUAL", "0"),
            ("tbl_invertor_prms", "TO_GRID", "1"),
            ("tbl_invertor_prm1", "AAC_MAX_CHRG", "12"),
        ];
        let mut tasks = vec![];
        for (i, (table, item, value)) in items.iter().enumerate() {
            let pipeline = h.pipeline.clone();
            let json = command(&format!("c{}", i), table, item, value);
            tasks.push(tokio::spawn(async move { pipeline.submit(&json) }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), TxStatus::Accepted);
        }

        let sent = h
            .sink
            .results()
            .iter()
            .filter(|r| r.status == TxStatus::SentToBox)
            .count();
        assert_eq!(sent, 1);
        assert!(h.pipeline.inflight().is_some());
        assert_eq!(h.pipeline.queue_len(), items.len() - 1);
        assert_eq!(h.injector.pending().unwrap().tx_id, h.pipeline.inflight().unwrap().0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_on_another_connection_does_not_advance() {
        let h = Harness::new(test_cfg());
        h.submit("t1", "tbl_box_prms", "MODE", "3");
        h.deliver();

        let other = h.session.next_conn_id();
        h.frame_on(other, ACK);
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::SentToBox)));
        assert!(!h.sink.statuses("t1").contains(&TxStatus::BoxAck));

        h.frame(ACK);
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::BoxAck)));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_defers_then_retries() {
        let h = Harness::new(test_cfg());
        h.submit("t1", "tbl_batt_prms", "BAT_MIN", "35");
        h.deliver();

        sleep(Duration::from_secs(61)).await;
        let deferred = h.sink.last("t1").unwrap();
        assert_eq!(deferred.status, TxStatus::Deferred);
        assert_eq!(deferred.detail.as_deref(), Some(REASON_ACK_TIMEOUT));
        assert_eq!(deferred.extra.attempts, Some(1));
        assert_eq!(deferred.extra.next_attempt_in, Some(120));
        assert!(h.injector.is_free());
        assert_eq!(h.sink.last_key_state("tbl_batt_prms/BAT_MIN/35"), Some(KeyState::Queued));

        //frames before the retry time do not restart it early
        h.frame(POLL);
        assert!(h.pipeline.inflight().is_none());

        sleep(Duration::from_secs(121)).await;
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::SentToBox)));
        h.deliver();
        h.frame(ACK);
        h.frame(&event("tbl_batt_prms", "BAT_MIN", "20", "35"));
        assert_eq!(
            h.sink.statuses("t1"),
            vec![
                TxStatus::Accepted,
                TxStatus::SentToBox,
                TxStatus::Deferred,
                TxStatus::SentToBox,
                TxStatus::BoxAck,
                TxStatus::Applied,
                TxStatus::Completed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_defers_and_max_attempts_errors() {
        let mut h = Harness::new(ControlConfig {
            max_attempts: 2,
            ..test_cfg()
        });
        h.submit("t1", "tbl_box_prms", "MODE", "1");
        h.deliver();
        h.disconnect();

        sleep(Duration::from_secs(61)).await;
        assert_eq!(
            h.sink.last("t1").unwrap().detail.as_deref(),
            Some(REASON_NOT_CONNECTED)
        );

        sleep(Duration::from_secs(121)).await;
        assert!(h.pipeline.inflight().is_none(), "no device to deliver to");

        h.connect();
        h.frame(POLL);
        assert_eq!(h.pipeline.inflight(), Some(("t1".into(), Stage::SentToBox)));

        sleep(Duration::from_secs(61)).await;
        let last = h.sink.last("t1").unwrap();
        assert_eq!(last.status, TxStatus::Error);
        assert_eq!(last.error.as_deref(), Some(REASON_MAX_ATTEMPTS));
        assert_eq!(last.extra.attempts, Some(2));
        assert_eq!(h.sink.last_key_state("tbl_box_prms/MODE/1"), Some(KeyState::Error));
        assert!(h.stored().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_and_applied_timeout_are_errors() {
        let h = Harness::new(test_cfg());
        h.submit("t1", "tbl_box_prms", "MODE", "4");
        h.deliver();
        h.frame(NACK);
        let last = h.sink.last("t1").unwrap();
        assert_eq!(last.status, TxStatus::Error);
        assert_eq!(last.error.as_deref(), Some(REASON_NACK));

        h.submit("t2", "tbl_batt_prms", "BAT_MIN", "50");
        h.deliver();
        h.frame(ACK);
        sleep(Duration::from_secs(91)).await;
        let last = h.sink.last("t2").unwrap();
        assert_eq!(last.status, TxStatus::Error);
        assert_eq!(last.detail.as_deref(), Some(REASON_APPLIED_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn marker_frame_confirms_and_stale_timers_stay_silent() {
        let h = Harness::new(test_cfg());
        h.submit("t1", "tbl_box_prms", "MODE", "5");
        h.frame(POLL);
        assert_eq!(
            h.pipeline.inflight(),
            Some(("t1".into(), Stage::SentToBox)),
            "sent_to_box ignores markers"
        );
        h.deliver();
        h.frame(ACK);
        let other = h.session.next_conn_id();
        h.frame_on(other, POLL);
        assert_eq!(
            h.pipeline.inflight(),
            Some(("t1".into(), Stage::BoxAck)),
            "marker from a connection that is not current"
        );
        h.frame("<Frame><Result>END</Result></Frame>");
        assert_eq!(h.sink.last("t1").unwrap().detail.as_deref(), Some(DETAIL_MARKER));

        sleep(Duration::from_secs(300)).await;
        assert_eq!(h.sink.statuses("t1").len(), 4);
        assert_eq!(h.sink.statuses("t1").last(), Some(&TxStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_follows_drain_and_yields_to_user() {
        let h = Harness::new(ControlConfig {
            maintenance: true,
            ..test_cfg()
        });
        h.submit("t1", "tbl_batt_prms", "BAT_MIN", "45");
        h.deliver();
        h.frame(ACK);
        h.frame(&event("tbl_batt_prms", "BAT_MIN", "40", "45"));
        assert_eq!(h.sink.last("t1").unwrap().status, TxStatus::Completed);

        let internal = h
            .sink
            .results()
            .into_iter()
            .find(|r| r.extra.internal == Some(true))
            .and_then(|r| r.tx_id)
            .unwrap();
        assert_eq!(h.pipeline.inflight(), Some((internal.clone(), Stage::SentToBox)));

        assert_eq!(h.submit("u1", "tbl_box_prms", "SA", "1"), TxStatus::Accepted);
        let canceled = h.sink.last(&internal).unwrap();
        assert_eq!(canceled.status, TxStatus::Completed);
        assert_eq!(canceled.detail.as_deref(), Some(DETAIL_CANCELED));
        assert_eq!(canceled.extra.internal, Some(true));
        assert_eq!(h.pipeline.inflight(), Some(("u1".into(), Stage::SentToBox)));
        assert_eq!(h.injector.pending().unwrap().tx_id, "u1");

        h.deliver();
        h.frame(ACK);
        h.frame(POLL);
        assert_eq!(h.sink.last("u1").unwrap().status, TxStatus::Completed);
        assert!(h.pipeline.inflight().is_none(), "maintenance item never re-arms itself");
    }

    #[tokio::test]
    async fn restart_reports_leftover_keys() {
        let h = Harness::new(test_cfg());
        let store = PendingStore::new(h.dir.path().join("state.json"));
        let keys: BTreeSet<String> = ["tbl_box_prms/MODE/2".to_string()].into_iter().collect();
        store.save(&keys).unwrap();

        assert_eq!(h.pipeline.recover_from_restart(), 1);
        let r = &h.sink.results()[0];
        assert_eq!(r.status, TxStatus::Error);
        assert_eq!(r.error.as_deref(), Some(REASON_RESTART));
        assert_eq!(r.tbl_item.as_deref(), Some("MODE"));
        assert_eq!(h.sink.last_key_state("tbl_box_prms/MODE/2"), Some(KeyState::Error));
        assert!(h.stored().is_empty());

        //an error key state does not block a fresh request
        assert_eq!(h.submit("t1", "tbl_box_prms", "MODE", "2"), TxStatus::Accepted);
    }
}
