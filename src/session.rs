use crate::breaker::{CircuitBreaker, Mode};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// The device connection currently considered live.
#[derive(Clone, Debug)]
pub struct DeviceLink {
    pub conn_id: u64,
    pub peer: String,
    pub connected_since: Instant,
    pub device_id: Option<String>,
    pub last_data_at: Option<Instant>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudStats {
    pub connects: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub forwarded: u64,
    pub local_replies: u64,
}

impl fmt::Display for CloudStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "connects: {}, disconnects: {}, timeouts: {}, errors: {}, forwarded: {}, local replies: {}",
            self.connects,
            self.disconnects,
            self.timeouts,
            self.errors,
            self.forwarded,
            self.local_replies
        )
    }
}

/// Everything the proxy components share for one run.
pub struct SessionState {
    pub mode: Mode,
    breaker: Mutex<CircuitBreaker>,
    device: Mutex<Option<DeviceLink>>,
    stats: Mutex<CloudStats>,
    next_conn_id: AtomicU64,
    pub foreign_acks: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    //ignore poisoning
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionState {
    pub fn new(mode: Mode, threshold: u32, retry_interval: Duration) -> Self {
        Self {
            mode,
            breaker: Mutex::new(CircuitBreaker::new(mode, threshold, retry_interval)),
            device: Mutex::new(None),
            stats: Mutex::new(CloudStats::default()),
            next_conn_id: AtomicU64::new(1),
            foreign_acks: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        lock(&self.breaker)
    }

    pub fn stats(&self) -> MutexGuard<'_, CloudStats> {
        lock(&self.stats)
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn device_connected(&self, conn_id: u64, peer: String) {
        let mut device = lock(&self.device);
        if let Some(old) = device.as_ref() {
            info!(
                "session: conn {} from {} replaces conn {} from {}",
                conn_id, peer, old.conn_id, old.peer
            );
        }
        *device = Some(DeviceLink {
            conn_id,
            peer,
            connected_since: Instant::now(),
            device_id: None,
            last_data_at: None,
        });
    }

    /// Clears the link only if it still belongs to `conn_id`.
    pub fn device_disconnected(&self, conn_id: u64) {
        let mut device = lock(&self.device);
        if device.as_ref().map(|d| d.conn_id) == Some(conn_id) {
            *device = None;
        }
    }

    pub fn frame_received(&self, conn_id: u64, device_id: Option<&str>) {
        let mut device = lock(&self.device);
        if let Some(link) = device.as_mut().filter(|d| d.conn_id == conn_id) {
            link.last_data_at = Some(Instant::now());
            if let Some(id) = device_id {
                if link.device_id.as_deref() != Some(id) {
                    info!("session: device identified as {} (conn {})", id, conn_id);
                    link.device_id = Some(id.to_string());
                }
            }
        }
    }

    pub fn device(&self) -> Option<DeviceLink> {
        lock(&self.device).clone()
    }

    pub fn current_conn_id(&self) -> Option<u64> {
        lock(&self.device).as_ref().map(|d| d.conn_id)
    }

    /// Connected, identified, up long enough and with data flowing recently.
    pub fn is_device_ready(&self, min_uptime: Duration, data_fresh: Duration) -> bool {
        self.device_ready_at(Instant::now(), min_uptime, data_fresh)
    }

    pub fn device_ready_at(
        &self,
        now: Instant,
        min_uptime: Duration,
        data_fresh: Duration,
    ) -> bool {
        match lock(&self.device).as_ref() {
            Some(link) => {
                link.device_id.is_some()
                    && now.duration_since(link.connected_since) >= min_uptime
                    && link
                        .last_data_at
                        .map(|at| now.duration_since(at) <= data_fresh)
                        .unwrap_or(false)
            }
            None => false,
        }
    }
}
