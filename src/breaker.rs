use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

pub const HYBRID_FAIL_THRESHOLD: u32 = 3; //consecutive cloud failures before tripping
pub const HYBRID_RETRY_INTERVAL_SECS: f32 = 60.0; //secs between probing attempts when tripped

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Online,
    Hybrid,
    Offline,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Mode::Online),
            "hybrid" => Ok(Mode::Hybrid),
            "offline" => Ok(Mode::Offline),
            other => Err(format!("unknown mode {:?}", other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Mode::Online => "online",
            Mode::Hybrid => "hybrid",
            Mode::Offline => "offline",
        };
        write!(f, "{}", name)
    }
}

/// Decides whether the cloud is worth contacting. Only HYBRID ever trips.
pub struct CircuitBreaker {
    pub name: String,
    pub mode: Mode,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub tripped: bool,
    pub tripped_at: Option<Instant>,
    pub retry_interval: Duration,
    pub last_failure: Option<String>,
}

impl CircuitBreaker {
    pub fn new(mode: Mode, threshold: u32, retry_interval: Duration) -> Self {
        Self {
            name: "breaker".to_string(),
            mode,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            tripped: false,
            tripped_at: None,
            retry_interval,
            last_failure: None,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.mode == Mode::Offline
    }

    pub fn should_try_cloud(&mut self) -> bool {
        self.should_try_cloud_at(Instant::now())
    }

    pub fn should_try_cloud_at(&mut self, now: Instant) -> bool {
        match self.mode {
            Mode::Online => true,
            Mode::Offline => false,
            Mode::Hybrid => {
                if !self.tripped {
                    return true;
                }
                match self.tripped_at {
                    Some(at) if now.duration_since(at) >= self.retry_interval => {
                        //grant a single probe, the next one waits a full interval again
                        self.tripped_at = Some(now);
                        info!(
                            "{}: ☁️  probing cloud after {} failures",
                            self.name, self.consecutive_failures
                        );
                        true
                    }
                    Some(_) => false,
                    None => {
                        self.tripped_at = Some(now);
                        false
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.tripped {
            info!(
                "{}: cloud is back after {} failures, closing breaker",
                self.name, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.tripped = false;
        self.tripped_at = None;
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.record_failure_at(reason, Instant::now());
    }

    pub fn record_failure_at(&mut self, reason: &str, now: Instant) {
        self.last_failure = Some(reason.to_string());
        if self.mode != Mode::Hybrid {
            debug!("{}: {} cloud failure: {}", self.name, self.mode, reason);
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.tripped && self.consecutive_failures >= self.threshold {
            self.tripped = true;
            self.tripped_at = Some(now);
            warn!(
                "{}: 🔌 breaker tripped after {} consecutive failures (last: {}), serving locally for {}",
                self.name,
                self.consecutive_failures,
                reason,
                humantime::format_duration(self.retry_interval)
            );
        } else {
            debug!(
                "{}: cloud failure #{}: {}",
                self.name, self.consecutive_failures, reason
            );
        }
    }
}

impl fmt::Display for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "mode: {}, failures: {}/{}, tripped: {}, last failure: {}",
            self.mode,
            self.consecutive_failures,
            self.threshold,
            self.tripped,
            self.last_failure.as_deref().unwrap_or("-")
        )
    }
}
