use crate::breaker::{Mode, HYBRID_FAIL_THRESHOLD, HYBRID_RETRY_INTERVAL_SECS};
use crate::error::ProxyError;
use ini::Ini;
use log::LevelFilter;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "proxy.conf";

#[derive(Clone, Debug)]
pub struct GeneralConfig {
    pub log: Option<String>,
    pub log_level: LevelFilter,
    pub state_file: String,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: String,
    pub mode: Mode,
    pub device_read_timeout: Duration,
    pub stats_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub host: String,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub rx_buffer_cap: usize,
    pub hybrid_fail_threshold: u32,
    pub hybrid_retry_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub listen: String,
    pub ack_timeout: Duration,
    pub applied_timeout: Duration,
    pub mode_quiet: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
    pub min_uptime: Duration,
    pub data_fresh: Duration,
    pub maintenance: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub general: GeneralConfig,
    pub proxy: ProxyConfig,
    pub cloud: CloudConfig,
    pub control: ControlConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: "oigservis.cz:5710".to_string(),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            rx_buffer_cap: 4096,
            hybrid_fail_threshold: HYBRID_FAIL_THRESHOLD,
            hybrid_retry_interval: Duration::from_secs_f32(HYBRID_RETRY_INTERVAL_SECS),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5711".to_string(),
            ack_timeout: Duration::from_secs(60),
            applied_timeout: Duration::from_secs(90),
            mode_quiet: Duration::from_secs(15),
            retry_delay: Duration::from_secs(120),
            max_attempts: 5,
            min_uptime: Duration::from_secs(20),
            data_fresh: Duration::from_secs(30),
            maintenance: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                log: None,
                log_level: LevelFilter::Debug,
                state_file: "oig-proxy.state.json".to_string(),
            },
            proxy: ProxyConfig {
                listen: "0.0.0.0:5710".to_string(),
                mode: Mode::Online,
                device_read_timeout: Duration::from_secs(300),
                stats_interval: Duration::from_secs(3600),
            },
            cloud: CloudConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

struct Section<'a> {
    conf: &'a Ini,
    name: &'static str,
}

impl<'a> Section<'a> {
    fn raw(&self, key: &str) -> Option<&'a String> {
        self.conf
            .section(Some(self.name.to_owned()))
            .and_then(|s| s.get(key))
    }

    fn error(&self, key: &str, reason: String) -> ProxyError {
        ProxyError::Config {
            section: self.name.to_string(),
            key: key.to_string(),
            reason,
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration, ProxyError> {
        match self.raw(key) {
            Some(v) => humantime::parse_duration(v.trim())
                .map_err(|e| self.error(key, e.to_string())),
            None => Ok(default),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ProxyError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            Some(v) => v.trim().parse().map_err(|e: T::Err| self.error(key, e.to_string())),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ProxyError> {
        let conf = Ini::load_from_file(path).map_err(|e| ProxyError::Config {
            section: "-".to_string(),
            key: path.to_string(),
            reason: e.to_string(),
        })?;
        Config::from_ini(&conf)
    }

    pub fn from_ini(conf: &Ini) -> Result<Self, ProxyError> {
        let defaults = Config::default();
        let general = Section { conf, name: "general" };
        let proxy = Section { conf, name: "proxy" };
        let cloud = Section { conf, name: "cloud" };
        let control = Section { conf, name: "control" };

        Ok(Config {
            general: GeneralConfig {
                log: general.raw("log").cloned(),
                log_level: general.parse("log_level", defaults.general.log_level)?,
                state_file: general.string("state_file", &defaults.general.state_file),
            },
            proxy: ProxyConfig {
                listen: proxy.string("listen", &defaults.proxy.listen),
                mode: proxy.parse("mode", defaults.proxy.mode)?,
                device_read_timeout: proxy
                    .duration("device_read_timeout", defaults.proxy.device_read_timeout)?,
                stats_interval: proxy.duration("stats_interval", defaults.proxy.stats_interval)?,
            },
            cloud: CloudConfig {
                host: cloud.string("host", &defaults.cloud.host),
                connect_timeout: cloud.duration("connect_timeout", defaults.cloud.connect_timeout)?,
                ack_timeout: cloud.duration("ack_timeout", defaults.cloud.ack_timeout)?,
                rx_buffer_cap: cloud.parse("rx_buffer_cap", defaults.cloud.rx_buffer_cap)?,
                hybrid_fail_threshold: cloud
                    .parse("hybrid_fail_threshold", defaults.cloud.hybrid_fail_threshold)?,
                hybrid_retry_interval: cloud
                    .duration("hybrid_retry_interval", defaults.cloud.hybrid_retry_interval)?,
            },
            control: ControlConfig {
                listen: control.string("listen", &defaults.control.listen),
                ack_timeout: control.duration("ack_timeout", defaults.control.ack_timeout)?,
                applied_timeout: control
                    .duration("applied_timeout", defaults.control.applied_timeout)?,
                mode_quiet: control.duration("mode_quiet", defaults.control.mode_quiet)?,
                retry_delay: control.duration("retry_delay", defaults.control.retry_delay)?,
                max_attempts: control.parse("max_attempts", defaults.control.max_attempts)?,
                min_uptime: control.duration("min_uptime", defaults.control.min_uptime)?,
                data_fresh: control.duration("data_fresh", defaults.control.data_fresh)?,
                maintenance: control.parse("maintenance", defaults.control.maintenance)?,
            },
        })
    }
}
