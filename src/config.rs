//! Runtime configuration
//!
//! Every knob has a default; `Config::from_env` overrides them from
//! `SYNCROOM_*` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// bcrypt cost used for room passwords unless configured otherwise
pub const DEFAULT_PASSWORD_COST: u32 = 10;

/// Core configuration shared by the registry, rooms and hubs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Idle time after which a loaded room is evicted
    pub room_ttl: Duration,
    /// How often the cache sweeper looks for expired rooms
    pub sweep_interval: Duration,
    /// Open connections allowed per user in one room; the oldest is dropped beyond it
    pub max_conns_per_user: usize,
    /// Capacity of each client's outbound queue
    pub outbound_capacity: usize,
    /// Deadline for a single write to a client transport
    pub write_timeout: Duration,
    /// bcrypt cost for room passwords
    pub password_cost: u32,
    /// Address the binary listens on
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(48 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            max_conns_per_user: 4,
            outbound_capacity: 64,
            write_timeout: Duration::from_secs(10),
            password_cost: DEFAULT_PASSWORD_COST,
            bind_addr: DEFAULT_ADDR.to_string(),
        }
    }
}

impl Config {
    /// Build a config from defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>("SYNCROOM_ROOM_TTL_SECS")? {
            config.room_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("SYNCROOM_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse_var::<usize>("SYNCROOM_MAX_CONNS_PER_USER")? {
            config.max_conns_per_user = n.max(1);
        }
        if let Some(n) = parse_var::<usize>("SYNCROOM_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>("SYNCROOM_WRITE_TIMEOUT_MS")? {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(cost) = parse_var::<u32>("SYNCROOM_PASSWORD_COST")? {
            config.password_cost = cost;
        }
        if let Ok(addr) = env::var("SYNCROOM_BIND_ADDR") {
            config.bind_addr = addr;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}
