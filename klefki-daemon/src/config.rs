//! Broker configuration from flags and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Settings for `klefki serve`.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on for gRPC
    #[arg(long, env = "KLEFKI_LISTEN", default_value = "0.0.0.0:5300")]
    pub listen: SocketAddr,

    /// Machine registry database (default: <data dir>/klefki/klefki.db)
    #[arg(long, env = "KLEFKI_DATABASE")]
    pub database: Option<PathBuf>,

    /// Drop sessions idle for longer than this ("0" keeps them forever)
    #[arg(long, env = "KLEFKI_SESSION_MAX_AGE", default_value = "1h", value_parser = parse_duration)]
    pub session_max_age: Duration,

    /// How often to sweep sessions and reload the registry
    #[arg(long, env = "KLEFKI_SWEEP_INTERVAL", default_value = "60s", value_parser = parse_interval)]
    pub sweep_interval: Duration,

    /// Reject polls whose signed_at is further than this from the broker clock
    #[arg(long, env = "KLEFKI_MAX_CLOCK_SKEW", value_parser = parse_duration)]
    pub max_clock_skew: Option<Duration>,

    /// Reject polls that reuse a nonce the machine already presented
    #[arg(long, env = "KLEFKI_REJECT_REPLAYED_NONCES")]
    pub reject_replayed_nonces: bool,

    /// Sustained requests per second across the whole broker
    #[arg(long, env = "KLEFKI_RATE_LIMIT_PER_SECOND", default_value_t = 20)]
    pub rate_limit_per_second: u32,

    /// Request burst allowance
    #[arg(long, env = "KLEFKI_RATE_LIMIT_BURST", default_value_t = 100)]
    pub rate_limit_burst: u32,

    /// Log filter, e.g. "debug" or "klefki_daemon=trace" (default: RUST_LOG, else info)
    #[arg(long, env = "KLEFKI_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ServeArgs {
    /// Registry path, falling back to the per-user data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_database_path)
    }

    /// `None` when the sweep is disabled.
    pub fn session_max_age(&self) -> Option<Duration> {
        (!self.session_max_age.is_zero()).then_some(self.session_max_age)
    }

    /// How long a presented nonce stays burned when replay rejection is on.
    pub fn replay_window(&self) -> Duration {
        match (self.max_clock_skew, self.session_max_age()) {
            (Some(skew), _) => skew.saturating_mul(2),
            (None, Some(max_age)) => max_age,
            (None, None) => Duration::from_secs(3600),
        }
    }
}

/// Default registry location shared by `klefki` and `klefkictl`.
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("klefki")
        .join("klefki.db")
}

/// Parse a duration like "30s", "5m", "1h" or plain seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (num_str, unit) = if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else {
        (s, 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;

    Ok(Duration::from_secs(num.saturating_mul(unit)))
}

/// [`parse_duration`] for periods, which must be non-zero.
pub fn parse_interval(s: &str) -> Result<Duration, String> {
    match parse_duration(s)? {
        d if d.is_zero() => Err("interval must be greater than zero".to_string()),
        d => Ok(d),
    }
}
