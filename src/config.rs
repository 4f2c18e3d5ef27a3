//! Configuration module.
//!
//! Typed access to the handful of environment variables this server reads.

use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
#[cfg(test)]
use std::collections::HashMap;

/// Typed configuration keys.
///
/// Using an enum for config keys provides compile-time safety and
/// prevents typos compared to string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    BindAddr,
    ServerIp,
    TimerT1Ms,
    TimerT2Ms,
    TimerT4Ms,
}

impl ConfigKey {
    /// The environment variable name for this key.
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::BindAddr => "SIP_BIND_ADDR",
            ConfigKey::ServerIp => "SIP_SERVER_IP",
            ConfigKey::TimerT1Ms => "SIP_TIMER_T1_MS",
            ConfigKey::TimerT2Ms => "SIP_TIMER_T2_MS",
            ConfigKey::TimerT4Ms => "SIP_TIMER_T4_MS",
        }
    }

    /// Default value for this key, if any. Every key here has one; none
    /// of this server's config is required to start.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::BindAddr => Some("0.0.0.0:5060"),
            ConfigKey::ServerIp => None,
            ConfigKey::TimerT1Ms => Some("500"),
            ConfigKey::TimerT2Ms => Some("4000"),
            ConfigKey::TimerT4Ms => Some("5000"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Advertised IP for SDP `c=` and outbound Via/Contact. `None` means
    /// auto-detect at startup via the server-IP oracle.
    pub server_ip: Option<String>,
    pub timer_t1: Duration,
    pub timer_t2: Duration,
    pub timer_t4: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing.
        Self::from_getter(|key| env::var(key.env_var()).ok())
    }

    /// Parse config from a custom getter function (for testing).
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(ConfigKey) -> Option<String>,
    {
        let bind_addr_str = get(ConfigKey::BindAddr)
            .unwrap_or_else(|| ConfigKey::BindAddr.default_value().unwrap().to_string());
        let bind_addr = bind_addr_str
            .parse()
            .with_context(|| format!("{} must be a valid socket address", ConfigKey::BindAddr.env_var()))?;

        let timer_t1 = parse_millis(&get, ConfigKey::TimerT1Ms)?;
        let timer_t2 = parse_millis(&get, ConfigKey::TimerT2Ms)?;
        let timer_t4 = parse_millis(&get, ConfigKey::TimerT4Ms)?;

        Ok(Config {
            bind_addr,
            server_ip: get(ConfigKey::ServerIp).filter(|s| !s.is_empty()),
            timer_t1,
            timer_t2,
            timer_t4,
        })
    }

    /// Create config from a HashMap (convenience for testing).
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key.env_var()).map(|v| v.to_string()))
    }

    /// Validate cross-field invariants at startup.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.timer_t1 > self.timer_t2 {
            errors.push(format!(
                "{} ({:?}) must not exceed {} ({:?})",
                ConfigKey::TimerT1Ms.env_var(),
                self.timer_t1,
                ConfigKey::TimerT2Ms.env_var(),
                self.timer_t2
            ));
        }
        if self.timer_t1.is_zero() {
            errors.push(format!("{} must be greater than 0", ConfigKey::TimerT1Ms.env_var()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "))
        }
    }
}

fn parse_millis<F>(get: &F, key: ConfigKey) -> Result<Duration>
where
    F: Fn(ConfigKey) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| key.default_value().unwrap().to_string());
    let millis: u64 = raw
        .parse()
        .with_context(|| format!("{} must be a valid number of milliseconds", key.env_var()))?;
    Ok(Duration::from_millis(millis))
}



#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn bind_addr_parsing_never_panics() {
        let data: [u8; 24] = kani::any();
        if let Ok(s) = std::str::from_utf8(&data) {
            let _: Result<SocketAddr, _> = s.parse();
        }
    }
}
