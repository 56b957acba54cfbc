//! Load sim config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ferry_core::ProtocolConfig;
use serde::Deserialize;

/// Simulation configuration. File: `--config <path>`, else ~/.config/ferry/config.toml or
/// /etc/ferry/config.toml. Env overrides: FERRY_SEED, FERRY_HOSTS, FERRY_DURATION, FERRY_LOSS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of hosts (default 10).
    #[serde(default = "default_hosts")]
    pub hosts: usize,
    /// Distinct files placed at start, round-robin over hosts (default 10).
    #[serde(default = "default_files")]
    pub files: usize,
    /// Total requests to issue (default 50).
    #[serde(default = "default_requests")]
    pub requests: usize,
    /// Simulated time between requests (default 10).
    #[serde(default = "default_request_interval")]
    pub request_interval: f64,
    /// Chance that a given host pair is in contact during one tick.
    #[serde(default = "default_contact_probability")]
    pub contact_probability: f64,
    /// Chance that a single message transfer is lost.
    #[serde(default)]
    pub loss_probability: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated run time (default 2000).
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_hosts() -> usize {
    10
}
fn default_files() -> usize {
    10
}
fn default_requests() -> usize {
    50
}
fn default_request_interval() -> f64 {
    10.0
}
fn default_contact_probability() -> f64 {
    0.05
}
fn default_seed() -> u64 {
    1
}
fn default_duration() -> f64 {
    2000.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            files: default_files(),
            requests: default_requests(),
            request_interval: default_request_interval(),
            contact_probability: default_contact_probability(),
            loss_probability: 0.0,
            seed: default_seed(),
            duration: default_duration(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.hosts < 2 {
            bail!("need at least 2 hosts, got {}", self.hosts);
        }
        if self.files == 0 {
            bail!("need at least one file");
        }
        for (name, p) in [
            ("contact_probability", self.contact_probability),
            ("loss_probability", self.loss_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{name} must be within [0, 1], got {p}");
            }
        }
        if !(self.duration > 0.0) || !(self.request_interval > 0.0) {
            bail!("duration and request_interval must be positive");
        }
        self.protocol.validate().context("invalid [protocol] table")?;
        Ok(())
    }
}

/// Load config: default, then config file (explicit path or first existing default path),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("FERRY_SEED").and_then(|s| s.parse().ok()) {
        c.seed = v;
    }
    if let Some(v) = var("FERRY_HOSTS").and_then(|s| s.parse().ok()) {
        c.hosts = v;
    }
    if let Some(v) = var("FERRY_DURATION").and_then(|s| s.parse().ok()) {
        c.duration = v;
    }
    if let Some(v) = var("FERRY_LOSS").and_then(|s| s.parse().ok()) {
        c.loss_probability = v;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ferry/config.toml"));
    }
    out.push(PathBuf::from("/etc/ferry/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::QueueMode;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.hosts, 10);
        assert_eq!(c.protocol.time_out, 20.0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn protocol_table_overrides() {
        let c: Config = toml::from_str(
            r#"
            hosts = 4
            loss_probability = 0.2

            [protocol]
            time_out = 10.0
            queue_mode = "fifo"
            "#,
        )
        .unwrap();
        assert_eq!(c.hosts, 4);
        assert_eq!(c.protocol.time_out, 10.0);
        assert_eq!(c.protocol.queue_mode, QueueMode::Fifo);
        assert_eq!(c.protocol.retransmit_limit, 3);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("[protocol]\nbogus = 1").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "FERRY_SEED" => Some("99".into()),
            "FERRY_LOSS" => Some("0.5".into()),
            "FERRY_HOSTS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(c.seed, 99);
        assert_eq!(c.loss_probability, 0.5);
        assert_eq!(c.hosts, 10);
    }

    #[test]
    fn bad_probability_rejected() {
        let c = Config {
            loss_probability: 1.5,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
