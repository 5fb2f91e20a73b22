//! The manager's validated configuration (`spec.md` §3).
//!
//! Loaded from `<conf_dir>/config.toml` via `serde`; recovered field list
//! and defaults are taken from `config.py` (`examples/original_source`).

use std::path::PathBuf;

use serde::Deserialize;

const MINIMUM_HEARTBEAT_PERIOD_S: f64 = 5.0;

fn default_heartbeat_period_s() -> f64 {
    30.0
}

fn default_heartbeat_threshold_s() -> f64 {
    120.0
}

fn default_idle_heartbeats_hard() -> i64 {
    5760
}

fn default_grace_period_s() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval at which heartbeat messages are sent to the control plane.
    /// Clamped to `max(5.0, _)` by [`Config::validate`].
    pub heartbeat_period_s: f64,
    /// Seconds since the last inbound heartbeat ack before the connection
    /// is assumed disconnected. Carried for configuration-surface parity;
    /// the manager itself does not time out on missing acks (`spec.md`
    /// names this as a single-user-endpoint concern).
    pub heartbeat_threshold_s: f64,
    /// Path to the C1 identity-mapping policy file.
    pub identity_mapping_config_path: Option<PathBuf>,
    /// TTL for the C4 revival cache.
    pub mu_child_ep_grace_period_s: u64,
    /// Danger flag: allow the multi-user uid to also run single-user
    /// endpoints.
    pub force_mu_allow_same_user: bool,
    /// Control-plane base address.
    pub funcx_service_address: Option<String>,
    /// Deployment environment name, forwarded to registration metadata.
    pub environment: Option<String>,
    /// If set, overrides the port in the registration response's command
    /// queue URL. Only 5671, 5672, 443 are valid (`spec.md` §6).
    pub amqp_port: Option<u16>,
    pub idle_heartbeats_soft: i64,
    pub idle_heartbeats_hard: i64,
    pub display_name: Option<String>,
    pub endpoint_setup: Option<String>,
    pub endpoint_teardown: Option<String>,
    pub log_dir: Option<PathBuf>,

    /// Test seam: override transport construction kwargs wholesale. Never
    /// read from a config file in production; exposed only as a
    /// constructor option (`spec.md` §9 Open Questions).
    #[serde(skip)]
    pub cqs_kwargs: Option<serde_json::Value>,
    #[serde(skip)]
    pub rp_kwargs: Option<serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heartbeat_period_s: default_heartbeat_period_s(),
            heartbeat_threshold_s: default_heartbeat_threshold_s(),
            identity_mapping_config_path: None,
            mu_child_ep_grace_period_s: default_grace_period_s(),
            force_mu_allow_same_user: false,
            funcx_service_address: None,
            environment: None,
            amqp_port: None,
            idle_heartbeats_soft: 0,
            idle_heartbeats_hard: default_idle_heartbeats_hard(),
            display_name: None,
            endpoint_setup: None,
            endpoint_teardown: None,
            log_dir: None,
            cqs_kwargs: None,
            rp_kwargs: None,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Normalizes the invariants named in `spec.md` §3:
    /// `heartbeat_period_effective = max(5.0, config.heartbeat_period)` and
    /// `idle_heartbeats_soft, idle_heartbeats_hard >= 0`.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if let Some(port) = self.amqp_port {
            if !matches!(port, 5671 | 5672 | 443) {
                anyhow::bail!("amqp_port must be one of 5671, 5672, 443 (got {port})");
            }
        }
        self.idle_heartbeats_soft = self.idle_heartbeats_soft.max(0);
        self.idle_heartbeats_hard = self.idle_heartbeats_hard.max(0);
        Ok(())
    }

    /// `heartbeat_period_effective` per `spec.md` §3/§8.
    pub fn heartbeat_period_effective(&self) -> f64 {
        self.heartbeat_period_s.max(MINIMUM_HEARTBEAT_PERIOD_S)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_period_is_clamped_to_five_seconds() {
        let mut cfg = Config {
            heartbeat_period_s: 1.0,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.heartbeat_period_effective(), 5.0);
    }

    #[test]
    fn heartbeat_period_above_minimum_is_unchanged() {
        let cfg = Config {
            heartbeat_period_s: 30.0,
            ..Default::default()
        };
        assert_eq!(cfg.heartbeat_period_effective(), 30.0);
    }

    #[test]
    fn idle_heartbeat_counts_are_normalized_to_nonnegative() {
        let mut cfg = Config {
            idle_heartbeats_soft: -5,
            idle_heartbeats_hard: -1,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.idle_heartbeats_soft, 0);
        assert_eq!(cfg.idle_heartbeats_hard, 0);
    }

    #[test]
    fn rejects_unsupported_amqp_port() {
        let mut cfg = Config {
            amqp_port: Some(9999),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_valid_amqp_ports() {
        for port in [5671u16, 5672, 443] {
            let mut cfg = Config {
                amqp_port: Some(port),
                ..Default::default()
            };
            assert!(cfg.validate().is_ok());
        }
    }
}
