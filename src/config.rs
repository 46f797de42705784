use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use chain_manager::DeletionPolicy;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "QSD_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub env: String,
    pub listen_addr: String,
    /// QMP monitor socket of the qemu-storage-daemon this node drives.
    pub qmp_socket: PathBuf,
    pub images_dir: PathBuf,
    pub sockets_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// How long to wait for the daemon's socket at startup.
    pub startup_timeout_secs: u64,
    pub deletion_policy: DeletionPolicy,
    pub telemetry: TelemetryConfig,
    /// JSON logs; defaults to on everywhere except the local env.
    pub structured_logging: Option<bool>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:9090".to_string(),
            qmp_socket: PathBuf::from("/var/run/qsd-qmp.sock"),
            images_dir: PathBuf::from("/var/run/qsd/images"),
            sockets_dir: PathBuf::from("/var/run/qsd/sockets"),
            command_timeout_secs: 30,
            job_timeout_secs: 10,
            request_timeout_secs: 60,
            startup_timeout_secs: 30,
            deletion_policy: DeletionPolicy::default(),
            telemetry: TelemetryConfig::default(),
            structured_logging: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Export spans over OTLP.
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OTLP collector endpoint for traces and metrics. Falls back to
    // OTEL_EXPORTER_OTLP_ENDPOINT, then localhost:4317.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
            instance_id: None,
        }
    }
}

impl NodeConfig {
    /// Defaults, overlaid with the YAML file, overlaid with `QSD_*`
    /// environment variables (`QSD_TELEMETRY__ENDPOINT` for nested keys).
    pub fn from_path(path: &Path) -> Result<NodeConfig> {
        let config: NodeConfig = Figment::from(Serialized::defaults(NodeConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<NodeConfig> {
        let config: NodeConfig = Figment::from(Serialized::defaults(NodeConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<NodeConfig> {
        let config: NodeConfig = Figment::from(Serialized::defaults(NodeConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        for (name, secs) in [
            ("command_timeout_secs", self.command_timeout_secs),
            ("job_timeout_secs", self.job_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        for (name, path) in [
            ("qmp_socket", &self.qmp_socket),
            ("images_dir", &self.images_dir),
            ("sockets_dir", &self.sockets_dir),
        ] {
            if !path.is_absolute() {
                return Err(anyhow!("{} must be an absolute path: {}", name, path.display()));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert!(!config.structured_logging());
        assert_eq!(config.deletion_policy, DeletionPolicy::ChainRetained);
        assert_eq!(config.job_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = NodeConfig::from_yaml_str(
            r#"
env: production
listen_addr: 127.0.0.1:7000
deletion_policy: flatten
telemetry:
  enable_metrics: true
  endpoint: http://collector:4317
"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.deletion_policy, DeletionPolicy::Flatten);
        assert!(config.structured_logging());
        assert!(config.telemetry.enable_metrics);
        assert_eq!(config.telemetry.metrics_interval_secs, 10);
        assert_eq!(config.qmp_socket, PathBuf::from("/var/run/qsd-qmp.sock"));
        assert_eq!(config.command_timeout_secs, 30);
    }

    #[test]
    fn test_explicit_log_format_wins() {
        let config = NodeConfig::from_yaml_str("env: production\nstructured_logging: false\n").unwrap();
        assert!(!config.structured_logging());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        for yaml in [
            "listen_addr: not-an-address\n",
            "job_timeout_secs: 0\n",
            "request_timeout_secs: 0\n",
            "images_dir: relative/images\n",
            "qmp_socket: qmp.sock\n",
            "deletion_policy: commit_everything\n",
        ] {
            assert!(NodeConfig::from_yaml_str(yaml).is_err(), "{yaml}");
        }
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "images_dir: /srv/qsd/images\njob_timeout_secs: 20\n").unwrap();
        let config = NodeConfig::from_path(&path).unwrap();
        assert_eq!(config.images_dir, PathBuf::from("/srv/qsd/images"));
        assert_eq!(config.job_timeout_secs, 20);
    }
}
