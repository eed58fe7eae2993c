//! Worker configuration: defaults overridden by `CUBE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::lib::proxy::types::ProxySettings;

pub const DEFAULT_API_PORT: u16 = 5500;
/// 1 vCPU
pub const DEFAULT_TASK_CPU: f64 = 1.0;
/// 256 MiB
pub const DEFAULT_TASK_MEM: u64 = 256 << 20;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_version: String,
    pub api_address: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub default_task_cpu: f64,
    pub default_task_mem: u64,
    pub proxy_config_path: PathBuf,
    pub proxy_listen_port: u16,
    pub proxy_listen_port_tls: u16,
    pub proxy_upstream_host: String,
    pub watch_interval: Duration,
    /// Upper bound for a single container runtime call.
    pub runtime_timeout: Duration,
    /// Optional override; otherwise resolved at startup from the identity file.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            api_version: "alpha".to_string(),
            api_address: "0.0.0.0".to_string(),
            api_port: DEFAULT_API_PORT,
            data_dir: PathBuf::from("data"),
            default_task_cpu: DEFAULT_TASK_CPU,
            default_task_mem: DEFAULT_TASK_MEM,
            proxy_config_path: PathBuf::from("rpxy-config/rpxy.toml"),
            proxy_listen_port: 8080,
            proxy_listen_port_tls: 4443,
            proxy_upstream_host: "localhost".to_string(),
            watch_interval: Duration::from_secs(1),
            runtime_timeout: Duration::from_secs(300),
            worker_id: String::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = WorkerConfig::default();

        WorkerConfig {
            api_address: lookup("CUBE_API_ADDRESS").unwrap_or(defaults.api_address),
            api_port: parsed(&lookup, "CUBE_API_PORT").unwrap_or(defaults.api_port),
            data_dir: lookup("CUBE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            default_task_cpu: parsed(&lookup, "CUBE_DEFAULT_TASK_CPU")
                .unwrap_or(defaults.default_task_cpu),
            default_task_mem: parsed(&lookup, "CUBE_DEFAULT_TASK_MEM")
                .unwrap_or(defaults.default_task_mem),
            proxy_config_path: lookup("CUBE_PROXY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.proxy_config_path),
            proxy_listen_port: parsed(&lookup, "CUBE_PROXY_LISTEN_PORT")
                .unwrap_or(defaults.proxy_listen_port),
            proxy_listen_port_tls: parsed(&lookup, "CUBE_PROXY_LISTEN_PORT_TLS")
                .unwrap_or(defaults.proxy_listen_port_tls),
            proxy_upstream_host: lookup("CUBE_PROXY_UPSTREAM_HOST")
                .unwrap_or(defaults.proxy_upstream_host),
            watch_interval: parsed(&lookup, "CUBE_WATCH_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.watch_interval),
            runtime_timeout: parsed(&lookup, "CUBE_RUNTIME_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.runtime_timeout),
            worker_id: lookup("CUBE_WORKER_ID").unwrap_or(defaults.worker_id),
            ..defaults
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            config_path: self.proxy_config_path.clone(),
            listen_port: self.proxy_listen_port,
            listen_port_tls: self.proxy_listen_port_tls,
            upstream_host: self.proxy_upstream_host.clone(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}
