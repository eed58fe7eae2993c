use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix appended to every registered domain.
pub const ROOT_INTERNAL_DOMAIN: &str = ".internal";

pub trait Registrar: Send + Sync {
    /// Inserts or replaces the route owned by `id` and republishes the config.
    fn register_app(&self, id: &str, name: &str, domain: &str, port: u16) -> ProxyResult<()>;

    /// Drops the route owned by `id`, if any, and republishes the config.
    fn delist_app(&self, id: &str) -> ProxyResult<()>;

    fn routes(&self) -> BTreeMap<String, Route>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub domain: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub config_path: PathBuf,
    pub listen_port: u16,
    pub listen_port_tls: u16,
    pub upstream_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub listen_port_tls: u16,
    #[serde(default)]
    pub apps: BTreeMap<String, ProxyConfigApp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigApp {
    pub server_name: String,
    pub reverse_proxy: Vec<ProxyConfigReverseProxy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigReverseProxy {
    pub upstream: Vec<ProxyConfigUpstream>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigUpstream {
    pub location: String,
}

impl ProxyConfigApp {
    pub fn new(route: &Route, upstream_host: &str) -> Self {
        ProxyConfigApp {
            server_name: route.domain.clone(),
            reverse_proxy: vec![ProxyConfigReverseProxy {
                upstream: vec![ProxyConfigUpstream {
                    location: format!("{}:{}", upstream_host, route.port),
                }],
            }],
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
