//! Configuration loading and validation.
//!
//! The on-disk shape is JSON with the exact field names documented in
//! SPEC_FULL.md §6. `RawConfig` mirrors that shape for `serde_json` to
//! deserialize into; [`Config::load`] then validates and lowers it into the
//! types the rest of the system consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::driver;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown driver type '{0}'")]
    UnknownDriver(String),
    #[error("duplicate backend configuration for '{0}'")]
    DuplicateBackend(String),
    #[error("duplicate server port: {0}")]
    DuplicatePort(u16),
    #[error("backend '{0}' requires either 'binary' or 'attach_to'")]
    MissingBinaryOrAttach(String),
    #[error("backend '{0}' (driver '{1}') does not support attaching to a running instance")]
    AttachNotSupported(String, String),
    #[error("backend '{0}' (driver '{1}') does not support executing a binary directly")]
    BinaryNotSupported(String, String),
    #[error("endpoint '{endpoint}' on server '{server}' references unknown backend '{backend}'")]
    UnknownBackendRef {
        server: String,
        endpoint: String,
        backend: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    temp_dir: Option<String>,
    #[serde(default)]
    backends: HashMap<String, RawBackendConfig>,
    #[serde(default)]
    servers: Vec<RawServerConfig>,
    #[serde(default)]
    warmup: Vec<RawWarmupEntry>,
}

#[derive(Debug, Deserialize)]
struct RawBackendConfig {
    #[serde(rename = "type")]
    driver_type: String,
    binary: Option<String>,
    attach_to: Option<String>,
    #[serde(default)]
    default_parameters: Vec<String>,
    #[serde(default = "default_true")]
    model_unloading: bool,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    name: String,
    host: String,
    port: u16,
    #[serde(default)]
    endpoints: Vec<RawEndpointConfig>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    name: String,
    backend: String,
    #[serde(default)]
    path_prefix: String,
    #[serde(default)]
    strip_prefix: bool,
    #[serde(default)]
    parameters: Vec<String>,
    #[serde(default = "default_true")]
    kv_cache_saving: bool,
}

#[derive(Debug, Deserialize)]
struct RawWarmupEntry {
    server: String,
    endpoint: String,
}

fn default_true() -> bool {
    true
}

/// One driver flavor, as declared under `backends.<name>`.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub driver_type: String,
    pub binary: Option<PathBuf>,
    pub attach_to: Option<String>,
    pub default_parameters: Vec<String>,
    pub model_unloading: bool,
}

/// One HTTP endpoint within a server, bound to a named backend.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub backend: String,
    pub path_prefix: String,
    pub strip_prefix: bool,
    pub parameters: Vec<String>,
    pub kv_cache_saving: bool,
}

/// One listening address and its ordered endpoints.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Sorted longest-non-empty-prefix-first; empty prefix (catch-all) last.
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone)]
pub struct WarmupEntry {
    pub server: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub temp_dir: PathBuf,
    pub backends: HashMap<String, BackendConfig>,
    pub servers: Vec<ServerConfig>,
    pub warmup: Vec<WarmupEntry>,
}

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut backends = HashMap::with_capacity(raw.backends.len());
        for (name, raw_backend) in raw.backends {
            if backends.contains_key(&name) {
                return Err(ConfigError::DuplicateBackend(name));
            }
            let caps = driver::capabilities_for(&raw_backend.driver_type)
                .ok_or_else(|| ConfigError::UnknownDriver(raw_backend.driver_type.clone()))?;

            if raw_backend.attach_to.is_some() && !caps.attaches_to_running_instance {
                return Err(ConfigError::AttachNotSupported(name, raw_backend.driver_type));
            }
            if raw_backend.binary.is_some() && !caps.executes_directly {
                return Err(ConfigError::BinaryNotSupported(name, raw_backend.driver_type));
            }
            if raw_backend.binary.is_none() && raw_backend.attach_to.is_none() {
                return Err(ConfigError::MissingBinaryOrAttach(name));
            }

            let attach_to = if caps.attaches_to_running_instance {
                raw_backend.attach_to
            } else {
                None
            };

            backends.insert(
                name.clone(),
                BackendConfig {
                    name,
                    driver_type: raw_backend.driver_type,
                    binary: raw_backend.binary.map(PathBuf::from),
                    attach_to,
                    default_parameters: raw_backend.default_parameters,
                    model_unloading: caps.supports_model_unloading && raw_backend.model_unloading,
                },
            );
        }

        let mut servers = Vec::with_capacity(raw.servers.len());
        let mut seen_ports = std::collections::HashSet::new();
        for raw_server in raw.servers {
            if !seen_ports.insert(raw_server.port) {
                return Err(ConfigError::DuplicatePort(raw_server.port));
            }

            let mut endpoints = Vec::with_capacity(raw_server.endpoints.len());
            for raw_endpoint in raw_server.endpoints {
                let backend_config = backends.get(&raw_endpoint.backend).ok_or_else(|| {
                    ConfigError::UnknownBackendRef {
                        server: raw_server.name.clone(),
                        endpoint: raw_endpoint.name.clone(),
                        backend: raw_endpoint.backend.clone(),
                    }
                })?;
                let caps = driver::capabilities_for(&backend_config.driver_type)
                    .expect("driver type already validated above");

                endpoints.push(EndpointConfig {
                    name: raw_endpoint.name,
                    backend: raw_endpoint.backend,
                    path_prefix: raw_endpoint.path_prefix,
                    strip_prefix: raw_endpoint.strip_prefix,
                    parameters: raw_endpoint.parameters,
                    kv_cache_saving: caps.supports_kv_cache_restore && raw_endpoint.kv_cache_saving,
                });
            }

            // Longest-non-empty-prefix-first; empty prefix (catch-all) sorts last.
            endpoints.sort_by(|a, b| match (a.path_prefix.is_empty(), b.path_prefix.is_empty()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => b.path_prefix.len().cmp(&a.path_prefix.len()),
            });

            servers.push(ServerConfig {
                name: raw_server.name,
                host: raw_server.host,
                port: raw_server.port,
                endpoints,
            });
        }

        let warmup = raw
            .warmup
            .into_iter()
            .map(|w| WarmupEntry {
                server: w.server,
                endpoint: w.endpoint,
            })
            .collect();

        let temp_dir = resolve_temp_dir(raw.temp_dir);

        Ok(Config {
            temp_dir,
            backends,
            servers,
            warmup,
        })
    }
}

fn resolve_temp_dir(configured: Option<String>) -> PathBuf {
    match configured {
        Some(path) => {
            let path = PathBuf::from(path);
            path.canonicalize().unwrap_or(path)
        }
        None => {
            let fallback = Path::new("/tmp");
            if fallback.exists() {
                fallback.join(env!("CARGO_PKG_NAME"))
            } else {
                PathBuf::from(env!("CARGO_PKG_NAME"))
            }
        }
    }
}
