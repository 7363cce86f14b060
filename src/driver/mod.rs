//! Backend driver interface and the static name→constructor registry.
//!
//! A driver never holds state of its own; every method is given whatever it
//! needs (a URL, a port, an HTTP client) and returns a plain value. All
//! mutable state lives on the owning [`crate::backend::Backend`].

mod comfyui;
mod koboldcpp;
mod llama_cpp;
mod ollama;
mod sdwebui;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Immutable per-driver capability flags, declared once per flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub executes_directly: bool,
    pub attaches_to_running_instance: bool,
    pub supports_kv_cache_restore: bool,
    pub supports_model_unloading: bool,
}

/// The five lifecycle hooks every concrete backend flavor implements.
#[async_trait]
pub trait Driver: Send + Sync {
    fn capabilities(&self) -> DriverCapabilities;

    /// Build the argv used to spawn the binary. `temp_dir` is only consulted
    /// by drivers that rewrite a transient config file (KoboldCpp).
    fn build_command_line(
        &self,
        default_tokens: &[String],
        endpoint_tokens: &[String],
        port: u16,
        kv_cache_path: Option<&Path>,
        temp_dir: &Path,
    ) -> Result<Vec<String>>;

    /// Extra environment variables to overlay on the inherited environment.
    /// `None` means no overlay is needed.
    fn build_environment(&self, host: &str, port: u16) -> Option<HashMap<String, String>> {
        let _ = (host, port);
        None
    }

    /// One HTTP GET against the driver-specific health endpoint.
    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool;

    /// Release the accelerator without exiting the process. No-op success if
    /// the driver does not advertise `supports_model_unloading`.
    async fn unload_model(&self, client: &reqwest::Client, base_url: &str) -> bool {
        let _ = (client, base_url);
        true
    }

    /// Only meaningful when `supports_kv_cache_restore` is set.
    async fn save_kv_cache(&self, client: &reqwest::Client, base_url: &str, file: &str) -> bool {
        let _ = (client, base_url, file);
        false
    }

    /// Only meaningful when `supports_kv_cache_restore` is set.
    async fn restore_kv_cache(&self, client: &reqwest::Client, base_url: &str, file: &str) -> bool {
        let _ = (client, base_url, file);
        false
    }
}

fn construct(name: &str) -> Option<Arc<dyn Driver>> {
    match name {
        "llama_cpp" => Some(Arc::new(llama_cpp::LlamaCppDriver)),
        "sdwebui" => Some(Arc::new(sdwebui::SdWebUiDriver)),
        "comfyui" => Some(Arc::new(comfyui::ComfyUiDriver)),
        "ollama" => Some(Arc::new(ollama::OllamaDriver)),
        "koboldcpp" => Some(Arc::new(koboldcpp::KoboldCppDriver)),
        _ => None,
    }
}

/// Look up a driver instance by its configured `type` name.
pub fn lookup(name: &str) -> Option<Arc<dyn Driver>> {
    construct(name)
}

/// Look up just the capability record, without allocating a driver instance.
/// Used by config validation, which only needs the flags.
pub fn capabilities_for(name: &str) -> Option<DriverCapabilities> {
    construct(name).map(|d| d.capabilities())
}

/// Resolve a driver by name, surfacing the spec's "unknown driver" error.
pub fn require(name: &str) -> Result<Arc<dyn Driver>> {
    lookup(name).ok_or_else(|| Error::Config(format!("unknown driver '{name}'")))
}

pub(crate) fn write_rewritten_kobold_config(
    original: &Path,
    temp_dir: &Path,
    port: u16,
) -> Result<PathBuf> {
    let text = std::fs::read_to_string(original).map_err(|e| {
        Error::SpawnFailure(
            "koboldcpp".to_string(),
            format!("could not read --config file {}: {e}", original.display()),
        )
    })?;
    let mut data: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        Error::SpawnFailure(
            "koboldcpp".to_string(),
            format!("could not parse --config file {}: {e}", original.display()),
        )
    })?;

    data["port"] = serde_json::json!(port);
    data["port_param"] = serde_json::json!(port);
    data["showgui"] = serde_json::json!(false);
    data["launch"] = serde_json::json!(false);

    std::fs::create_dir_all(temp_dir).map_err(|e| {
        Error::SpawnFailure("koboldcpp".to_string(), format!("could not create temp_dir: {e}"))
    })?;

    let unix_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let stem = original.file_stem().and_then(|s| s.to_str()).unwrap_or("config");
    let ext = original.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let rewritten_path = temp_dir.join(format!("{stem}_{unix_secs}.{ext}"));

    std::fs::write(&rewritten_path, serde_json::to_string(&data).unwrap_or_default()).map_err(|e| {
        Error::SpawnFailure(
            "koboldcpp".to_string(),
            format!("could not write rewritten config {}: {e}", rewritten_path.display()),
        )
    })?;

    Ok(rewritten_path)
}
