//! infermux: a local inference backend multiplexer. Starts, attaches to, and
//! quiesces third-party GPU/CPU inference servers behind one or more HTTP
//! front-ends, enforcing that at most one backend holds the accelerator at a
//! time. Front-ends never proxy bytes; they answer with a 307 redirect to
//! the backend's own `host:port`.

mod backend;
mod config;
mod driver;
mod error;
mod frontend;
mod manager;
mod warmup;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backend::{Backend, BackendSpec};
use config::Config;
use manager::Manager;

#[derive(Parser, Debug)]
#[command(name = "infermux", about = "Local inference backend multiplexer")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "./config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        tracing::error!(error = %e, path = %args.config.display(), "failed to load configuration");
        e
    })?;

    tracing::info!(path = %args.config.display(), servers = config.servers.len(), "configuration loaded");

    let manager = Arc::new(build_manager(&config)?);

    let listeners = bind_listeners(&config).await?;

    if let Err(err) = warmup::run(&config.warmup, &manager).await {
        tracing::error!(error = %err, "warmup aborted");
        return Err(err.into());
    }

    let servers = listeners
        .into_iter()
        .map(|(listener, server_config)| {
            let app = frontend::router(server_config.name.clone(), server_config.endpoints, Arc::clone(&manager));
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(error = %err, "server task exited with error");
                }
            })
        })
        .collect::<Vec<_>>();

    shutdown_signal().await;
    tracing::info!("shutdown signal received, quiescing backends");
    manager.quiesce_all(None).await;

    for handle in servers {
        handle.abort();
    }

    Ok(())
}

fn build_manager(config: &Config) -> Result<Manager, Box<dyn std::error::Error>> {
    let mut order = Vec::new();
    let mut backends = HashMap::new();

    for server in &config.servers {
        for endpoint in &server.endpoints {
            let backend_config = config
                .backends
                .get(&endpoint.backend)
                .expect("endpoint references a backend validated at config load time");

            let driver = driver::require(&backend_config.driver_type)?;
            let key = format!("{}:{}", server.name, endpoint.name);

            let instance = Arc::new(Backend::new(BackendSpec {
                key: key.clone(),
                driver,
                binary: backend_config.binary.clone(),
                attach_to: backend_config.attach_to.clone(),
                default_parameters: backend_config.default_parameters.clone(),
                endpoint_parameters: endpoint.parameters.clone(),
                model_unloading: backend_config.model_unloading,
                kv_cache_saving: endpoint.kv_cache_saving,
                host: server.host.clone(),
                temp_dir: config.temp_dir.clone(),
            }));

            order.push(key.clone());
            backends.insert(key, instance);
        }
    }

    Ok(Manager::new(order, backends))
}

async fn bind_listeners(
    config: &Config,
) -> Result<Vec<(tokio::net::TcpListener, config::ServerConfig)>, Box<dyn std::error::Error>> {
    let mut listeners = Vec::with_capacity(config.servers.len());
    for server in &config.servers {
        let addr = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(server = %server.name, %addr, "listening");
        listeners.push((listener, server.clone()));
    }
    Ok(listeners)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
