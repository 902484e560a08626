//! rpcflow: runs orchestrations of gRPC stages.
//!
//! ## Configuration
//! - `rpcflow.yaml`, a path given as the first argument, or RPCFLOW_CONFIG
//! - RPCFLOW__ENGINE__INVOKE_TIMEOUT_MS etc. override file settings
//! - RPCFLOW_LOG: tracing filter (default: info)
//!
//! Every orchestration listed under `run` is built and started. The process
//! stops them all on Ctrl-C.

use std::sync::Arc;

use tracing::{error, info};

use rpcflow::config::{config_base_dir, Config};
use rpcflow::engine::Engine;
use rpcflow::storage::MemoryDefinitionStore;
use rpcflow::transport::GrpcTransport;
use rpcflow::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let store = match config.definitions_file(&config_base_dir(path.as_deref())) {
        Some(file) => MemoryDefinitionStore::from_yaml_file(file)?,
        None => MemoryDefinitionStore::new(),
    };
    let transport = GrpcTransport::new(config.engine.connect_timeout())
        .with_reflection_timeout(config.engine.reflection_timeout());
    let engine = Engine::new(Arc::new(store), Arc::new(transport), &config.engine);

    for name in &config.run {
        match engine.build_and_start(name).await {
            Ok(id) => info!(orchestration = %name, execution = %id, "Started"),
            Err(e) => error!(orchestration = %name, error = %e, "Failed to start"),
        }
    }

    info!(running = ?engine.running().await, "rpcflow started");
    shutdown_signal().await;
    engine.shutdown().await;

    Ok(())
}
