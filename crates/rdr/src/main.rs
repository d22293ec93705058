use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use rdr_core::config::Config;
use rdr_core::memory::{MemoryBus, MemoryStore, SimNetwork, TemplateDrafter};
use rdr_embeddings::TextEncoder;
use rdr_relay::registration::RegistrationFlow;
use rdr_relay::registry::SessionRegistry;
use rdr_relay::service::RelayService;
use rdr_relay::watchdog::Watchdog;
use rdr_worker::WorkerService;

#[tokio::main]
async fn main() -> Result<(), rdr_core::Error> {
    rdr_core::logging::init("rdr")?;

    let cfg = Config::load()?;

    // In-process wiring over the memory adapters: one bus, one store, the
    // simulated network. A deployment swaps in the broker, the relational
    // store and the SDK adapter behind the same ports.
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(SimNetwork::new());

    let encoder = build_encoder(&cfg).await?;

    let registry = Arc::new(SessionRegistry::new(
        network.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        bus.clone(),
        cfg.chat_refresh_interval,
    ));
    let registration = RegistrationFlow::new(network, bus.clone(), store.clone(), cfg.auth_ttl);
    let relay = RelayService::new(
        bus.clone(),
        registry.clone(),
        registration,
        Arc::new(TemplateDrafter::new("re {topic}: {text}")),
    );

    let worker = WorkerService::new(
        bus.clone(),
        encoder,
        store,
        cfg.batch_size,
        cfg.batch_time,
        cfg.similarity_threshold,
    );

    let cancel = CancellationToken::new();
    relay.run(cancel.clone()).await?;
    worker.run(cancel.clone()).await?;

    let watchdog = Watchdog::new(registry, bus, cfg.watchdog_interval);
    let watchdog_cancel = cancel.clone();
    tokio::spawn(async move { watchdog.run(watchdog_cancel).await });

    info!("service is running, waiting for messages");
    tokio::signal::ctrl_c().await?;

    cancel.cancel();
    relay.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn build_encoder(cfg: &Config) -> Result<Arc<dyn TextEncoder>, rdr_core::Error> {
    #[cfg(feature = "onnx")]
    if let Some(dir) = &cfg.embedding_model_dir {
        let encoder = rdr_embeddings::OnnxEncoder::load(dir, cfg.embedding_dimensions).await?;
        return Ok(Arc::new(encoder));
    }

    #[cfg(not(feature = "onnx"))]
    if cfg.embedding_model_dir.is_some() {
        tracing::warn!(
            "EMBEDDING_MODEL_DIR is set but the onnx feature is disabled, using the hashing encoder"
        );
    }

    Ok(Arc::new(rdr_embeddings::HashingEncoder::new(
        cfg.embedding_dimensions,
    )))
}
