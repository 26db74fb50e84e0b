use std::sync::Arc;

use anyhow::bail;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stem_separation_service::{
    AppConfig, JobRegistry, Separator, build_router, model::tch_backend::TorchEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    if !config.engine_source_path.exists() {
        bail!(
            "inference engine source not found at {}; set ENGINE_SOURCE_PATH",
            config.engine_source_path.display()
        );
    }
    config.ensure_directories()?;

    let engine = Arc::new(TorchEngine::new(config.engine_source_path.clone()));
    let registry = Arc::new(JobRegistry::new());
    let separator = Arc::new(Separator::new(config.as_ref(), engine, registry));
    tracing::info!(
        device = %separator.device(),
        models = ?config.models.keys().collect::<Vec<_>>(),
        "separation service configured"
    );

    let router = build_router(config.clone(), separator)?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
