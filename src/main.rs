use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod conversation;
mod db;
mod inference;
mod model;
mod prompts;

use api::AppState;
use config::{AppConfig, ModelSource};
use conversation::ChatPipeline;
use db::AssetStore;
use inference::gpt2::{Gpt2Service, ModelFiles};
use inference::{GenerationParameters, LanguageModel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AppConfig::from_env()?;

    println!("🚀 Starting Ubayog chat server...");

    // -----------------------------
    // Model (loaded once, shared read-mostly)
    // -----------------------------
    let model = load_model(&cfg).await?;
    let chat = Arc::new(ChatPipeline::new(
        model,
        cfg.template,
        GenerationParameters::default().with_seed(cfg.seed),
        cfg.empty_message,
    ));

    info!(
        template = %cfg.template,
        empty_message = %cfg.empty_message,
        seeded = cfg.seed.is_some(),
        "chat pipeline ready"
    );

    // -----------------------------
    // Asset store (optional)
    // -----------------------------
    let assets = match AssetStore::open(&cfg.assets_db_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "asset store unavailable; /search and /list will fail");
            None
        }
    };

    let state = AppState { chat, assets };

    // -----------------------------
    // Routers
    // -----------------------------
    let app: Router = api::router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let addr = cfg.bind_addr.as_str();

    println!("🌐 HTTP listening on http://{addr}");
    println!("💬 Chat at http://{addr}/chat");

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn load_model(cfg: &AppConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    let source = cfg.model.clone();
    let device = cfg.device.open()?;

    let service = tokio::task::spawn_blocking(move || {
        let files = match &source {
            ModelSource::Dir(dir) => ModelFiles::from_dir(dir)?,
            ModelSource::Hub(model_id) => {
                info!(model_id = %model_id, "resolving model through hf-hub");
                ModelFiles::from_hub(model_id)?
            }
        };
        Gpt2Service::new_with(&files, device)
    })
    .await
    .context("model loader task failed")??;

    Ok(Arc::new(service))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
