use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;

use crate::conversation::ChatPipeline;
use crate::db::AssetStore;

pub mod handlers;
pub mod types;

use handlers::{chat, home, list_asset, search_assets};

/// Process-wide dependencies, built once in `main` and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatPipeline>,
    /// `None` when the store failed to open at startup.
    pub assets: Option<Arc<AssetStore>>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/chat", post(chat))
        .route("/search", post(search_assets))
        .route("/list", post(list_asset))
        .nest_service("/static", ServeDir::new("static"))
}
