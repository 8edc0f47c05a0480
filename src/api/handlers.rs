use std::sync::{Arc, OnceLock};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Html,
    Json,
};
use minijinja::{context, Environment};
use tracing::{error, info, warn};

use crate::{
    api::types::{ChatRequest, ErrorBody, ListResponse, SearchRequest},
    api::AppState,
    conversation::{ChatResponse, GenerationError},
    db::AssetStore,
    model::asset::{AssetSummary, NewAsset},
};

const INDEX_TEMPLATE: &str = "index.html";

type ApiError = (StatusCode, Json<ErrorBody>);

static PAGES: OnceLock<Environment<'static>> = OnceLock::new();

fn pages() -> &'static Environment<'static> {
    PAGES.get_or_init(|| {
        let mut env = Environment::new();
        env.add_template(INDEX_TEMPLATE, include_str!("../../templates/index.html"))
            .unwrap_or_else(|err| panic!("failed to compile landing page template: {err}"));
        env
    })
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    warn!(error = %rejection.body_text(), "rejected request body");
    api_error(StatusCode::BAD_REQUEST, rejection.body_text())
}

fn generation_error(err: GenerationError) -> ApiError {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    api_error(status, err.to_string())
}

fn asset_store(state: &AppState) -> Result<Arc<AssetStore>, ApiError> {
    state.assets.clone().ok_or_else(|| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Database connection unavailable",
        )
    })
}

pub async fn home(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let page = pages()
        .get_template(INDEX_TEMPLATE)
        .and_then(|tpl| {
            tpl.render(context! {
                title => "Ubayog Assistant",
                template => state.chat.template().to_string(),
            })
        })
        .map_err(|err| {
            error!(error = %err, "landing page render failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page")
        })?;
    Ok(Html(page))
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload.map_err(bad_body)?;

    state
        .chat
        .respond(req.message)
        .await
        .map(Json)
        .map_err(generation_error)
}

pub async fn search_assets(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Vec<AssetSummary>>, ApiError> {
    let Json(req) = payload.map_err(bad_body)?;
    let store = asset_store(&state)?;
    let query = req
        .query
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No query provided"))?;

    store
        .find_by_name_substring(&query)
        .await
        .map(Json)
        .map_err(|err| {
            error!(error = %err, query = %query, "asset search failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to search assets: {err:#}"),
            )
        })
}

pub async fn list_asset(
    State(state): State<AppState>,
    payload: Result<Json<NewAsset>, JsonRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Json(new) = payload.map_err(bad_body)?;
    let store = asset_store(&state)?;

    let asset = store.insert(new).await.map_err(|err| {
        error!(error = %err, "asset insert failed");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to list asset: {err:#}"),
        )
    })?;

    info!(asset_id = %asset.id, name = %asset.name, "asset listed");
    Ok(Json(ListResponse {
        message: "Asset listed successfully!".into(),
    }))
}
