use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use log::debug;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tower_http::cors::CorsLayer;

use crate::{
    error::HolderError,
    holders::{HolderPage, HolderQuery, HolderService, SourceFilter},
    names::{validate_label, NameService},
    utils::parse_address,
};

pub const MAX_LIMIT: usize = 100;

pub struct AppState {
    pub holders: Arc<HolderService>,
    /// Registry plus the parent domain it mints under.
    pub names: Option<(Arc<dyn NameService>, String)>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/holders", get(holders).fallback(method_not_allowed))
        .route("/api/names/available", get(name_available).fallback(method_not_allowed))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn method_not_allowed() -> HolderError {
    HolderError::MethodNotAllowed
}

async fn holders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<HolderPage>, HolderError> {
    let query = parse_holder_query(&params)?;
    debug!("Holder request {:?}", query);
    Ok(Json(state.holders.page(query).await?))
}

fn flag(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn number(
    params: &HashMap<String, String>,
    key: &str,
    default: usize,
) -> Result<usize, HolderError> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            HolderError::InvalidParam(format!("{} must be a non-negative integer", key))
        }),
    }
}

pub fn parse_holder_query(params: &HashMap<String, String>) -> Result<HolderQuery, HolderError> {
    let defaults = HolderQuery::default();
    let offset = number(params, "offset", defaults.offset)?;
    let limit = number(params, "limit", defaults.limit)?;
    if limit == 0 || limit > MAX_LIMIT {
        return Err(HolderError::InvalidParam(format!("limit must be between 1 and {}", MAX_LIMIT)));
    }

    let address = match params.get("address").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            parse_address(raw).ok_or_else(|| HolderError::InvalidAddress(raw.to_string()))?,
        ),
        None => None,
    };

    let filter = match (flag(params, "lpOnly"), flag(params, "wzeusOnly")) {
        (true, true) => {
            return Err(HolderError::InvalidParam(
                "lpOnly and wzeusOnly cannot be combined".to_string(),
            ))
        }
        (true, false) => SourceFilter::LpOnly,
        (false, true) => SourceFilter::WrappedOnly,
        (false, false) => SourceFilter::All,
    };

    Ok(HolderQuery {
        offset,
        limit,
        address,
        filter,
    })
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    success: bool,
    name: String,
    available: bool,
}

async fn name_available(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<AvailabilityResponse>, HolderError> {
    let label = params
        .get("name")
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HolderError::InvalidParam("Missing name parameter".to_string()))?;
    if !validate_label(&label) {
        return Err(HolderError::InvalidParam(format!("Invalid name: {}", label)));
    }

    let Some((service, domain)) = &state.names else {
        return Err(HolderError::upstream(
            "Name lookup unavailable",
            anyhow::anyhow!("Name service is not configured"),
        ));
    };

    let available = service
        .is_available(domain, &label)
        .await
        .map_err(|e| HolderError::upstream("Name lookup failed", e))?;

    Ok(Json(AvailabilityResponse {
        success: true,
        name: format!("{}.{}", label, domain),
        available,
    }))
}
