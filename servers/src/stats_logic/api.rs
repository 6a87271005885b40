use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use lib_statsync::configs::defaults_catalog::DefaultsCatalog;
use lib_statsync::{DefaultMetrics, MetricResolver, MetricSource, MetricValues};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared read-only state behind every request.
pub struct ApiState {
    pub resolver: MetricResolver,
    pub catalog: DefaultsCatalog,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EntityStats {
    pub entity: String,
    pub source: MetricSource,
    pub metrics: MetricValues,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(all_stats_handler))
        .route("/stats/{entity}", get(entity_stats_handler))
        .with_state(state)
}

pub async fn run(port: u16, state: Arc<ApiState>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Stats API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Stats API shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn resolve(state: &ApiState, entity: &str, defaults: &DefaultMetrics) -> EntityStats {
    let resolved = state.resolver.resolve_tagged(entity, defaults);
    EntityStats {
        entity: entity.to_string(),
        source: resolved.source,
        metrics: resolved.metrics,
    }
}

async fn all_stats_handler(State(state): State<Arc<ApiState>>) -> Json<Vec<EntityStats>> {
    let stats = state
        .catalog
        .entities()
        .filter_map(|entity| state.catalog.get(entity).map(|defaults| resolve(&state, entity, defaults)))
        .collect();
    Json(stats)
}

async fn entity_stats_handler(State(state): State<Arc<ApiState>>, Path(entity): Path<String>) -> Response {
    let empty = DefaultMetrics::new();
    let defaults = state.catalog.get(&entity).unwrap_or(&empty);
    let stats = resolve(&state, &entity, defaults);

    if stats.metrics.is_empty() {
        log::debug!("No live data or defaults for '{}'.", entity);
        return (StatusCode::NOT_FOUND, format!("unknown entity '{}'", entity)).into_response();
    }
    Json(stats).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use lib_statsync::{ChangeDelta, MetricRow, MetricStore, MetricValue};
    use serde_json::Value;

    fn state() -> (Arc<MetricStore>, Arc<ApiState>) {
        let store = Arc::new(MetricStore::new());
        let state = Arc::new(ApiState {
            resolver: MetricResolver::new(Arc::clone(&store)),
            catalog: DefaultsCatalog::builtin(),
        });
        (store, state)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_entity_falls_back_to_defaults() {
        let (_store, state) = state();
        let response = entity_stats_handler(State(state), Path("segmentation".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["source"], "default");
        assert_eq!(body["metrics"]["accuracy"], "94%");
    }

    #[tokio::test]
    async fn test_entity_prefers_live_values() {
        let (store, state) = state();
        store.load_snapshot(vec![MetricRow::new("analytics", "queries", "2M/day")]);

        let response = entity_stats_handler(State(state), Path("analytics".to_string())).await;
        let body = body_json(response).await;
        assert_eq!(body["source"], "live");
        assert_eq!(body["metrics"]["queries"], "2M/day");
        assert!(body["metrics"].get("latency").is_none());
    }

    #[tokio::test]
    async fn test_unknown_entity_is_404_until_live() {
        let (store, state) = state();
        let response = entity_stats_handler(State(Arc::clone(&state)), Path("billing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        store.apply_delta(ChangeDelta::upsert("billing", "invoices", MetricValue::from("40/day")));
        let response = entity_stats_handler(State(state), Path("billing".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_all_stats_lists_catalog() {
        let (_store, state) = state();
        let Json(stats) = all_stats_handler(State(state)).await;
        let names: Vec<&str> = stats.iter().map(|s| s.entity.as_str()).collect();
        assert_eq!(names, vec!["analytics", "reporting", "segmentation"]);
        assert!(stats.iter().all(|s| s.source == MetricSource::Default));
    }
}
