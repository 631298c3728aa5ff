//! HTTP API Server
//!
//! REST endpoints for creating and editing coasters and their wagons.
//! Every accepted write is saved to this node's store first and then
//! published on the mutation bus for the rest of the fleet.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::{validate_coaster, validate_wagon, Coaster, ValidationErrors, Wagon};
use crate::replication::{MutationBus, MutationEvent};
use crate::shutdown::{self, ShutdownSignal};
use crate::state::LeadershipWatch;
use crate::store::RecordStore;

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Local copy of the records
    pub store: RecordStore<Coaster>,
    /// Outbound mutations
    pub bus: Arc<MutationBus<Coaster>>,
    /// Current leadership, reported by /health
    pub leadership: LeadershipWatch,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        store: RecordStore<Coaster>,
        bus: Arc<MutationBus<Coaster>>,
        leadership: LeadershipWatch,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            store,
            bus,
            leadership,
        });

        Self { config, state }
    }

    /// Create the router
    pub(crate) fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/ping", get(handle_ping))
            .route("/health", get(handle_health))
            .route("/api/coasters", post(handle_create_coaster))
            .route("/api/coasters/:coaster_id", put(handle_update_coaster))
            .route("/api/coasters/:coaster_id/wagons", post(handle_add_wagon))
            .route(
                "/api/coasters/:coaster_id/wagons/:wagon_id",
                delete(handle_remove_wagon),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until shutdown is requested
    pub async fn start(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown::requested(&mut shutdown).await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Create coaster request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateCoasterRequest {
    #[serde(alias = "liczba_personelu")]
    pub staff_total: Option<f64>,
    #[serde(alias = "liczba_klientow")]
    pub clients_total: Option<f64>,
    #[serde(alias = "dl_trasy")]
    pub route_length: Option<f64>,
    #[serde(alias = "godziny_od")]
    pub opening_time: Option<String>,
    #[serde(alias = "godziny_do")]
    pub closing_time: Option<String>,
}

/// Update coaster request. Route length and wagons are not editable here.
#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateCoasterRequest {
    #[serde(alias = "liczba_personelu")]
    pub staff_total: Option<f64>,
    #[serde(alias = "liczba_klientow")]
    pub clients_total: Option<f64>,
    #[serde(alias = "godziny_od")]
    pub opening_time: Option<String>,
    #[serde(alias = "godziny_do")]
    pub closing_time: Option<String>,
}

/// Add wagon request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateWagonRequest {
    #[serde(alias = "predkosc_wagonu")]
    pub speed: Option<f64>,
    #[serde(alias = "ilosc_miejsc")]
    pub seats_count: Option<f64>,
}

/// Id of a created resource
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
    pub term: u64,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut errors = ValidationErrors::default();
    errors.push(message);
    (status, Json(errors)).into_response()
}

/// Unwrap a JSON body, turning a rejection into the usual error list
fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> std::result::Result<T, Response> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            tracing::debug!("Rejected request body: {}", rejection.body_text());
            Err(error_response(StatusCode::BAD_REQUEST, rejection.body_text()))
        }
    }
}

fn coaster_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Coaster does not exist.")
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Save locally, then broadcast. Nothing is published if the save fails.
async fn save_and_publish(state: &AppState, event: MutationEvent<Coaster>) -> bool {
    if !state.store.save_record(&event.payload).await {
        return false;
    }
    state.bus.publish(&event).await;
    true
}

// ============ Handlers ============

async fn handle_ping() -> &'static str {
    "pong"
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let leadership = state.leadership.current();
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        is_leader: leadership.is_leader(),
        term: leadership.term,
    })
}

async fn handle_create_coaster(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateCoasterRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let mut errors = ValidationErrors::default();
    let coaster = Coaster {
        id: new_id(),
        staff_total: errors.count("staff_total", req.staff_total),
        clients_total: errors.count("clients_total", req.clients_total),
        route_length: errors.number("route_length", req.route_length),
        opening_time: errors.text("opening_time", req.opening_time),
        closing_time: errors.text("closing_time", req.closing_time),
        wagons: Vec::new(),
    };
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }
    if let Err(errors) = validate_coaster(&coaster) {
        tracing::debug!("Rejected coaster: {}", errors);
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }

    let id = coaster.id.clone();
    if !save_and_publish(&state, MutationEvent::created(coaster)).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save coaster.");
    }

    tracing::info!("Created coaster {}", id);
    (StatusCode::CREATED, Json(CreatedResponse { id })).into_response()
}

async fn handle_update_coaster(
    State(state): State<Arc<AppState>>,
    Path(coaster_id): Path<String>,
    payload: std::result::Result<Json<UpdateCoasterRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(existing) = state.store.load_one(&coaster_id).await else {
        return coaster_not_found();
    };

    let mut errors = ValidationErrors::default();
    let coaster = Coaster {
        staff_total: errors.count("staff_total", req.staff_total),
        clients_total: errors.count("clients_total", req.clients_total),
        opening_time: errors.text("opening_time", req.opening_time),
        closing_time: errors.text("closing_time", req.closing_time),
        ..existing
    };
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }
    if let Err(errors) = validate_coaster(&coaster) {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }

    if !save_and_publish(&state, MutationEvent::updated(coaster)).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save coaster.");
    }

    tracing::info!("Updated coaster {}", coaster_id);
    StatusCode::OK.into_response()
}

async fn handle_add_wagon(
    State(state): State<Arc<AppState>>,
    Path(coaster_id): Path<String>,
    payload: std::result::Result<Json<CreateWagonRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(mut coaster) = state.store.load_one(&coaster_id).await else {
        return coaster_not_found();
    };

    let mut errors = ValidationErrors::default();
    let wagon = Wagon {
        id: new_id(),
        speed: errors.number("speed", req.speed),
        seats_count: errors.count("seats_count", req.seats_count),
    };
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }
    if let Err(errors) = validate_wagon(&wagon) {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }

    let wagon_id = wagon.id.clone();
    coaster.wagons.push(wagon);
    if !save_and_publish(&state, MutationEvent::updated(coaster)).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save coaster.");
    }

    tracing::info!("Added wagon {} to coaster {}", wagon_id, coaster_id);
    (StatusCode::CREATED, Json(CreatedResponse { id: wagon_id })).into_response()
}

async fn handle_remove_wagon(
    State(state): State<Arc<AppState>>,
    Path((coaster_id, wagon_id)): Path<(String, String)>,
) -> Response {
    let Some(mut coaster) = state.store.load_one(&coaster_id).await else {
        return coaster_not_found();
    };
    let Some(position) = coaster.wagon_position(&wagon_id) else {
        return error_response(StatusCode::NOT_FOUND, "Wagon does not exist on this coaster.");
    };

    coaster.wagons.remove(position);
    if !save_and_publish(&state, MutationEvent::updated(coaster)).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save coaster.");
    }

    tracing::info!("Removed wagon {} from coaster {}", wagon_id, coaster_id);
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryClient, MemoryCoordinator, PubSub, Subscription};
    use crate::replication::MutationKind;
    use crate::state::{LeaderRole, Leadership};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;
    use tower::ServiceExt;

    const CHANNEL: &str = "coasters:dev:channel";

    struct Harness {
        _dir: TempDir,
        _leadership: watch::Sender<Leadership>,
        store: RecordStore<Coaster>,
        router: Router,
        client: MemoryClient,
        feed: Subscription,
    }

    async fn harness_with_store(dir: TempDir, store: RecordStore<Coaster>) -> Harness {
        let service = MemoryCoordinator::new();
        let client = service.client();
        let feed = service.client().subscribe(CHANNEL).await.unwrap();
        let bus = Arc::new(MutationBus::new(Arc::new(client.clone()), CHANNEL.to_string()));
        let (tx, rx) = watch::channel(Leadership {
            role: LeaderRole::Leader,
            term: 3,
        });

        let state = Arc::new(AppState {
            node_id: "node-1".to_string(),
            store: store.clone(),
            bus,
            leadership: LeadershipWatch::new(rx),
        });

        Harness {
            _dir: dir,
            _leadership: tx,
            store,
            router: HttpServer::create_router(state),
            client,
            feed,
        }
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("dev_db"));
        harness_with_store(dir, store).await
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn coaster_body() -> serde_json::Value {
        serde_json::json!({
            "staff_total": 5,
            "clients_total": 400,
            "route_length": 1800,
            "opening_time": "08:00",
            "closing_time": "16:00",
        })
    }

    async fn next_event(feed: &mut Subscription) -> MutationEvent<Coaster> {
        let bytes = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        MutationEvent::decode(&bytes).unwrap()
    }

    async fn create(h: &Harness) -> String {
        let (status, body) = send(&h.router, "POST", "/api/coasters", Some(coaster_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_slice::<CreatedResponse>(&body).unwrap().id
    }

    #[tokio::test]
    async fn test_ping() {
        let h = harness().await;
        let (status, body) = send(&h.router, "GET", "/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn test_health_reports_leadership() {
        let h = harness().await;
        let (status, body) = send(&h.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(health.healthy);
        assert!(health.is_leader);
        assert_eq!(health.term, 3);
        assert_eq!(health.node_id, "node-1");
    }

    #[tokio::test]
    async fn test_create_saves_then_publishes() {
        let mut h = harness().await;
        let id = create(&h).await;
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let saved = h.store.load_one(&id).await.unwrap();
        assert_eq!(saved.staff_total, 5);
        assert!(saved.wagons.is_empty());

        let event = next_event(&mut h.feed).await;
        assert_eq!(event.kind, MutationKind::Created);
        assert_eq!(event.payload, saved);
    }

    #[tokio::test]
    async fn test_create_accepts_legacy_field_names() {
        let h = harness().await;
        let body = serde_json::json!({
            "liczba_personelu": 3,
            "liczba_klientow": 100,
            "dl_trasy": 900,
            "godziny_od": "09:00",
            "godziny_do": "17:30",
        });
        let (status, body) = send(&h.router, "POST", "/api/coasters", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let id = serde_json::from_slice::<CreatedResponse>(&body).unwrap().id;
        assert_eq!(h.store.load_one(&id).await.unwrap().closing_time, "17:30");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_fields() {
        let mut h = harness().await;
        let body = serde_json::json!({
            "staff_total": 0,
            "clients_total": 10,
            "route_length": 100,
            "opening_time": "18:00",
            "closing_time": "08:00",
        });
        let (status, body) = send(&h.router, "POST", "/api/coasters", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let errors: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(errors["errors"].as_array().unwrap().len(), 2);
        assert!(h.store.load_all().await.is_empty());
        assert!(h.feed.try_next().is_none());
    }

    #[tokio::test]
    async fn test_create_reports_missing_fields() {
        let h = harness().await;
        let (status, body) = send(&h.router, "POST", "/api/coasters", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let errors: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(errors["errors"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_create_rejects_wrongly_typed_field() {
        let mut h = harness().await;
        let mut body = coaster_body();
        body["staff_total"] = serde_json::json!("abc");
        let (status, body) = send(&h.router, "POST", "/api/coasters", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let errors: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(errors["errors"].as_array().unwrap().len(), 1);
        assert!(h.store.load_all().await.is_empty());
        assert!(h.feed.try_next().is_none());
    }

    #[tokio::test]
    async fn test_malformed_wagon_body_is_rejected() {
        let h = harness().await;
        let id = create(&h).await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/coasters/{}/wagons", id))
            .header("content-type", "application/json")
            .body(Body::from("{\"speed\": 1.2,"))
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let errors: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(errors["errors"].as_array().unwrap().len(), 1);
        assert!(h.store.load_one(&id).await.unwrap().wagons.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_route_and_wagons() {
        let mut h = harness().await;
        let id = create(&h).await;
        next_event(&mut h.feed).await;

        let (status, _) = send(
            &h.router,
            "POST",
            &format!("/api/coasters/{}/wagons", id),
            Some(serde_json::json!({ "speed": 1.2, "seats_count": 32 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        next_event(&mut h.feed).await;

        let update = serde_json::json!({
            "staff_total": 7,
            "clients_total": 900,
            "route_length": 1,
            "opening_time": "10:00",
            "closing_time": "22:00",
        });
        let (status, _) = send(&h.router, "PUT", &format!("/api/coasters/{}", id), Some(update)).await;
        assert_eq!(status, StatusCode::OK);

        let event = next_event(&mut h.feed).await;
        assert_eq!(event.kind, MutationKind::Updated);
        assert_eq!(event.payload.staff_total, 7);
        assert_eq!(event.payload.route_length, 1800.0);
        assert_eq!(event.payload.wagons.len(), 1);
        assert_eq!(h.store.load_one(&id).await.unwrap(), event.payload);
    }

    #[tokio::test]
    async fn test_update_unknown_coaster() {
        let h = harness().await;
        let body = serde_json::json!({
            "staff_total": 7,
            "clients_total": 900,
            "opening_time": "10:00",
            "closing_time": "22:00",
        });
        let (status, _) = send(&h.router, "PUT", "/api/coasters/missing", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wagon_add_and_remove() {
        let mut h = harness().await;
        let id = create(&h).await;
        next_event(&mut h.feed).await;

        let (status, body) = send(
            &h.router,
            "POST",
            &format!("/api/coasters/{}/wagons", id),
            Some(serde_json::json!({ "predkosc_wagonu": 1.5, "ilosc_miejsc": 20 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let wagon_id = serde_json::from_slice::<CreatedResponse>(&body).unwrap().id;
        assert_eq!(next_event(&mut h.feed).await.payload.wagons[0].id, wagon_id);

        let uri = format!("/api/coasters/{}/wagons/{}", id, wagon_id);
        let (status, _) = send(&h.router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(next_event(&mut h.feed).await.payload.wagons.is_empty());
        assert!(h.store.load_one(&id).await.unwrap().wagons.is_empty());

        let (status, _) = send(&h.router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_wagon_is_rejected() {
        let h = harness().await;
        let id = create(&h).await;

        let (status, _) = send(
            &h.router,
            "POST",
            &format!("/api/coasters/{}/wagons", id),
            Some(serde_json::json!({ "speed": -1, "seats_count": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.store.load_one(&id).await.unwrap().wagons.is_empty());

        let (status, _) = send(
            &h.router,
            "POST",
            "/api/coasters/missing/wagons",
            Some(serde_json::json!({ "speed": 1, "seats_count": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_save_failure_is_a_server_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        let store = RecordStore::new(dir.path().join("blocker").join("dev_db"));
        let mut h = harness_with_store(dir, store).await;

        let (status, _) = send(&h.router, "POST", "/api/coasters", Some(coaster_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(h.feed.try_next().is_none());
    }

    #[tokio::test]
    async fn test_publish_outage_still_saves() {
        let h = harness().await;
        h.client.set_online(false);

        let id = create(&h).await;
        assert!(h.store.load_one(&id).await.is_some());
    }
}
