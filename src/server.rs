use std::{collections::BTreeSet, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    error::{ActilogError, Result},
    event::{ContextMap, Event, EventId, Initiator, Level},
    query::{ExpandSpec, FilterStage, QueryMode, QueryRequest, QueryResult, Refinement},
    service::LogService,
    store::{AppendRequest, EventStore},
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct AppState {
    service: Arc<LogService>,
}

pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(EventStore::open(config.event_store_path())?);
    let service = Arc::new(LogService::new(
        Arc::clone(&store),
        Arc::new(config.grants.clone()),
        config.list_page_size,
        config.page_limit,
    ));

    if let Some(days) = config.retention_days {
        spawn_retention(Arc::clone(&service), days);
    }

    let state = AppState {
        service: Arc::clone(&service),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/events", get(list_events).post(append_event))
        .route("/events/:id/occasions", get(expand_occasions))
        .route("/purge", post(purge))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("actilog listening on {addr}");
    axum::serve(listener, app)
        .await
        .map_err(|err| ActilogError::Io(err.into()))?;
    Ok(())
}

fn spawn_retention(service: Arc<LogService>, days: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(days as i64);
            let outcome = tokio::task::spawn_blocking({
                let service = Arc::clone(&service);
                move || service.purge_older_than(cutoff)
            })
            .await;
            match outcome {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!(removed, "retention sweep purged events"),
                Ok(Err(err)) => error!("retention sweep failed: {err}"),
                Err(err) => error!("retention sweep task failed: {err}"),
            }
        }
    });
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Query-string form of a listing request. Everything is optional;
/// missing fields fall back to the engine defaults.
#[derive(Debug, Default, Deserialize)]
struct ListParams {
    page: Option<usize>,
    page_size: Option<usize>,
    ceiling: Option<u64>,
    /// Comma-separated id allow-list.
    ids: Option<String>,
    min_level: Option<String>,
    search: Option<String>,
    stage: Option<FilterStage>,
}

impl ListParams {
    fn into_request(self) -> Result<QueryRequest> {
        let id_allowlist = match self.ids.as_deref() {
            None | Some("") => None,
            Some(raw) => {
                let mut ids = BTreeSet::new();
                for part in raw.split(',') {
                    let id = part.trim().parse::<EventId>().map_err(|_| {
                        ActilogError::InvalidRequest(format!("invalid id '{part}' in ids"))
                    })?;
                    ids.insert(id);
                }
                Some(ids)
            }
        };

        let min_level = match self.min_level.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<Level>()?),
        };
        let refinement = if min_level.is_some() || self.search.is_some() {
            Some(Refinement {
                stage: self.stage.unwrap_or_default(),
                min_level,
                search: self.search,
            })
        } else {
            None
        };

        Ok(QueryRequest {
            mode: QueryMode::Listing,
            page: self.page.unwrap_or(0),
            page_size: self.page_size.unwrap_or(0),
            id_allowlist,
            ceiling: self.ceiling.map(EventId::from_u64),
            refinement,
            expand: None,
        })
    }
}

async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<QueryResult>> {
    let token = bearer_token(&headers);
    let request = params.into_request()?;
    let result = tokio::task::spawn_blocking({
        let service = Arc::clone(&state.service);
        move || service.query(token.as_deref(), request)
    })
    .await
    .map_err(|err| ActilogError::Storage(format!("query task failed: {err}")))??;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct ExpandParams {
    occasion_id: String,
    count: Option<usize>,
}

async fn expand_occasions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(anchor): Path<u64>,
    Query(params): Query<ExpandParams>,
) -> Result<Json<QueryResult>> {
    let token = bearer_token(&headers);
    let request = QueryRequest {
        mode: QueryMode::ExpandGroup,
        expand: Some(ExpandSpec {
            anchor: EventId::from_u64(anchor),
            occasion_id: params.occasion_id,
            count: params.count.unwrap_or(usize::MAX),
        }),
        ..QueryRequest::default()
    };
    let result = tokio::task::spawn_blocking({
        let service = Arc::clone(&state.service);
        move || service.query(token.as_deref(), request)
    })
    .await
    .map_err(|err| ActilogError::Storage(format!("expand task failed: {err}")))??;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct AppendBody {
    category: String,
    level: Level,
    message: String,
    #[serde(default)]
    initiator: Initiator,
    #[serde(default)]
    occasion_id: Option<String>,
    #[serde(default)]
    context: ContextMap,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

async fn append_event(
    State(state): State<AppState>,
    Json(body): Json<AppendBody>,
) -> Result<(StatusCode, Json<Event>)> {
    let event = tokio::task::spawn_blocking({
        let service = Arc::clone(&state.service);
        move || {
            service.record(AppendRequest {
                category: body.category,
                level: body.level,
                message: body.message,
                initiator: body.initiator,
                occasion_id: body.occasion_id,
                context: body.context,
                timestamp: body.timestamp,
            })
        }
    })
    .await
    .map_err(|err| ActilogError::Storage(format!("append task failed: {err}")))??;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
struct PurgeBody {
    older_than_days: u32,
}

#[derive(Debug, Serialize)]
struct PurgeOutcome {
    removed: usize,
}

async fn purge(
    State(state): State<AppState>,
    Json(body): Json<PurgeBody>,
) -> Result<Json<PurgeOutcome>> {
    let cutoff = Utc::now() - chrono::Duration::days(body.older_than_days as i64);
    let removed = tokio::task::spawn_blocking({
        let service = Arc::clone(&state.service);
        move || service.purge_older_than(cutoff)
    })
    .await
    .map_err(|err| ActilogError::Storage(format!("purge task failed: {err}")))??;
    Ok(Json(PurgeOutcome { removed }))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}
