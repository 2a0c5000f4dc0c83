//! API server for storefront-sleuth.

use crate::correlation::{CorrelationStore, Resolution};
use crate::domain::clean_store_url;
use crate::error::AppError;
use crate::models::{ReviewRecord, StorefrontId, StorefrontStatus};
use crate::scheduler::Scheduler;
use crate::store::StorefrontStore;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply, http::StatusCode};

/// API response structure
#[derive(Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
}

fn ok_json<T: Serialize>(message: impl Into<String>, result: T) -> warp::reply::Json {
    warp::reply::json(&ApiResponse {
        success: true,
        message: message.into(),
        result: Some(result),
    })
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    app_name: Option<String>,
}

#[derive(Deserialize)]
struct AppQuery {
    app_name: Option<String>,
}

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SetUrlRequest {
    url: String,
    #[serde(default = "default_verified")]
    verified: bool,
}

fn default_verified() -> bool {
    true
}

#[derive(Deserialize)]
struct OpenResolutionRequest {
    storefront_id: StorefrontId,
}

/// A storefront URL picked by whoever served a resolution request.
///
/// `storefront_id` is optional; when sent it must name the storefront the
/// resolution was opened for.
#[derive(Deserialize, Debug)]
struct ResolveRequest {
    url: String,
    #[serde(default)]
    storefront_id: Option<StorefrontId>,
}

/// Shared handles every route needs.
#[derive(Clone)]
pub(crate) struct ApiState {
    store: Arc<dyn StorefrontStore>,
    scheduler: Arc<Scheduler>,
    /// Open URL resolutions, keyed to the storefront they were opened for.
    resolutions: Arc<CorrelationStore<StorefrontId, String>>,
}

impl ApiState {
    pub(crate) fn new(store: Arc<dyn StorefrontStore>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            scheduler,
            resolutions: Arc::new(CorrelationStore::new()),
        }
    }

    /// Admission is best effort here; a full pool simply picks the storefront up later.
    async fn try_admit(&self) -> Option<StorefrontId> {
        match self.scheduler.admit().await {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(target: "api", "Admission after update failed: {}", e);
                None
            }
        }
    }
}

/// Start the API server
pub(crate) async fn start_api_server(port: u16, state: ApiState, resolution_ttl: Duration) {
    let resolutions = state.resolutions.clone();
    let period = resolution_ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let purged = resolutions.purge_expired(resolution_ttl);
            if purged > 0 {
                tracing::info!(
                    target: "api",
                    "Dropped {} unclaimed resolutions, {} still open",
                    purged,
                    resolutions.len()
                );
            }
        }
    });

    let routes = api_routes(state).with(warp::cors().allow_any_origin());
    tracing::info!(target: "api", "Starting API server on port {}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(64 * 1024).and(warp::body::json())
}

/// Every route, with rejections rendered as JSON.
pub(crate) fn api_routes(state: ApiState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("health").and(warp::get()).map(|| {
        warp::reply::json(&ApiResponse::<()> {
            success: true,
            message: "Storefront Sleuth API is running".to_string(),
            result: None,
        })
    });

    let pending = warp::path!("api" / "storefronts" / "pending")
        .and(warp::get())
        .and(warp::query::<PendingQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_pending);

    let next_pending = warp::path!("api" / "storefronts" / "next")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_next_pending);

    let list = warp::path!("api" / "storefronts")
        .and(warp::get())
        .and(warp::query::<ListQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_list);

    let create = warp::path!("api" / "storefronts")
        .and(warp::post())
        .and(json_body::<ReviewRecord>())
        .and(with_state(state.clone()))
        .and_then(handle_create);

    let get = warp::path!("api" / "storefronts" / StorefrontId)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_get);

    let set_url = warp::path!("api" / "storefronts" / StorefrontId / "url")
        .and(warp::put())
        .and(json_body::<SetUrlRequest>())
        .and(with_state(state.clone()))
        .and_then(handle_set_url);

    let skip = warp::path!("api" / "storefronts" / StorefrontId / "skip")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handle_skip);

    let top_off = warp::path!("api" / "harvest" / "top-off")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handle_top_off);

    let active = warp::path!("api" / "harvest" / "active")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_active);

    let statistics = warp::path!("api" / "statistics")
        .and(warp::get())
        .and(warp::query::<AppQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_statistics);

    let open_resolution = warp::path!("api" / "resolutions")
        .and(warp::post())
        .and(json_body::<OpenResolutionRequest>())
        .and(with_state(state.clone()))
        .and_then(handle_open_resolution);

    let resolve = warp::path!("api" / "resolutions" / Uuid)
        .and(warp::post())
        .and(json_body::<ResolveRequest>())
        .and(with_state(state.clone()))
        .and_then(handle_resolve);

    let poll = warp::path!("api" / "resolutions" / Uuid)
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_poll);

    health
        .or(pending)
        .or(next_pending)
        .or(list)
        .or(create)
        .or(get)
        .or(set_url)
        .or(skip)
        .or(top_off)
        .or(active)
        .or(statistics)
        .or(open_resolution)
        .or(resolve)
        .or(poll)
        .recover(handle_rejection)
}

async fn handle_list(query: ListQuery, state: ApiState) -> Result<impl Reply, Rejection> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<StorefrontStatus>()
                .map_err(|e| reject(AppError::InvalidInput(e)))?,
        ),
        None => None,
    };
    let storefronts = state
        .store
        .list_storefronts(status, query.app_name.as_deref())
        .await
        .map_err(reject)?;
    Ok(ok_json(format!("{} storefronts", storefronts.len()), storefronts))
}

async fn handle_pending(query: PendingQuery, state: ApiState) -> Result<impl Reply, Rejection> {
    let storefronts = state
        .store
        .pending_url_storefronts(query.limit)
        .await
        .map_err(reject)?;
    Ok(ok_json(format!("{} storefronts need a URL", storefronts.len()), storefronts))
}

async fn handle_next_pending(state: ApiState) -> Result<impl Reply, Rejection> {
    let next = state.store.next_pending_url().await.map_err(reject)?;
    let message = if next.is_some() {
        "Next storefront needing a URL"
    } else {
        "No more storefronts pending"
    };
    Ok(ok_json(message, next))
}

async fn handle_create(record: ReviewRecord, state: ApiState) -> Result<impl Reply, Rejection> {
    let storefront = state.store.add_storefront(&record).await.map_err(reject)?;
    tracing::info!(target: "api", "Added storefront {} ('{}')", storefront.id, storefront.name);
    if storefront.base_url.is_some() {
        state.try_admit().await;
    }
    Ok(warp::reply::with_status(
        ok_json("Storefront created", storefront),
        StatusCode::CREATED,
    ))
}

async fn handle_get(id: StorefrontId, state: ApiState) -> Result<impl Reply, Rejection> {
    let storefront = state
        .store
        .get_storefront(id)
        .await
        .map_err(reject)?
        .ok_or_else(|| reject(AppError::StorefrontNotFound(id)))?;
    Ok(ok_json("Storefront found", storefront))
}

#[derive(Serialize)]
struct UrlUpdate<T> {
    storefront: T,
    admitted: Option<StorefrontId>,
}

async fn handle_set_url(
    id: StorefrontId,
    request: SetUrlRequest,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let storefront = state
        .store
        .set_base_url(id, &request.url, request.verified)
        .await
        .map_err(reject)?;
    let admitted = state.try_admit().await;
    Ok(ok_json("Storefront URL updated", UrlUpdate { storefront, admitted }))
}

async fn handle_skip(id: StorefrontId, state: ApiState) -> Result<impl Reply, Rejection> {
    let storefront = state.store.skip_storefront(id).await.map_err(reject)?;
    Ok(ok_json("Storefront skipped", storefront))
}

async fn handle_top_off(state: ApiState) -> Result<impl Reply, Rejection> {
    let admitted = state.scheduler.top_off().await.map_err(reject)?;
    Ok(ok_json(
        format!("Admitted {} storefronts", admitted),
        serde_json::json!({
            "admitted": admitted,
            "capacity": state.scheduler.max_concurrency(),
        }),
    ))
}

async fn handle_active(state: ApiState) -> Result<impl Reply, Rejection> {
    let jobs = state.scheduler.active_jobs().await;
    Ok(ok_json(format!("{} active harvests", jobs.len()), jobs))
}

async fn handle_statistics(query: AppQuery, state: ApiState) -> Result<impl Reply, Rejection> {
    let stats = state
        .store
        .statistics(query.app_name.as_deref())
        .await
        .map_err(reject)?;
    Ok(ok_json("Statistics", stats))
}

async fn handle_open_resolution(
    request: OpenResolutionRequest,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let storefront = state
        .store
        .get_storefront(request.storefront_id)
        .await
        .map_err(reject)?
        .ok_or_else(|| reject(AppError::StorefrontNotFound(request.storefront_id)))?;
    let resolution_id = state.resolutions.open(storefront.id);
    tracing::info!(
        target: "api",
        "Opened resolution {} for storefront {} ('{}')",
        resolution_id,
        storefront.id,
        storefront.name
    );
    Ok(warp::reply::with_status(
        ok_json(
            "Resolution opened",
            serde_json::json!({
                "resolution_id": resolution_id,
                "storefront_id": storefront.id,
                "store_name": storefront.name,
                "country": storefront.country,
            }),
        ),
        StatusCode::CREATED,
    ))
}

async fn handle_resolve(rid: Uuid, request: ResolveRequest, state: ApiState) -> Result<impl Reply, Rejection> {
    let Some(storefront_id) = state.resolutions.context(rid) else {
        return Err(warp::reject::custom(UnknownResolution(rid)));
    };
    if let Some(claimed) = request.storefront_id.filter(|&claimed| claimed != storefront_id) {
        return Err(reject(AppError::InvalidInput(format!(
            "resolution {} belongs to storefront {}, not {}",
            rid, storefront_id, claimed
        ))));
    }
    let url = clean_store_url(&request.url).map_err(reject)?;
    if !state.resolutions.resolve(rid, url) {
        return Err(warp::reject::custom(UnknownResolution(rid)));
    }
    Ok(ok_json(
        "Resolution stored",
        serde_json::json!({ "resolution_id": rid, "storefront_id": storefront_id }),
    ))
}

async fn handle_poll(rid: Uuid, state: ApiState) -> Result<impl Reply, Rejection> {
    match state.resolutions.poll(rid) {
        Resolution::Pending => Ok(ok_json("Resolution pending", serde_json::json!({ "status": "pending" }))),
        Resolution::Ready { context, value } => {
            let storefront = match state.store.set_base_url(context, &value, true).await {
                Ok(storefront) => storefront,
                Err(e) => {
                    tracing::warn!(target: "api", "Keeping resolution {} after failed update: {}", rid, e);
                    state.resolutions.restore(rid, context, value);
                    return Err(reject(e));
                }
            };
            let admitted = state.try_admit().await;
            Ok(ok_json(
                "Resolution applied",
                serde_json::json!({
                    "status": "ready",
                    "storefront": storefront,
                    "admitted": admitted,
                }),
            ))
        }
        Resolution::Unknown => Err(warp::reject::custom(UnknownResolution(rid))),
    }
}

/// Custom error type for API rejections
#[derive(Debug)]
struct ApiError(AppError);

impl warp::reject::Reject for ApiError {}

/// The resolution id was never opened, was already consumed, or expired.
#[derive(Debug)]
struct UnknownResolution(Uuid);

impl warp::reject::Reject for UnknownResolution {}

fn reject(err: AppError) -> Rejection {
    warp::reject::custom(ApiError(err))
}

/// Handle API rejections
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(ApiError(app_err)) = err.find::<ApiError>() {
        let status = match app_err {
            AppError::StorefrontNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::UrlParse(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(target: "api", "Request failed: {}", app_err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, app_err.to_string())
    } else if let Some(UnknownResolution(rid)) = err.find::<UnknownResolution>() {
        (StatusCode::NOT_FOUND, format!("Unknown resolution {}", rid))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        (StatusCode::BAD_REQUEST, "Bad request".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()> {
            success: false,
            message,
            result: None,
        }),
        status,
    ))
}
