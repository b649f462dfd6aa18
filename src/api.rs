//! Read only http api over the stored readings.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::database::{DatabaseParameters, PostgresStore, StoreError};
use crate::record::Reading;
use crate::shutdown::Shutdown;

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the http listener.
pub struct HttpParameters {
    /// The ip address the api should listen on.
    #[serde(default = "default_address")]
    pub address: String,
    /// The port the api should listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpParameters {
    fn default() -> Self {
        HttpParameters { address: default_address(), port: default_port() }
    }
}

fn default_address() -> String {
    String::from("0.0.0.0")
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Sensor data not found")]
    NotFound,
    #[error("{0}")]
    Storage(#[from] StoreError),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Storage(_) | ApiError::Task(_) => {
                log::error!(target: "sensord::http", "Request failed: \'{}\'", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Page {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

/// Runs `query` against a fresh database connection on the blocking pool.
async fn with_store<T, F>(database: &Arc<DatabaseParameters>, query: F) -> Result<T, ApiError>
    where T: Send + 'static,
          F: FnOnce(&mut PostgresStore) -> Result<T, StoreError> + Send + 'static
{
    let params = DatabaseParameters::clone(database);
    let result = tokio::task::spawn_blocking(move || query(&mut PostgresStore::new(params))).await?;
    Ok(result?)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "sensord is running!" }))
}

async fn list_readings(State(database): State<Arc<DatabaseParameters>>, Query(page): Query<Page>)
    -> Result<Json<Vec<Reading>>, ApiError>
{
    let readings = with_store(&database, move |store| {
        store.list_readings(i64::from(page.skip), i64::from(page.limit))
    }).await?;
    Ok(Json(readings))
}

async fn get_reading(State(database): State<Arc<DatabaseParameters>>, Path(id): Path<i64>)
    -> Result<Json<Reading>, ApiError>
{
    with_store(&database, move |store| store.get_reading(id)).await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub fn router(database: DatabaseParameters) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/sensor_data/", get(list_readings))
        .route("/sensor_data/:id", get(get_reading))
        .with_state(Arc::new(database))
}

async fn serve(params: HttpParameters, database: DatabaseParameters, shutdown: Shutdown) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((params.address.as_str(), params.port)).await?;
    let local_addr: SocketAddr = listener.local_addr()?;
    log::info!(target: "sensord::http", "Listening on \'{}\'", local_addr);

    let stop = async move {
        if let Err(err) = tokio::task::spawn_blocking(move || shutdown.wait()).await {
            log::error!(target: "sensord::http", "Shutdown watcher failed: \'{}\'", err);
        }
    };
    axum::serve(listener, router(database))
        .with_graceful_shutdown(stop)
        .await
}

/// Thread function for the http api.
///
/// Runs the api on its own runtime until the `shutdown` signal is triggered. If the api cannot
/// be started the shutdown is triggered so the rest of the daemon stops as well.
///
/// # Returns
///
/// * `true` - The api stopped because of the shutdown signal.
///
/// * `false` - The api failed and stopped on its own.
pub fn http_thread(params: HttpParameters, database: DatabaseParameters, shutdown: Shutdown) -> bool
{
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("http-worker")
        .enable_all()
        .build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!(target: "sensord::http", "Cannot create the http runtime: \'{}\'", err);
            shutdown.trigger();
            return false;
        }
    };

    if let Err(err) = runtime.block_on(serve(params, database, shutdown.clone())) {
        log::error!(target: "sensord::http", "Http api failed: \'{}\'", err);
        shutdown.trigger();
        return false;
    }
    log::info!(target: "sensord::http", "Http api stopped");
    true
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn database() -> DatabaseParameters {
        serde_yaml::from_str("hostname: localhost\nusername: sensord\ndatabase: sensord\n").unwrap()
    }

    #[test]
    fn occupied_port_fails_and_stops_the_daemon() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let params = HttpParameters {
            address: String::from("127.0.0.1"),
            port: occupied.local_addr().unwrap().port(),
        };
        let shutdown = Shutdown::new();

        assert!(!http_thread(params, database(), shutdown.clone()));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn shutdown_stops_the_api_cleanly() {
        let params = HttpParameters { address: String::from("127.0.0.1"), port: 0 };
        let shutdown = Shutdown::new();
        let api_shutdown = shutdown.clone();
        let handle = thread::spawn(move || http_thread(params, database(), api_shutdown));

        thread::sleep(Duration::from_millis(100));
        shutdown.trigger();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = ApiError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_errors_map_to_500() {
        let response = ApiError::Storage(StoreError::NotConnected).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn page_defaults() {
        let page: Page = serde_json::from_str("{}").unwrap();
        assert_eq!((page.skip, page.limit), (0, 100));
        let page: Page = serde_json::from_str(r#"{"skip": 20, "limit": 5}"#).unwrap();
        assert_eq!((page.skip, page.limit), (20, 5));
    }

    #[test]
    fn listener_defaults() {
        let params = HttpParameters::default();
        assert_eq!(params.address, "0.0.0.0");
        assert_eq!(params.port, 8000);
    }
}
