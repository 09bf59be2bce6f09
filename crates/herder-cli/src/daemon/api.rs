use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use herder::{Env, ErrorKind, StatusRecord};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::daemon::{status_map, Daemon};

#[derive(Clone)]
pub struct AppState {
	pub daemon: Arc<Daemon>,
}

pub fn router(daemon: Arc<Daemon>) -> Router {
	let state = AppState { daemon };

	Router::new()
		.route("/api/processes", get(list_processes).post(start_process))
		.route("/api/processes/{name}", get(process_detail).delete(remove_process))
		.route("/api/processes/{name}/stop", post(stop_process))
		.route("/api/processes/{name}/restart", post(restart_process))
		.route("/api/load", post(load_config))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Debug, Deserialize)]
struct StartBody {
	name: String,
	#[serde(default)]
	binary: String,
	#[serde(default)]
	args: Vec<String>,
	#[serde(default)]
	env: Option<Vec<String>>,
	#[serde(default)]
	dir: String,
}

#[derive(Debug, Deserialize)]
struct LoadBody {
	path: PathBuf,
}

#[derive(Serialize)]
struct ActionResponse {
	message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
	kind: ErrorKind,
	error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(kind: ErrorKind) -> StatusCode {
	match kind {
		ErrorKind::NotFound => StatusCode::NOT_FOUND,
		ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
		ErrorKind::InvalidConfig => StatusCode::BAD_REQUEST,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

fn api_error(e: herder::Error) -> ApiError {
	let kind = e.kind();
	(
		status_for(kind),
		Json(ErrorResponse {
			kind,
			error: e.to_string(),
		}),
	)
}

fn action(message: String) -> Json<ActionResponse> {
	Json(ActionResponse { message })
}

async fn list_processes(State(state): State<AppState>) -> Json<BTreeMap<String, StatusRecord>> {
	Json(status_map(&state.daemon.manager).await)
}

async fn process_detail(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
	state
		.daemon
		.manager
		.get(&name)
		.await
		.map(|p| Json(p.status_record()))
		.ok_or_else(|| api_error(herder::Error::NotFound(name)))
}

async fn start_process(
	State(state): State<AppState>,
	Json(body): Json<StartBody>,
) -> Result<(StatusCode, Json<StatusRecord>), ApiError> {
	let process = state
		.daemon
		.manager
		.start_process(&body.name, &body.binary, body.args, Env::from_wire(body.env), &body.dir)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(process.status_record())))
}

async fn stop_process(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	state.daemon.manager.stop_process(&name).await.map_err(api_error)?;
	Ok(action(format!("{}: stopping", name)))
}

async fn restart_process(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	state.daemon.manager.restart_process(&name).await.map_err(api_error)?;
	Ok(action(format!("{}: restarted", name)))
}

async fn remove_process(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	state.daemon.manager.remove_process(&name).await.map_err(api_error)?;
	Ok(action(format!("{}: removed", name)))
}

async fn load_config(
	State(state): State<AppState>,
	Json(body): Json<LoadBody>,
) -> Result<Json<ActionResponse>, ApiError> {
	state.daemon.manager.load_processes(&body.path).await.map_err(api_error)?;
	Ok(action(format!("loaded {}", body.path.display())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_kinds_map_to_http_status() {
		assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
		assert_eq!(status_for(ErrorKind::Unimplemented), StatusCode::NOT_IMPLEMENTED);
		assert_eq!(status_for(ErrorKind::InvalidConfig), StatusCode::BAD_REQUEST);
		assert_eq!(status_for(ErrorKind::Io), StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(status_for(ErrorKind::Signal), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[test]
	fn api_error_body_names_the_process() {
		let (status, Json(body)) = api_error(herder::Error::NotFound("web".into()));
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body.kind, ErrorKind::NotFound);
		assert_eq!(body.error, "process not found: web");
	}
}
