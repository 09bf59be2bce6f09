use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Serve newline-delimited JSON requests on `socket_path` until the task is
/// dropped. Lines that don't parse are answered with `on_invalid(reason)`.
pub async fn run_socket_server<Req, Resp, F, Fut, E>(socket_path: &Path, handler: F, on_invalid: E) -> io::Result<()>
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let listener = UnixListener::bind(socket_path)?;
	tracing::info!("listening on {}", socket_path.display());

	let handler = Arc::new(handler);
	let on_invalid = Arc::new(on_invalid);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let on_invalid = Arc::clone(&on_invalid);
		tokio::spawn(async move {
			handle_connection(stream, handler, on_invalid).await;
		});
	}
}

async fn handle_connection<Req, Resp, F, Fut, E>(stream: UnixStream, handler: Arc<F>, on_invalid: Arc<E>)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				on_invalid(format!("invalid request: {}", e))
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::{ClientError, DaemonClient};
	use crate::protocol::{Request, Response};
	use herder::ErrorKind;

	#[tokio::test]
	async fn request_response_over_socket() {
		let dir = tempfile::tempdir().unwrap();
		let socket = dir.path().join("test.sock");

		let server_socket = socket.clone();
		tokio::spawn(async move {
			run_socket_server(
				&server_socket,
				|req: Request| async move {
					match req {
						Request::Ping => Response::Pong,
						other => Response::ok(format!("{:?}", other)),
					}
				},
				|message| Response::Error {
					kind: ErrorKind::Internal,
					message,
				},
			)
			.await
		});
		tokio::time::sleep(std::time::Duration::from_millis(100)).await;

		let client_socket = socket.clone();
		let responses = tokio::task::spawn_blocking(move || -> Result<Vec<Response>, ClientError> {
			let mut client = DaemonClient::connect(&client_socket)?;
			Ok(vec![
				client.send(&Request::Ping)?,
				client.send(&Request::Stop { name: "web".into() })?,
			])
		})
		.await
		.unwrap()
		.unwrap();

		assert_eq!(responses[0], Response::Pong);
		assert!(matches!(&responses[1], Response::Ok { message: Some(m) } if m.contains("web")));
	}

	#[tokio::test]
	async fn malformed_line_gets_error_reply() {
		let dir = tempfile::tempdir().unwrap();
		let socket = dir.path().join("bad.sock");

		let server_socket = socket.clone();
		tokio::spawn(async move {
			run_socket_server(
				&server_socket,
				|_: Request| async { Response::Pong },
				|message| Response::Error {
					kind: ErrorKind::Internal,
					message,
				},
			)
			.await
		});
		tokio::time::sleep(std::time::Duration::from_millis(100)).await;

		let mut stream = UnixStream::connect(&socket).await.unwrap();
		stream.write_all(b"{\"cmd\":\"bogus\"}\n").await.unwrap();
		let mut lines = BufReader::new(stream).lines();
		let line = lines.next_line().await.unwrap().unwrap();
		let resp: Response = serde_json::from_str(&line).unwrap();
		assert!(matches!(resp, Response::Error { kind: ErrorKind::Internal, .. }));
	}

	#[test]
	fn connect_without_daemon_is_not_running() {
		let dir = tempfile::tempdir().unwrap();
		let err = DaemonClient::connect(&dir.path().join("missing.sock")).err().unwrap();
		assert!(matches!(err, ClientError::NotRunning));
	}
}
