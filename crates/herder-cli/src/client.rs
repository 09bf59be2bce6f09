use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::paths::DaemonPaths;
use crate::protocol::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("daemon not running")]
	NotRunning,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("serialize error: {0}")]
	Serialize(String),
	#[error("deserialize error: {0}")]
	Deserialize(String),
}

/// Blocking connection to a running daemon.
pub struct DaemonClient {
	stream: UnixStream,
}

impl DaemonClient {
	pub fn connect(socket_path: &Path) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(socket_path).map_err(|_| ClientError::NotRunning)?;
		Ok(Self { stream })
	}

	pub fn send(&mut self, request: &Request) -> Result<Response, ClientError> {
		let mut data = serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		if reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
