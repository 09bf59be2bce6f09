use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("process not found: {0}")]
	NotFound(String),

	#[error("{context}: {source}")]
	Io {
		context: String,
		#[source]
		source: std::io::Error,
	},

	#[error("not supported: {0}")]
	Unimplemented(&'static str),

	#[error("failed to signal pid {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: nix::errno::Errno,
	},

	#[error("invalid config {path}: {message}")]
	InvalidConfig { path: PathBuf, message: String },

	#[error("control loop already running")]
	AlreadyRunning,
}

/// Coarse classification of [`Error`], stable across the wire so clients can
/// tell "no such process" apart from a system failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	NotFound,
	Io,
	Unimplemented,
	Signal,
	InvalidConfig,
	Internal,
}

impl Error {
	pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
		Error::Io {
			context: context.into(),
			source,
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::NotFound(_) => ErrorKind::NotFound,
			Error::Io { .. } => ErrorKind::Io,
			Error::Unimplemented(_) => ErrorKind::Unimplemented,
			Error::Signal { .. } => ErrorKind::Signal,
			Error::InvalidConfig { .. } => ErrorKind::InvalidConfig,
			Error::AlreadyRunning => ErrorKind::Internal,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_separates_not_found_from_io() {
		let nf = Error::NotFound("web".into());
		let io = Error::io("create dir", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
		assert_eq!(nf.kind(), ErrorKind::NotFound);
		assert_eq!(io.kind(), ErrorKind::Io);
		assert_eq!(nf.to_string(), "process not found: web");
		assert!(io.to_string().starts_with("create dir: "));
	}
}
