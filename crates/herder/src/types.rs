use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment handed to a spawned child.
///
/// `Inherit` and `Explicit(vec![])` are different things: the former copies
/// the supervisor's environment, the latter starts the child with nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Env {
	#[default]
	Inherit,
	Explicit(Vec<String>),
}

impl Env {
	/// `None` on the wire means inherit.
	pub fn from_wire(env: Option<Vec<String>>) -> Self {
		match env {
			Some(vars) => Env::Explicit(vars),
			None => Env::Inherit,
		}
	}

	pub fn to_wire(&self) -> Option<Vec<String>> {
		match self {
			Env::Inherit => None,
			Env::Explicit(vars) => Some(vars.clone()),
		}
	}

	/// `KEY=VALUE` pairs; entries without `=` map to an empty value.
	pub fn pairs(vars: &[String]) -> impl Iterator<Item = (&str, &str)> {
		vars.iter().map(|kv| kv.split_once('=').unwrap_or((kv.as_str(), "")))
	}
}

/// OS-level process state, one letter per state as `ps` prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
	#[serde(rename = "R")]
	Running,
	#[serde(rename = "S")]
	Sleeping,
	#[serde(rename = "T")]
	Stopped,
	#[serde(rename = "I")]
	Idle,
	#[serde(rename = "Z")]
	Zombie,
	#[serde(rename = "W")]
	Waiting,
	#[serde(rename = "L")]
	Locked,
	/// No live handle, or the OS query failed.
	#[serde(rename = "E")]
	Error,
}

impl ProcessStatus {
	pub fn code(&self) -> &'static str {
		match self {
			ProcessStatus::Running => "R",
			ProcessStatus::Sleeping => "S",
			ProcessStatus::Stopped => "T",
			ProcessStatus::Idle => "I",
			ProcessStatus::Zombie => "Z",
			ProcessStatus::Waiting => "W",
			ProcessStatus::Locked => "L",
			ProcessStatus::Error => "E",
		}
	}

	/// A stopped (suspended) process still holds its pid and must be killed
	/// before a respawn; zombies and errors are already gone.
	pub fn is_alive(&self) -> bool {
		!matches!(self, ProcessStatus::Zombie | ProcessStatus::Error)
	}
}

impl From<sysinfo::ProcessStatus> for ProcessStatus {
	fn from(status: sysinfo::ProcessStatus) -> Self {
		use sysinfo::ProcessStatus as Os;
		match status {
			Os::Run => ProcessStatus::Running,
			Os::Sleep | Os::UninterruptibleDiskSleep => ProcessStatus::Sleeping,
			Os::Stop | Os::Tracing => ProcessStatus::Stopped,
			Os::Idle => ProcessStatus::Idle,
			Os::Zombie => ProcessStatus::Zombie,
			Os::Waking | Os::Wakekill | Os::Parked => ProcessStatus::Waiting,
			Os::LockBlocked => ProcessStatus::Locked,
			_ => ProcessStatus::Error,
		}
	}
}

/// Snapshot of one supervised process as reported to control clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusRecord {
	pub name: String,
	pub binary: PathBuf,
	pub args: Vec<String>,
	pub env: Option<Vec<String>>,
	pub dir: String,
	pub pid: Option<u32>,
	pub output_file: Option<PathBuf>,
	pub error_file: Option<PathBuf>,
	pub pid_file: Option<PathBuf>,
	pub daemon: bool,
	pub status: ProcessStatus,
	pub start_at: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_wire_sentinel() {
		assert_eq!(Env::from_wire(None), Env::Inherit);
		assert_eq!(Env::from_wire(Some(vec![])), Env::Explicit(vec![]));
		assert_eq!(Env::Explicit(vec![]).to_wire(), Some(vec![]));
		assert_eq!(Env::Inherit.to_wire(), None);
	}

	#[test]
	fn env_pairs_split_on_first_equals() {
		let vars = vec!["A=1".to_string(), "B=x=y".to_string(), "C".to_string()];
		let pairs: Vec<_> = Env::pairs(&vars).collect();
		assert_eq!(pairs, vec![("A", "1"), ("B", "x=y"), ("C", "")]);
	}

	#[test]
	fn status_codes_and_liveness() {
		assert_eq!(ProcessStatus::Running.code(), "R");
		assert_eq!(ProcessStatus::Error.code(), "E");
		assert!(ProcessStatus::Sleeping.is_alive());
		assert!(ProcessStatus::Stopped.is_alive());
		assert!(!ProcessStatus::Zombie.is_alive());
		assert!(!ProcessStatus::Error.is_alive());
		assert_eq!(serde_json::to_string(&ProcessStatus::Locked).unwrap(), "\"L\"");
	}
}
