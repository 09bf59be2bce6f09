use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, TimeZone};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::types::{Env, ProcessStatus, StatusRecord};

pub const START_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything needed to build a fresh OS command for a process. Cloned into
/// every respawn; child handles are never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
	pub binary: PathBuf,
	pub args: Vec<String>,
	pub env: Env,
	/// Directory as requested, relative to the worker root.
	pub dir: String,
	/// Resolved working directory the child runs in.
	pub work_dir: PathBuf,
}

impl CommandSpec {
	pub(crate) fn command(&self) -> Command {
		let mut cmd = Command::new(&self.binary);
		cmd.args(&self.args)
			.current_dir(&self.work_dir)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		if let Env::Explicit(vars) = &self.env {
			cmd.env_clear();
			cmd.envs(Env::pairs(vars));
		}
		cmd
	}
}

/// Files created next to a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPaths {
	pub output_file: PathBuf,
	pub error_file: PathBuf,
	pub pid_file: PathBuf,
}

impl ProcessPaths {
	pub fn new(work_dir: &Path, name: &str) -> Self {
		Self {
			output_file: work_dir.join(format!("{}.out", name)),
			error_file: work_dir.join(format!("{}.err", name)),
			pid_file: work_dir.join(format!("{}.pid", name)),
		}
	}
}

/// OS handle of a process. A restart moves an entity back to `Live` with a
/// new pid; an `Exited` handle is never revived in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
	Absent,
	Live { pid: u32 },
	Exited { pid: u32, code: Option<i32> },
}

/// One supervised process, shared between the registry, the control loop and
/// the tasks watching its child.
#[derive(Debug)]
pub struct Process {
	name: String,
	spec: CommandSpec,
	daemon: AtomicI32,
	generation: AtomicU64,
	handle: Mutex<Handle>,
	paths: Mutex<Option<ProcessPaths>>,
	relay_error: Mutex<Option<String>>,
}

impl Process {
	pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
		let process = Self {
			name: name.into(),
			spec,
			daemon: AtomicI32::new(0),
			generation: AtomicU64::new(0),
			handle: Mutex::new(Handle::Absent),
			paths: Mutex::new(None),
			relay_error: Mutex::new(None),
		};
		process.daemon.fetch_add(1, Ordering::SeqCst);
		process
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn spec(&self) -> &CommandSpec {
		&self.spec
	}

	/// Any positive value means the control loop may restart this process.
	pub fn daemon_enabled(&self) -> bool {
		self.daemon.load(Ordering::SeqCst) > 0
	}

	pub(crate) fn disable_daemon(&self) {
		self.daemon.store(0, Ordering::SeqCst);
	}

	/// Bumped on every spawn; exit notifications carry the value they were
	/// issued under.
	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::SeqCst)
	}

	pub fn handle(&self) -> Handle {
		*lock(&self.handle)
	}

	pub fn pid(&self) -> Option<u32> {
		match self.handle() {
			Handle::Live { pid } => Some(pid),
			_ => None,
		}
	}

	pub fn paths(&self) -> Option<ProcessPaths> {
		lock(&self.paths).clone()
	}

	pub fn relay_error(&self) -> Option<String> {
		lock(&self.relay_error).clone()
	}

	pub(crate) fn mark_live(&self, pid: u32, paths: ProcessPaths) -> u64 {
		let mut handle = lock(&self.handle);
		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		*handle = Handle::Live { pid };
		*lock(&self.paths) = Some(paths);
		generation
	}

	/// Records the exit of the child spawned under `generation`. Returns false
	/// when a newer child has replaced it in the meantime.
	pub(crate) fn mark_exited(&self, generation: u64, code: Option<i32>) -> bool {
		let mut handle = lock(&self.handle);
		if self.generation() != generation {
			return false;
		}
		if let Handle::Live { pid } = *handle {
			*handle = Handle::Exited { pid, code };
		}
		true
	}

	pub(crate) fn record_relay_error(&self, message: String) {
		*lock(&self.relay_error) = Some(message);
	}

	/// Current OS state; [`ProcessStatus::Error`] when there is no live child
	/// or the OS cannot be queried.
	pub fn status(&self) -> ProcessStatus {
		match self.pid() {
			Some(pid) => os_process(pid, |p| ProcessStatus::from(p.status())).unwrap_or(ProcessStatus::Error),
			None => ProcessStatus::Error,
		}
	}

	/// OS creation time of the live child, or the unix epoch if unknown.
	pub fn start_time(&self) -> DateTime<Local> {
		self.pid()
			.and_then(|pid| os_process(pid, |p| p.start_time()))
			.and_then(|secs| Local.timestamp_opt(secs as i64, 0).single())
			.unwrap_or_else(|| DateTime::<Local>::from(std::time::UNIX_EPOCH))
	}

	/// Best-effort SIGKILL of the live child.
	pub fn terminate(&self) {
		if let Some(pid) = self.pid() {
			if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
				tracing::debug!("terminate {} (pid {}): {}", self.name, pid, e);
			}
		}
	}

	/// Ask the live child to shut down with SIGINT. No-op without a live child.
	pub fn interrupt(&self) -> Result<()> {
		match self.pid() {
			Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGINT)
				.map_err(|source| Error::Signal { pid, source }),
			None => Ok(()),
		}
	}

	pub fn status_record(&self) -> StatusRecord {
		let paths = self.paths();
		StatusRecord {
			name: self.name.clone(),
			binary: self.spec.binary.clone(),
			args: self.spec.args.clone(),
			env: self.spec.env.to_wire(),
			dir: self.spec.dir.clone(),
			pid: match self.handle() {
				Handle::Live { pid } | Handle::Exited { pid, .. } => Some(pid),
				Handle::Absent => None,
			},
			output_file: paths.as_ref().map(|p| p.output_file.clone()),
			error_file: paths.as_ref().map(|p| p.error_file.clone()),
			pid_file: paths.map(|p| p.pid_file),
			daemon: self.daemon_enabled(),
			status: self.status(),
			start_at: self.start_time().format(START_AT_FORMAT).to_string(),
		}
	}
}

fn os_process<R>(pid: u32, f: impl FnOnce(&sysinfo::Process) -> R) -> Option<R> {
	let pid = sysinfo::Pid::from_u32(pid);
	let mut sys = sysinfo::System::new();
	if !sys.refresh_process(pid) {
		return None;
	}
	sys.process(pid).map(f)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec() -> CommandSpec {
		CommandSpec {
			binary: "sleep".into(),
			args: vec!["30".into()],
			env: Env::Inherit,
			dir: "sleeper".into(),
			work_dir: "/tmp/herder/sleeper".into(),
		}
	}

	#[test]
	fn new_process_has_daemon_enabled_and_no_handle() {
		let p = Process::new("sleeper", spec());
		assert!(p.daemon_enabled());
		assert_eq!(p.handle(), Handle::Absent);
		assert_eq!(p.status(), ProcessStatus::Error);
		assert_eq!(p.start_time().timestamp(), 0);
		assert!(p.interrupt().is_ok());
	}

	#[test]
	fn stale_exit_does_not_clobber_new_child() {
		let p = Process::new("sleeper", spec());
		let paths = ProcessPaths::new(Path::new("/tmp"), "sleeper");
		let first = p.mark_live(100, paths.clone());
		let second = p.mark_live(200, paths);
		assert!(!p.mark_exited(first, Some(1)));
		assert_eq!(p.handle(), Handle::Live { pid: 200 });
		assert!(p.mark_exited(second, None));
		assert_eq!(p.handle(), Handle::Exited { pid: 200, code: None });
		assert_eq!(p.pid(), None);
	}

	#[test]
	fn disable_daemon_clears_flag() {
		let p = Process::new("sleeper", spec());
		p.disable_daemon();
		assert!(!p.daemon_enabled());
		p.disable_daemon();
		assert!(!p.daemon_enabled());
	}

	#[test]
	fn derived_paths() {
		let paths = ProcessPaths::new(Path::new("/run/web"), "web");
		assert_eq!(paths.output_file, PathBuf::from("/run/web/web.out"));
		assert_eq!(paths.error_file, PathBuf::from("/run/web/web.err"));
		assert_eq!(paths.pid_file, PathBuf::from("/run/web/web.pid"));
	}

	#[test]
	fn status_record_of_unspawned_process() {
		let record = Process::new("sleeper", spec()).status_record();
		assert_eq!(record.name, "sleeper");
		assert_eq!(record.args, vec!["30".to_string()]);
		assert_eq!(record.env, None);
		assert_eq!(record.pid, None);
		assert_eq!(record.status, ProcessStatus::Error);
		assert!(record.daemon);
		assert_eq!(record.start_at.len(), 19);
	}
}
