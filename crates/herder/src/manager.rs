use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock};

use crate::config::{ConfigFile, ConfigStore, ProcRecord, DEFAULT_WORKER_DIR};
use crate::error::{Error, Result};
use crate::logs::RotationPolicy;
use crate::output::{self, Echo, RotatingFile};
use crate::process::{CommandSpec, Process, ProcessPaths};
use crate::types::Env;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
	/// Root that every process `dir` is resolved against.
	pub worker_dir: PathBuf,
	/// Where the registry is persisted; `None` disables persistence.
	pub config_file: Option<PathBuf>,
	/// Duplicate child output to this process's stdout/stderr.
	pub echo: bool,
	pub restart_delay: Duration,
	pub rotation: RotationPolicy,
}

impl ManagerConfig {
	pub fn new(worker_dir: impl Into<PathBuf>) -> Self {
		Self {
			worker_dir: worker_dir.into(),
			..Self::default()
		}
	}
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			worker_dir: PathBuf::from(DEFAULT_WORKER_DIR),
			config_file: None,
			echo: false,
			restart_delay: DEFAULT_RESTART_DELAY,
			rotation: RotationPolicy::default(),
		}
	}
}

struct ExitEvent {
	process: Arc<Process>,
	generation: u64,
	code: Option<i32>,
}

struct Inbox {
	exits: mpsc::UnboundedReceiver<ExitEvent>,
	stops: mpsc::UnboundedReceiver<Arc<Process>>,
	shutdown: watch::Receiver<bool>,
}

/// Registry of supervised processes plus the control loop that decides
/// whether an exited process comes back.
pub struct Manager {
	processes: RwLock<HashMap<String, Arc<Process>>>,
	config: ManagerConfig,
	store: ConfigStore,
	/// Serialises snapshot-and-write so the file always reflects the
	/// latest registry.
	persist_lock: AsyncMutex<()>,
	exit_tx: mpsc::UnboundedSender<ExitEvent>,
	stop_tx: mpsc::UnboundedSender<Arc<Process>>,
	shutdown_tx: watch::Sender<bool>,
	inbox: Mutex<Option<Inbox>>,
}

impl Manager {
	pub fn new(config: ManagerConfig) -> Arc<Self> {
		let (exit_tx, exits) = mpsc::unbounded_channel();
		let (stop_tx, stops) = mpsc::unbounded_channel();
		let (shutdown_tx, shutdown) = watch::channel(false);
		let store = ConfigStore::new(config.config_file.clone());

		Arc::new(Self {
			processes: RwLock::new(HashMap::new()),
			config,
			store,
			persist_lock: AsyncMutex::new(()),
			exit_tx,
			stop_tx,
			shutdown_tx,
			inbox: Mutex::new(Some(Inbox {
				exits,
				stops,
				shutdown,
			})),
		})
	}

	pub fn config(&self) -> &ManagerConfig {
		&self.config
	}

	/// Launch `name` and register it, replacing any entry with the same name.
	///
	/// `binary` falls back to `name` when empty; `dir` is relative to the
	/// worker root and created if missing.
	pub async fn start_process(
		&self,
		name: &str,
		binary: &str,
		args: Vec<String>,
		env: Env,
		dir: &str,
	) -> Result<Arc<Process>> {
		let process = self.create(name, binary, args, env, dir).await?;
		self.spawn(&process)?;
		self.register(Arc::clone(&process)).await;
		self.persist().await;
		Ok(process)
	}

	/// Kill the child if it is still alive and launch a fresh one from the
	/// same command spec.
	pub async fn restart_process(&self, name: &str) -> Result<()> {
		let process = self.get(name).await.ok_or_else(|| Error::NotFound(name.to_string()))?;
		tracing::info!("restart process {}", name);
		self.respawn(&process)
	}

	/// Disable auto-restart and ask the child to exit. Returns without waiting
	/// for the exit; stopping a stopped process is a no-op.
	pub async fn stop_process(&self, name: &str) -> Result<()> {
		let process = self.get(name).await.ok_or_else(|| Error::NotFound(name.to_string()))?;

		// Cleared before signalling so a racing exit event can't restart it.
		process.disable_daemon();
		let _ = self.stop_tx.send(Arc::clone(&process));

		if process.status().is_alive() {
			process.interrupt()?;
		}
		Ok(())
	}

	/// Stop `name` and forget it. Signal failures are ignored here.
	pub async fn remove_process(&self, name: &str) -> Result<()> {
		let process = {
			let mut processes = self.processes.write().await;
			let process = processes.get(name).cloned().ok_or_else(|| Error::NotFound(name.to_string()))?;
			process.disable_daemon();
			processes.remove(name);
			process
		};
		let _ = self.stop_tx.send(Arc::clone(&process));

		if let Err(e) = process.interrupt() {
			tracing::debug!("remove {}: {}", name, e);
		}
		tracing::info!("removed process {}", name);
		self.persist().await;
		Ok(())
	}

	/// Snapshot of the registry, in no particular order.
	pub async fn all_status(&self) -> Vec<Arc<Process>> {
		self.processes.read().await.values().cloned().collect()
	}

	pub async fn get(&self, name: &str) -> Option<Arc<Process>> {
		self.processes.read().await.get(name).cloned()
	}

	/// Start every process listed in the config file at `path`. Entries that
	/// fail to start are logged and skipped; the first failure is returned
	/// after the rest have been tried.
	pub async fn load_processes(&self, path: &Path) -> Result<()> {
		let config = ConfigFile::read(path)?;
		tracing::info!("loading {} processes from {}", config.procs.len(), path.display());

		let mut first_err = None;
		for record in config.procs {
			let env = Env::from_wire(record.env);
			let started = match self.create(&record.name, &record.binary, record.args, env, &record.dir).await {
				Ok(process) => self.spawn(&process).map(|_| process),
				Err(e) => Err(e),
			};
			match started {
				Ok(process) => self.register(process).await,
				Err(e) => {
					tracing::error!("failed to start {} from {}: {}", record.name, path.display(), e);
					first_err.get_or_insert(e);
				}
			}
		}

		self.persist().await;
		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Write the current registry to the config file, if one is configured.
	pub async fn save_config(&self) -> Result<()> {
		let _guard = self.persist_lock.lock().await;
		let mut procs: Vec<ProcRecord> = self
			.all_status()
			.await
			.iter()
			.map(|p| {
				let spec = p.spec();
				ProcRecord {
					name: p.name().to_string(),
					binary: spec.binary.to_string_lossy().to_string(),
					args: spec.args.clone(),
					env: spec.env.to_wire(),
					dir: spec.dir.clone(),
				}
			})
			.collect();
		procs.sort_by(|a, b| a.name.cmp(&b.name));

		self.store.save(&ConfigFile {
			worker_dir: Some(self.config.worker_dir.clone()),
			config_file: self.store.path().map(|p| p.display().to_string()),
			procs,
		})
	}

	/// Taking over a process this manager did not spawn is not supported.
	pub async fn attach_process(&self, pid: u32) -> Result<Arc<Process>> {
		tracing::warn!("attach to pid {} rejected", pid);
		Err(Error::Unimplemented("attach to a running process"))
	}

	/// Consume exit and stop events until [`Manager::shutdown`] is called.
	/// Children keep running after the loop returns.
	pub async fn run(self: &Arc<Self>) -> Result<()> {
		let Inbox {
			mut exits,
			mut stops,
			mut shutdown,
		} = self
			.inbox
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.take()
			.ok_or(Error::AlreadyRunning)?;

		if *shutdown.borrow_and_update() {
			return Ok(());
		}

		loop {
			tokio::select! {
				Some(event) = exits.recv() => self.on_exit(event).await,
				Some(process) = stops.recv() => {
					tracing::info!("stop process {}", process.name());
				}
				_ = shutdown.changed() => {
					tracing::info!("supervision stopped");
					return Ok(());
				}
				else => return Ok(()),
			}
		}
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	async fn on_exit(self: &Arc<Self>, event: ExitEvent) {
		let ExitEvent {
			process,
			generation,
			code,
		} = event;
		tracing::info!("exit process {} (code {:?})", process.name(), code);

		if !self.is_current(&process, generation).await {
			tracing::debug!("ignoring exit of replaced child of {}", process.name());
			return;
		}
		if !process.daemon_enabled() {
			return;
		}

		let manager = Arc::clone(self);
		let delay = self.config.restart_delay;
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if !process.daemon_enabled() || !manager.is_current(&process, generation).await {
				tracing::info!("restart of {} cancelled", process.name());
				return;
			}
			tracing::info!("restarting {} after {:?}", process.name(), delay);
			manager.restart_after_exit(&process);
		});
	}

	/// Respawn a crashed process. A stop can land between the caller's flag
	/// check and the spawn, so the flag is checked again once the new child
	/// is live and the child is interrupted if it was cleared.
	fn restart_after_exit(&self, process: &Arc<Process>) {
		if let Err(e) = self.respawn(process) {
			tracing::error!("restart of {} failed: {}", process.name(), e);
			return;
		}
		if !process.daemon_enabled() {
			tracing::info!("{} was stopped while restarting", process.name());
			if let Err(e) = process.interrupt() {
				tracing::warn!("interrupt {}: {}", process.name(), e);
			}
		}
	}

	/// True while `process` is the registered entry for its name and no newer
	/// child has been spawned since `generation`.
	async fn is_current(&self, process: &Arc<Process>, generation: u64) -> bool {
		if process.generation() != generation {
			return false;
		}
		self.processes
			.read()
			.await
			.get(process.name())
			.is_some_and(|registered| Arc::ptr_eq(registered, process))
	}

	async fn create(&self, name: &str, binary: &str, args: Vec<String>, env: Env, dir: &str) -> Result<Arc<Process>> {
		let binary = if binary.is_empty() { name } else { binary };
		let work_dir = self.config.worker_dir.join(dir);
		tracing::debug!("work dir for {}: {}", name, work_dir.display());

		tokio::fs::create_dir_all(&work_dir)
			.await
			.map_err(|e| Error::io(format!("create {}", work_dir.display()), e))?;

		Ok(Arc::new(Process::new(
			name,
			CommandSpec {
				binary: PathBuf::from(binary),
				args,
				env,
				dir: dir.to_string(),
				work_dir,
			},
		)))
	}

	async fn register(&self, process: Arc<Process>) {
		let replaced = self
			.processes
			.write()
			.await
			.insert(process.name().to_string(), process);
		if let Some(old) = replaced {
			// The old entry is no longer reachable by name; keep it from
			// coming back on its own.
			old.disable_daemon();
			tracing::warn!("process {} replaced an existing entry", old.name());
		}
	}

	fn respawn(&self, process: &Arc<Process>) -> Result<()> {
		if process.status().is_alive() {
			process.terminate();
		}
		self.spawn(process)
	}

	/// Start the child for `process` and wire up its relays and exit watcher.
	/// Returns as soon as everything is running.
	fn spawn(&self, process: &Arc<Process>) -> Result<()> {
		let spec = process.spec();
		let paths = ProcessPaths::new(&spec.work_dir, process.name());
		let open_sink = |path: &Path| {
			RotatingFile::open(path, self.config.rotation.clone())
				.map_err(|e| Error::io(format!("open {}", path.display()), e))
		};
		let out_sink = open_sink(&paths.output_file)?;
		let err_sink = open_sink(&paths.error_file)?;

		let mut child = spec
			.command()
			.spawn()
			.map_err(|e| Error::io(format!("spawn {}", spec.binary.display()), e))?;
		let pid = child.id().unwrap_or(0);
		let generation = process.mark_live(pid, paths.clone());
		tracing::info!("started {} (pid {}) in {}", process.name(), pid, spec.work_dir.display());

		let echo = self.config.echo;
		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(output::relay(stdout, out_sink, echo.then_some(Echo::Stdout), Arc::clone(process)));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(output::relay(stderr, err_sink, echo.then_some(Echo::Stderr), Arc::clone(process)));
		}

		let mut stdin = child.stdin.take();
		let exit_tx = self.exit_tx.clone();
		let watched = Arc::clone(process);
		tokio::spawn(async move {
			if let Some(input) = stdin.as_mut() {
				let _ = input.write_all(b"\n").await;
			}
			let code = match child.wait().await {
				Ok(status) => status.code(),
				Err(e) => {
					tracing::warn!("wait for {} failed: {}", watched.name(), e);
					None
				}
			};
			drop(stdin);
			watched.mark_exited(generation, code);
			let _ = exit_tx.send(ExitEvent {
				process: watched,
				generation,
				code,
			});
		});

		if let Err(e) = std::fs::write(&paths.pid_file, pid.to_string()) {
			// Without a pid file the child is unmanageable; don't let its
			// exit schedule another attempt.
			process.disable_daemon();
			process.terminate();
			return Err(Error::io(format!("write {}", paths.pid_file.display()), e));
		}
		Ok(())
	}

	async fn persist(&self) {
		if let Err(e) = self.save_config().await {
			tracing::warn!("failed to persist config: {}", e);
		}
	}
}
