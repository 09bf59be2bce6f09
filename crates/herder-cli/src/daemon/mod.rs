pub mod api;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use herder::{ConfigStore, Env, Manager, ManagerConfig, DEFAULT_CONFIG_FILE, DEFAULT_WORKER_DIR};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

use crate::paths::DaemonPaths;
use crate::protocol::{Request, Response};
use crate::server;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonOptions {
	pub config: PathBuf,
	pub worker_dir: Option<PathBuf>,
	pub echo: bool,
	pub http_port: Option<u16>,
}

impl Default for DaemonOptions {
	fn default() -> Self {
		Self {
			config: PathBuf::from(DEFAULT_CONFIG_FILE),
			worker_dir: None,
			echo: false,
			http_port: None,
		}
	}
}

impl DaemonOptions {
	pub fn parse(args: &[String]) -> Result<Self, String> {
		let mut opts = Self::default();
		let mut iter = args.iter();
		while let Some(arg) = iter.next() {
			let flag = arg.as_str();
			let mut value = || iter.next().cloned().ok_or_else(|| format!("{} needs a value", flag));
			match flag {
				"--config" | "-c" => opts.config = PathBuf::from(value()?),
				"--worker-dir" | "-w" => opts.worker_dir = Some(PathBuf::from(value()?)),
				"--echo" => opts.echo = true,
				"--http" => {
					let port = value()?;
					opts.http_port = Some(port.parse().map_err(|_| format!("invalid port: {}", port))?);
				}
				other => return Err(format!("unknown daemon flag: {}", other)),
			}
		}
		Ok(opts)
	}
}

/// Shared by the socket server, the HTTP API and the signal handlers.
pub struct Daemon {
	pub manager: Arc<Manager>,
	shutdown: Notify,
}

impl Daemon {
	pub fn new(manager: Arc<Manager>) -> Arc<Self> {
		Arc::new(Self {
			manager,
			shutdown: Notify::new(),
		})
	}

	pub fn request_shutdown(&self) {
		self.shutdown.notify_one();
	}
}

pub async fn run(args: &[String]) {
	tracing_subscriber::fmt().init();

	let opts = match DaemonOptions::parse(args) {
		Ok(o) => o,
		Err(e) => {
			tracing::error!("{}", e);
			return;
		}
	};

	// The persisted file may name its own worker dir; the flag wins.
	let persisted = match ConfigStore::new(Some(opts.config.clone())).load() {
		Ok(c) => c,
		Err(e) => {
			tracing::error!("{}", e);
			return;
		}
	};
	let worker_dir = opts
		.worker_dir
		.clone()
		.or(persisted.worker_dir)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_DIR));

	let manager = Manager::new(ManagerConfig {
		worker_dir,
		config_file: Some(opts.config.clone()),
		echo: opts.echo,
		..ManagerConfig::default()
	});
	let daemon = Daemon::new(Arc::clone(&manager));

	let paths = DaemonPaths::default();
	let _ = std::fs::create_dir_all(paths.state_dir());
	let _ = std::fs::write(paths.pid_path(), std::process::id().to_string());

	let socket_path = paths.socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}

	let runner = Arc::clone(&manager);
	let control_loop = tokio::spawn(async move { runner.run().await });

	if opts.config.exists() {
		if let Err(e) = manager.load_processes(&opts.config).await {
			tracing::error!("autostart from {}: {}", opts.config.display(), e);
		}
	}

	let socket_daemon = Arc::clone(&daemon);
	let socket_handle = tokio::spawn(async move {
		let result = server::run_socket_server(
			&socket_path,
			move |req: Request| {
				let daemon = Arc::clone(&socket_daemon);
				async move { handle_request(&daemon, req).await }
			},
			|message| Response::Error {
				kind: herder::ErrorKind::Internal,
				message,
			},
		)
		.await;
		if let Err(e) = result {
			tracing::error!("control socket: {}", e);
		}
	});

	let http_handle = opts.http_port.map(|port| {
		let daemon = Arc::clone(&daemon);
		tokio::spawn(async move { run_http_server(daemon, port).await })
	});

	tracing::info!(
		"daemon started (pid {}), worker dir {}",
		std::process::id(),
		manager.config().worker_dir.display()
	);

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!("failed to install SIGTERM handler: {}", e);
			return;
		}
	};

	tokio::select! {
		_ = socket_handle => {},
		_ = async {
			if let Some(h) = http_handle { h.await.ok(); }
			else { std::future::pending::<()>().await; }
		} => {},
		_ = daemon.shutdown.notified() => tracing::info!("shutdown requested"),
		_ = sigterm.recv() => tracing::info!("terminated"),
		_ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
	}

	manager.shutdown();
	let _ = control_loop.await;

	let _ = std::fs::remove_file(paths.socket_path());
	let _ = std::fs::remove_file(paths.pid_path());
	tracing::info!("daemon stopped; supervised processes left running");
}

pub async fn handle_request(daemon: &Daemon, request: Request) -> Response {
	let manager = &daemon.manager;
	match request {
		Request::Ping => Response::Pong,
		Request::Status => Response::Status {
			processes: status_map(manager).await,
		},
		Request::Start {
			name,
			binary,
			args,
			env,
			dir,
		} => match manager.start_process(&name, &binary, args, Env::from_wire(env), &dir).await {
			Ok(process) => Response::Process {
				process: process.status_record(),
			},
			Err(e) => e.into(),
		},
		Request::Stop { name } => match manager.stop_process(&name).await {
			Ok(()) => Response::ok(format!("{}: stopping", name)),
			Err(e) => e.into(),
		},
		Request::Remove { name } => match manager.remove_process(&name).await {
			Ok(()) => Response::ok(format!("{}: removed", name)),
			Err(e) => e.into(),
		},
		Request::Restart { name } => match manager.restart_process(&name).await {
			Ok(()) => Response::ok(format!("{}: restarted", name)),
			Err(e) => e.into(),
		},
		Request::Load { path } => match manager.load_processes(&path).await {
			Ok(()) => Response::ok(format!("loaded {}", path.display())),
			Err(e) => e.into(),
		},
		Request::Attach { pid } => match manager.attach_process(pid).await {
			Ok(process) => Response::Process {
				process: process.status_record(),
			},
			Err(e) => e.into(),
		},
		Request::Shutdown => {
			daemon.request_shutdown();
			Response::ok("shutting down")
		}
	}
}

pub async fn status_map(manager: &Manager) -> BTreeMap<String, herder::StatusRecord> {
	manager
		.all_status()
		.await
		.iter()
		.map(|p| (p.name().to_string(), p.status_record()))
		.collect()
}

async fn run_http_server(daemon: Arc<Daemon>, port: u16) {
	let app = api::router(daemon);
	let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return;
		}
	};
	tracing::info!("HTTP listening on {}", addr);
	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!("HTTP server error: {}", e);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use herder::ErrorKind;

	fn args(list: &[&str]) -> Vec<String> {
		list.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn parse_defaults() {
		assert_eq!(DaemonOptions::parse(&[]).unwrap(), DaemonOptions::default());
		assert_eq!(DaemonOptions::default().config, PathBuf::from("process.yaml"));
	}

	#[test]
	fn parse_flags() {
		let opts = DaemonOptions::parse(&args(&["--config", "procs.toml", "--worker-dir", "/srv/run", "--echo", "--http", "7070"]))
			.unwrap();
		assert_eq!(opts.config, PathBuf::from("procs.toml"));
		assert_eq!(opts.worker_dir, Some(PathBuf::from("/srv/run")));
		assert!(opts.echo);
		assert_eq!(opts.http_port, Some(7070));
	}

	#[test]
	fn parse_rejects_bad_input() {
		assert!(DaemonOptions::parse(&args(&["--http"])).is_err());
		assert!(DaemonOptions::parse(&args(&["--http", "web"])).is_err());
		assert!(DaemonOptions::parse(&args(&["--verbose"])).is_err());
	}

	fn test_daemon() -> (Arc<Daemon>, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let manager = Manager::new(ManagerConfig::new(dir.path().join("run")));
		(Daemon::new(manager), dir)
	}

	#[tokio::test]
	async fn ping_status_and_errors() {
		let (daemon, _dir) = test_daemon();
		assert_eq!(handle_request(&daemon, Request::Ping).await, Response::Pong);
		assert_eq!(
			handle_request(&daemon, Request::Status).await,
			Response::Status {
				processes: BTreeMap::new()
			}
		);

		let resp = handle_request(&daemon, Request::Stop { name: "ghost".into() }).await;
		assert!(matches!(resp, Response::Error { kind: ErrorKind::NotFound, .. }));

		let resp = handle_request(&daemon, Request::Attach { pid: 1 }).await;
		assert!(matches!(resp, Response::Error { kind: ErrorKind::Unimplemented, .. }));
	}

	#[tokio::test]
	async fn start_then_remove() {
		let (daemon, _dir) = test_daemon();
		let resp = handle_request(
			&daemon,
			Request::Start {
				name: "sleeper".into(),
				binary: "sleep".into(),
				args: vec!["30".into()],
				env: None,
				dir: "sleeper".into(),
			},
		)
		.await;
		let record = match resp {
			Response::Process { process } => process,
			other => panic!("unexpected response: {:?}", other),
		};
		assert_eq!(record.name, "sleeper");
		assert!(record.pid.is_some());
		assert!(record.daemon);

		match handle_request(&daemon, Request::Status).await {
			Response::Status { processes } => assert!(processes.contains_key("sleeper")),
			other => panic!("unexpected response: {:?}", other),
		}

		let resp = handle_request(&daemon, Request::Remove { name: "sleeper".into() }).await;
		assert!(matches!(resp, Response::Ok { .. }));
		assert!(daemon.manager.get("sleeper").await.is_none());
	}

	#[tokio::test]
	async fn shutdown_request_notifies() {
		let (daemon, _dir) = test_daemon();
		let resp = handle_request(&daemon, Request::Shutdown).await;
		assert!(matches!(resp, Response::Ok { .. }));
		tokio::time::timeout(std::time::Duration::from_secs(1), daemon.shutdown.notified())
			.await
			.unwrap();
	}
}
