mod client;
mod daemon;
mod paths;
mod protocol;
mod server;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use client::{ClientError, DaemonClient};
use herder::{split_command, ProcessStatus, StatusRecord};
use owo_colors::OwoColorize;
use paths::DaemonPaths;
use protocol::{Request, Response};

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();

	if args.is_empty() {
		print_usage();
		return;
	}

	match args[0].as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("herder {}", env!("CARGO_PKG_VERSION")),
		"status" | "st" | "ls" => cmd_status(),
		"start" => cmd_start(&args[1..]),
		"stop" => cmd_named(&args[1..], "stop", |name| Request::Stop { name }),
		"remove" | "rm" => cmd_named(&args[1..], "remove", |name| Request::Remove { name }),
		"restart" => cmd_named(&args[1..], "restart", |name| Request::Restart { name }),
		"load" => cmd_load(&args[1..]),
		"attach" => cmd_attach(&args[1..]),
		"daemon" => cmd_daemon(&args[1..]),
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'herder help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {} - keep programs running", "herder".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} <command> [args]", "herder".bold());
	eprintln!();

	eprintln!("{}", "processes".cyan().bold());
	eprintln!("  {} <command...> [--name N] [--dir D] [--env K=V]... [--no-env]", "start".bold());
	eprintln!("  {} <name>                 Stop and disable auto-restart", "stop".bold());
	eprintln!("  {} <name>              Kill and respawn", "restart".bold());
	eprintln!("  {} <name>               Stop and forget", "remove".bold());
	eprintln!("  {}                      Show all processes", "status".bold());
	eprintln!("  {} <file>                 Start every process in a config file", "load".bold());
	eprintln!();

	eprintln!("{}", "daemon".cyan().bold());
	eprintln!("  {} [run|start|stop|status] [flags]", "daemon".bold());
	eprintln!("    --config <file>       process list to load and persist (default process.yaml)");
	eprintln!("    --worker-dir <dir>    root for process directories (default ./run)");
	eprintln!("    --echo                copy child output to the daemon's own stdout/stderr");
	eprintln!("    --http <port>         serve the JSON API on 127.0.0.1:<port>");
	eprintln!();

	eprintln!("{}", "examples".cyan().bold());
	eprintln!("    herder start \"python3 -m http.server 8000\" --name web");
	eprintln!("    herder start sleep 60 --dir naps --env MODE=test");
}

fn daemon_paths() -> DaemonPaths {
	DaemonPaths::default()
}

fn connect_daemon() -> Option<DaemonClient> {
	DaemonClient::connect(&daemon_paths().socket_path()).ok()
}

fn spawn_daemon(extra_args: &[String]) -> std::io::Result<()> {
	let daemon_bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("herder"));
	Command::new(&daemon_bin)
		.args(["daemon", "run"])
		.args(extra_args)
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.spawn()
		.map(|_| ())
}

fn ensure_daemon() -> DaemonClient {
	if let Some(client) = connect_daemon() {
		return client;
	}

	eprintln!("starting daemon...");
	if let Err(e) = spawn_daemon(&[]) {
		eprintln!("error: failed to start daemon: {}", e);
		std::process::exit(1);
	}

	for _ in 0..50 {
		std::thread::sleep(std::time::Duration::from_millis(100));
		if let Some(client) = connect_daemon() {
			return client;
		}
	}

	eprintln!("error: daemon did not start in time");
	std::process::exit(1);
}

fn send_request(request: &Request) -> Response {
	let mut client = ensure_daemon();
	match client.send(request) {
		Ok(resp) => resp,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

/// Print a daemon reply; errors exit non-zero.
fn report(response: Response) {
	match response {
		Response::Ok { message } => {
			if let Some(msg) = message {
				eprintln!("{}", msg);
			}
		}
		Response::Process { process } => print_table(&[process]),
		Response::Status { processes } => {
			let records: Vec<StatusRecord> = processes.into_values().collect();
			print_table(&records);
		}
		Response::Pong => eprintln!("pong"),
		Response::Error { kind, message } => {
			eprintln!("{} {}", "error:".red().bold(), message);
			hint_for(kind);
			std::process::exit(1);
		}
	}
}

fn hint_for(kind: herder::ErrorKind) {
	if kind == herder::ErrorKind::NotFound {
		eprintln!("run 'herder status' to list processes");
	}
}

fn cmd_status() {
	report(send_request(&Request::Status));
}

fn print_table(records: &[StatusRecord]) {
	if records.is_empty() {
		eprintln!("no processes");
		return;
	}

	let width = records.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
	println!(
		"  {:<width$} {:<8} {:<6} {:<7} {:<19} {}",
		"NAME".dimmed(),
		"PID".dimmed(),
		"STATE".dimmed(),
		"DAEMON".dimmed(),
		"STARTED".dimmed(),
		"COMMAND".dimmed(),
		width = width
	);
	for r in records {
		print_process_line(r, width);
	}
}

fn print_process_line(record: &StatusRecord, width: usize) {
	let circle = match record.status {
		ProcessStatus::Running | ProcessStatus::Sleeping | ProcessStatus::Idle => "●".green().to_string(),
		ProcessStatus::Stopped | ProcessStatus::Waiting | ProcessStatus::Locked => "●".yellow().to_string(),
		ProcessStatus::Zombie | ProcessStatus::Error => "●".red().to_string(),
	};
	let pid = record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
	let daemon = if record.daemon { "on".green().to_string() } else { "off".dimmed().to_string() };
	let command = std::iter::once(record.binary.display().to_string())
		.chain(record.args.iter().cloned())
		.collect::<Vec<_>>()
		.join(" ");
	println!(
		"{} {:<width$} {:<8} {:<6} {:<7} {:<19} {}",
		circle,
		record.name,
		pid,
		record.status.code(),
		daemon,
		record.start_at,
		command.dimmed(),
		width = width
	);
}

#[derive(Debug, PartialEq)]
struct StartArgs {
	name: String,
	binary: String,
	args: Vec<String>,
	env: Option<Vec<String>>,
	dir: String,
}

fn parse_start(args: &[String]) -> Result<StartArgs, String> {
	let mut name = None;
	let mut dir = None;
	let mut env: Option<Vec<String>> = None;
	let mut words = Vec::new();

	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		let flag = arg.as_str();
		let mut value = || iter.next().cloned().ok_or_else(|| format!("{} needs a value", flag));
		match flag {
			"--name" | "-n" => name = Some(value()?),
			"--dir" | "-d" => dir = Some(value()?),
			"--env" | "-e" => env.get_or_insert_with(Vec::new).push(value()?),
			"--no-env" => {
				env.get_or_insert_with(Vec::new);
			}
			"--" => {
				words.extend(iter.by_ref().cloned());
				break;
			}
			_ => words.push(arg.clone()),
		}
	}

	// A single argument is a whole command line; several are already split.
	let mut command = if words.len() == 1 {
		split_command(&words[0])
	} else {
		words
	};
	if command.is_empty() {
		return Err("start needs a command".to_string());
	}
	let binary = command.remove(0);

	let name = name.unwrap_or_else(|| {
		Path::new(&binary)
			.file_name()
			.map(|n| n.to_string_lossy().to_string())
			.unwrap_or_else(|| binary.clone())
	});
	let dir = dir.unwrap_or_else(|| name.clone());

	Ok(StartArgs {
		name,
		binary,
		args: command,
		env,
		dir,
	})
}

fn cmd_start(args: &[String]) {
	let start = match parse_start(args) {
		Ok(s) => s,
		Err(e) => {
			eprintln!("error: {}", e);
			eprintln!("usage: herder start <command...> [--name N] [--dir D] [--env K=V]...");
			std::process::exit(1);
		}
	};
	report(send_request(&Request::Start {
		name: start.name,
		binary: start.binary,
		args: start.args,
		env: start.env,
		dir: start.dir,
	}));
}

fn cmd_named(args: &[String], verb: &str, request: impl Fn(String) -> Request) {
	match args.first() {
		Some(name) => report(send_request(&request(name.clone()))),
		None => {
			eprintln!("usage: herder {} <name>", verb);
			std::process::exit(1);
		}
	}
}

fn cmd_load(args: &[String]) {
	let file = match args.first() {
		Some(f) => PathBuf::from(f),
		None => {
			eprintln!("usage: herder load <file>");
			std::process::exit(1);
		}
	};
	// The daemon may run from a different directory.
	let path = std::path::absolute(&file).unwrap_or(file);
	report(send_request(&Request::Load { path }));
}

fn cmd_attach(args: &[String]) {
	let pid = match args.first().and_then(|p| p.parse().ok()) {
		Some(pid) => pid,
		None => {
			eprintln!("usage: herder attach <pid>");
			std::process::exit(1);
		}
	};
	report(send_request(&Request::Attach { pid }));
}

fn cmd_daemon(args: &[String]) {
	let subcmd = args.first().map(|s| s.as_str()).unwrap_or("status");
	let paths = daemon_paths();

	match subcmd {
		"run" => {
			let runtime = match tokio::runtime::Runtime::new() {
				Ok(rt) => rt,
				Err(e) => {
					eprintln!("error: failed to start runtime: {}", e);
					std::process::exit(1);
				}
			};
			runtime.block_on(daemon::run(&args[1..]));
		}
		"start" => {
			if client::is_running(&paths) {
				eprintln!("daemon already running");
				return;
			}
			if let Err(e) = daemon::DaemonOptions::parse(&args[1..]) {
				eprintln!("error: {}", e);
				std::process::exit(1);
			}
			match spawn_daemon(&args[1..]) {
				Ok(()) => eprintln!("daemon started"),
				Err(e) => {
					eprintln!("error: {}", e);
					std::process::exit(1);
				}
			}
		}
		"stop" => match connect_daemon().map(|mut c| c.send(&Request::Shutdown)) {
			Some(Ok(Response::Ok { message })) => eprintln!("daemon: {}", message.unwrap_or_default()),
			Some(Ok(other)) => eprintln!("unexpected reply: {:?}", other),
			Some(Err(e)) => eprintln!("error: {}", e),
			None => stop_by_pid(&paths),
		},
		"status" => {
			if client::is_running(&paths) {
				let pid = client::read_pid(&paths).map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
				eprintln!("daemon running (pid {})", pid);
			} else {
				eprintln!("daemon not running");
			}
		}
		_ => {
			eprintln!("usage: herder daemon [run|start|stop|status]");
		}
	}
}

/// Socket gone but a pid file left behind: ask that process to terminate.
fn stop_by_pid(paths: &DaemonPaths) {
	let pid = match client::read_pid(paths) {
		Some(pid) => pid,
		None => {
			eprintln!("{}", ClientError::NotRunning);
			return;
		}
	};
	match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM) {
		Ok(()) => eprintln!("daemon: sent SIGTERM to pid {}", pid),
		Err(e) => {
			eprintln!("daemon not running (stale pid {}: {})", pid, e);
			let _ = std::fs::remove_file(paths.pid_path());
		}
	}
}
