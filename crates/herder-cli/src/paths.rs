use std::path::PathBuf;

/// Where the daemon keeps its control socket and pid file.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
	pub app_name: String,
}

impl DaemonPaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
		}
	}

	/// Variable that pins the state dir outright, e.g. `HERDER_STATE_DIR`.
	pub fn override_var(&self) -> String {
		format!("{}_STATE_DIR", self.app_name.to_uppercase().replace('-', "_"))
	}

	pub fn state_dir(&self) -> PathBuf {
		self.resolve_state_dir(|key| std::env::var(key).ok())
	}

	/// `$<APP>_STATE_DIR`, then `$XDG_STATE_HOME/<app>`, then
	/// `~/.local/state/<app>`, then `/tmp/<app>`. Empty values are skipped.
	fn resolve_state_dir(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
		let env = |key: &str| env(key).filter(|v| !v.is_empty());
		if let Some(dir) = env(&self.override_var()) {
			PathBuf::from(dir)
		} else if let Some(dir) = env("XDG_STATE_HOME") {
			PathBuf::from(dir).join(&self.app_name)
		} else if let Some(home) = env("HOME") {
			PathBuf::from(home).join(".local").join("state").join(&self.app_name)
		} else {
			PathBuf::from("/tmp").join(&self.app_name)
		}
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state_dir().join("daemon.sock")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir().join("daemon.pid")
	}
}

impl Default for DaemonPaths {
	fn default() -> Self {
		Self::new("herder")
	}
}
