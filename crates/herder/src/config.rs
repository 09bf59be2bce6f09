use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "process.yaml";
pub const DEFAULT_WORKER_DIR: &str = "./run";

static SAVE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk list of processes to auto-start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ConfigFile {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub worker_dir: Option<PathBuf>,
	/// Informational; where the file was last written to.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub config_file: Option<String>,
	#[serde(default)]
	pub procs: Vec<ProcRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ProcRecord {
	pub name: String,
	#[serde(default)]
	pub binary: String,
	#[serde(default)]
	pub args: Vec<String>,
	/// Absent means inherit the supervisor's environment.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub env: Option<Vec<String>>,
	#[serde(default)]
	pub dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
	Yaml,
	Toml,
}

impl Format {
	fn for_path(path: &Path) -> Self {
		match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => Format::Toml,
			_ => Format::Yaml,
		}
	}
}

impl ConfigFile {
	/// Read and validate a config file. A missing file is an error here; see
	/// [`ConfigStore::load`] for the lenient variant.
	pub fn read(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.map_err(|e| Error::io(format!("read config {}", path.display()), e))?;
		Self::parse(path, &content)
	}

	fn parse(path: &Path, content: &str) -> Result<Self> {
		let invalid = |message: String| Error::InvalidConfig {
			path: path.to_path_buf(),
			message,
		};
		let config: ConfigFile = if content.trim().is_empty() {
			ConfigFile::default()
		} else {
			match Format::for_path(path) {
				Format::Yaml => serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?,
				Format::Toml => toml::from_str(content).map_err(|e| invalid(e.to_string()))?,
			}
		};
		config.validate().map_err(invalid)?;
		Ok(config)
	}

	fn validate(&self) -> std::result::Result<(), String> {
		let mut seen = HashSet::new();
		for (i, proc) in self.procs.iter().enumerate() {
			if proc.name.trim().is_empty() {
				return Err(format!("Procs[{}] has an empty Name", i));
			}
			if !seen.insert(proc.name.as_str()) {
				return Err(format!("duplicate process name '{}'", proc.name));
			}
		}
		Ok(())
	}

	fn render(&self, path: &Path) -> Result<String> {
		let invalid = |message: String| Error::InvalidConfig {
			path: path.to_path_buf(),
			message,
		};
		match Format::for_path(path) {
			Format::Yaml => serde_yaml::to_string(self).map_err(|e| invalid(e.to_string())),
			Format::Toml => toml::to_string_pretty(self).map_err(|e| invalid(e.to_string())),
		}
	}
}

/// Where the registry is persisted. Without a path every operation is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
	path: Option<PathBuf>,
}

impl ConfigStore {
	pub fn new(path: Option<PathBuf>) -> Self {
		Self {
			path: path.filter(|p| !p.as_os_str().is_empty()),
		}
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	/// Load the persisted config; missing file or disabled store gives an
	/// empty default.
	pub fn load(&self) -> Result<ConfigFile> {
		match &self.path {
			Some(path) if path.exists() => ConfigFile::read(path),
			_ => Ok(ConfigFile::default()),
		}
	}

	/// Write `config` atomically: temp file in the same directory, then rename.
	pub fn save(&self, config: &ConfigFile) -> Result<()> {
		let path = match &self.path {
			Some(p) => p,
			None => return Ok(()),
		};
		let content = config.render(path)?;

		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent)
				.map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
		}

		let tmp = tmp_path(path);
		fs::write(&tmp, content).map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
		if let Err(e) = fs::rename(&tmp, path) {
			let _ = fs::remove_file(&tmp);
			return Err(Error::io(format!("rename to {}", path.display()), e));
		}
		Ok(())
	}
}

/// Sibling of `path` no other writer uses: `<path>.<pid>.<n>.tmp`.
fn tmp_path(path: &Path) -> PathBuf {
	let n = SAVE_COUNTER.fetch_add(1, Ordering::Relaxed);
	let mut name = path.as_os_str().to_owned();
	name.push(format!(".{}.{}.tmp", std::process::id(), n));
	PathBuf::from(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	const YAML: &str = r#"
WorkerDir: ./run
ConfigFile: process.yaml
Procs:
  - Name: web
    Binary: /usr/bin/python3
    Args: ["-m", "http.server"]
    Dir: web
  - Name: worker
    Args: []
    Env: ["MODE=batch"]
    Dir: jobs
"#;

	#[test]
	fn parses_yaml_schema() {
		let config = ConfigFile::parse(Path::new("process.yaml"), YAML).unwrap();
		assert_eq!(config.worker_dir, Some(PathBuf::from("./run")));
		assert_eq!(config.procs.len(), 2);
		assert_eq!(config.procs[0].binary, "/usr/bin/python3");
		assert_eq!(config.procs[0].env, None);
		assert_eq!(config.procs[1].binary, "");
		assert_eq!(config.procs[1].env, Some(vec!["MODE=batch".to_string()]));
	}

	#[test]
	fn rejects_unknown_keys() {
		let err = ConfigFile::parse(Path::new("p.yaml"), "Procs:\n  - Name: web\n    Bin: x\n").unwrap_err();
		assert!(matches!(err, Error::InvalidConfig { .. }), "{}", err);
	}

	#[test]
	fn rejects_duplicate_and_empty_names() {
		let dup = "Procs:\n  - Name: web\n  - Name: web\n";
		let err = ConfigFile::parse(Path::new("p.yaml"), dup).unwrap_err();
		assert!(err.to_string().contains("duplicate process name 'web'"));

		let empty = "Procs:\n  - Name: ''\n";
		assert!(ConfigFile::parse(Path::new("p.yaml"), empty).is_err());
	}

	#[test]
	fn empty_file_is_default() {
		let config = ConfigFile::parse(Path::new("p.yaml"), "  \n").unwrap();
		assert_eq!(config, ConfigFile::default());
	}

	#[test]
	fn disabled_store_is_noop() {
		let store = ConfigStore::new(Some(PathBuf::new()));
		assert!(store.path().is_none());
		assert!(store.save(&ConfigFile::default()).is_ok());
		assert_eq!(store.load().unwrap(), ConfigFile::default());
	}

	#[test]
	fn missing_file_loads_default() {
		let dir = tempfile::tempdir().unwrap();
		let store = ConfigStore::new(Some(dir.path().join("absent.yaml")));
		assert_eq!(store.load().unwrap(), ConfigFile::default());
		assert!(ConfigFile::read(&dir.path().join("absent.yaml")).is_err());
	}

	fn sample() -> ConfigFile {
		ConfigFile {
			worker_dir: Some("/srv/run".into()),
			config_file: Some("procs".into()),
			procs: vec![
				ProcRecord {
					name: "web".into(),
					binary: "python3".into(),
					args: vec!["-m".into(), "http.server".into()],
					env: None,
					dir: "web".into(),
				},
				ProcRecord {
					name: "bare".into(),
					binary: String::new(),
					args: vec![],
					env: Some(vec![]),
					dir: "bare".into(),
				},
			],
		}
	}

	#[test]
	fn save_and_load_yaml() {
		let dir = tempfile::tempdir().unwrap();
		let store = ConfigStore::new(Some(dir.path().join("nested").join("procs.yaml")));
		store.save(&sample()).unwrap();
		assert_eq!(store.load().unwrap(), sample());
	}

	#[test]
	fn tmp_names_are_unique_and_cleaned_up() {
		let path = Path::new("/srv/procs.yaml");
		let a = tmp_path(path);
		let b = tmp_path(path);
		assert_ne!(a, b);
		assert_eq!(a.parent(), path.parent());

		let dir = tempfile::tempdir().unwrap();
		let store = ConfigStore::new(Some(dir.path().join("procs.yaml")));
		let threads: Vec<_> = (0..8)
			.map(|_| {
				let store = store.clone();
				std::thread::spawn(move || store.save(&sample()))
			})
			.collect();
		for t in threads {
			t.join().unwrap().unwrap();
		}
		let names: Vec<_> = fs::read_dir(dir.path())
			.unwrap()
			.flatten()
			.map(|e| e.file_name().to_string_lossy().to_string())
			.collect();
		assert_eq!(names, vec!["procs.yaml".to_string()]);
		assert_eq!(store.load().unwrap(), sample());
	}

	#[test]
	fn save_and_load_toml() {
		let dir = tempfile::tempdir().unwrap();
		let store = ConfigStore::new(Some(dir.path().join("procs.toml")));
		store.save(&sample()).unwrap();
		let text = fs::read_to_string(dir.path().join("procs.toml")).unwrap();
		assert!(text.contains("[[Procs]]"), "{}", text);
		assert_eq!(store.load().unwrap(), sample());
	}
}
