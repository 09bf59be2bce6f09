//! # herder
//!
//! Keep named programs running.
//!
//! A [`Manager`] spawns each process in its own working directory, captures
//! stdout and stderr into rotating files, and restarts a process after a delay
//! when it exits, unless it was stopped on purpose.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use herder::{split_command, Env, Manager, ManagerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> herder::Result<()> {
//! let manager = Manager::new(ManagerConfig::new("/tmp/herder/run"));
//! let runner = manager.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! let mut words = split_command("python3 -m http.server 8000");
//! let binary = words.remove(0);
//! manager.start_process("web", &binary, words, Env::Inherit, "web").await?;
//!
//! for p in manager.all_status().await {
//!     println!("{} {:?}", p.name(), p.status());
//! }
//! manager.stop_process("web").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logs;
pub mod manager;
pub mod output;
pub mod process;
pub mod split;
pub mod types;

pub use config::{ConfigFile, ConfigStore, ProcRecord, DEFAULT_CONFIG_FILE, DEFAULT_WORKER_DIR};
pub use error::{Error, ErrorKind, Result};
pub use logs::RotationPolicy;
pub use manager::{Manager, ManagerConfig, DEFAULT_RESTART_DELAY};
pub use process::{CommandSpec, Handle, Process, ProcessPaths};
pub use split::split_command;
pub use types::{Env, ProcessStatus, StatusRecord};
