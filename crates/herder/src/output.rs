use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::logs::{self, RotationPolicy};
use crate::process::Process;

/// Append-only log file that rolls over by size. Backups are compressed and
/// pruned on a background thread so the relay never waits on gzip.
pub struct RotatingFile {
	path: PathBuf,
	file: Option<File>,
	bytes_written: u64,
	policy: RotationPolicy,
}

impl RotatingFile {
	pub fn open(path: &Path, policy: RotationPolicy) -> io::Result<Self> {
		let file = open_append(path)?;
		let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
		Ok(Self {
			path: path.to_path_buf(),
			file: Some(file),
			bytes_written,
			policy,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn rotate(&mut self) -> io::Result<()> {
		if let Some(file) = self.file.take() {
			drop(file);
		}

		let backup = logs::backup_name(&self.path, Local::now());
		fs::rename(&self.path, &backup)?;
		self.file = Some(open_append(&self.path)?);
		self.bytes_written = 0;

		let path = self.path.clone();
		let policy = self.policy.clone();
		std::thread::spawn(move || logs::finish_rotation(&path, &backup, &policy));
		Ok(())
	}
}

impl Write for RotatingFile {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.bytes_written > 0 && self.bytes_written + buf.len() as u64 > self.policy.max_size {
			self.rotate()?;
		}
		let file = match self.file.as_mut() {
			Some(f) => f,
			None => {
				self.file = Some(open_append(&self.path)?);
				self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))?
			}
		};
		let n = file.write(buf)?;
		self.bytes_written += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.file.as_mut() {
			Some(f) => f.flush(),
			None => Ok(()),
		}
	}
}

fn open_append(path: &Path) -> io::Result<File> {
	OpenOptions::new().create(true).append(true).open(path)
}

/// Operator console stream a relay duplicates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
	Stdout,
	Stderr,
}

/// Copy one child stream into its log sink until the stream closes. Errors end
/// this relay only; supervision of the process carries on.
pub(crate) async fn relay<R>(mut reader: R, mut sink: RotatingFile, echo: Option<Echo>, process: Arc<Process>)
where
	R: AsyncRead + Unpin,
{
	let mut buf = [0u8; 4096];
	loop {
		let n = match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => n,
			Err(e) => {
				fail(&process, &sink, "read", e);
				break;
			}
		};

		if let Err(e) = sink.write_all(&buf[..n]) {
			fail(&process, &sink, "write", e);
			break;
		}

		let echoed = match echo {
			Some(Echo::Stdout) => tokio::io::stdout().write_all(&buf[..n]).await,
			Some(Echo::Stderr) => tokio::io::stderr().write_all(&buf[..n]).await,
			None => Ok(()),
		};
		if let Err(e) = echoed {
			tracing::debug!("echo for {} failed: {}", process.name(), e);
		}
	}
	let _ = sink.flush();
}

fn fail(process: &Process, sink: &RotatingFile, op: &str, e: io::Error) {
	let message = format!("{} {}: {}", op, sink.path().display(), e);
	tracing::warn!("output relay for {} stopped: {}", process.name(), message);
	process.record_relay_error(message);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::process::CommandSpec;
	use crate::types::Env;

	fn small_policy(compress: bool) -> RotationPolicy {
		RotationPolicy {
			max_size: 16,
			max_backups: 10,
			max_age: std::time::Duration::ZERO,
			compress,
		}
	}

	fn backups(dir: &Path, current: &Path) -> Vec<PathBuf> {
		fs::read_dir(dir)
			.unwrap()
			.flatten()
			.map(|e| e.path())
			.filter(|p| p != current)
			.collect()
	}

	#[test]
	fn appends_to_existing_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("web.out");
		fs::write(&path, b"before\n").unwrap();

		let mut sink = RotatingFile::open(&path, RotationPolicy::default()).unwrap();
		sink.write_all(b"after\n").unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "before\nafter\n");
	}

	#[test]
	fn rotates_when_size_exceeded() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("web.out");

		let mut sink = RotatingFile::open(&path, small_policy(false)).unwrap();
		sink.write_all(b"0123456789\n").unwrap();
		sink.write_all(b"abcdefghij\n").unwrap();

		assert_eq!(fs::read_to_string(&path).unwrap(), "abcdefghij\n");
		let rotated = backups(dir.path(), &path);
		assert_eq!(rotated.len(), 1);
		assert_eq!(fs::read_to_string(&rotated[0]).unwrap(), "0123456789\n");
	}

	#[test]
	fn oversized_single_write_is_not_split() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("web.err");

		let mut sink = RotatingFile::open(&path, small_policy(false)).unwrap();
		sink.write_all(b"this line is longer than sixteen bytes\n").unwrap();
		assert!(backups(dir.path(), &path).is_empty());
	}

	#[tokio::test]
	async fn relay_copies_stream_into_sink() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("echo.out");
		let sink = RotatingFile::open(&path, RotationPolicy::default()).unwrap();
		let process = Arc::new(Process::new(
			"echo",
			CommandSpec {
				binary: "echo".into(),
				args: vec![],
				env: Env::Inherit,
				dir: ".".into(),
				work_dir: dir.path().to_path_buf(),
			},
		));

		let input: &[u8] = b"line one\nline two\n";
		relay(input, sink, None, Arc::clone(&process)).await;

		assert_eq!(fs::read_to_string(&path).unwrap(), "line one\nline two\n");
		assert!(process.relay_error().is_none());
	}
}
