use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use flate2::write::GzEncoder;
use flate2::Compression;

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Held while a backup is compressed and its siblings pruned, so a prune
/// never deletes a file another rotation is still compressing.
static HOUSEKEEPING: Mutex<()> = Mutex::new(());

/// Rotation rules shared by every output sink a manager creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
	/// Rotate once the current file would grow beyond this many bytes.
	pub max_size: u64,
	/// Backups kept per log file; 0 keeps all.
	pub max_backups: usize,
	/// Backups older than this are removed; zero keeps all.
	pub max_age: Duration,
	pub compress: bool,
}

impl Default for RotationPolicy {
	fn default() -> Self {
		Self {
			max_size: 500 * 1024 * 1024,
			max_backups: 3,
			max_age: Duration::from_secs(28 * 86400),
			compress: true,
		}
	}
}

/// `web.out` rotated at `now` becomes `web-2026-02-14T09-47-03.120.out`.
pub fn backup_name(path: &Path, now: DateTime<Local>) -> PathBuf {
	let (stem, ext) = split_name(path);
	let name = format!("{}-{}{}", stem, now.format(BACKUP_TIME_FORMAT), ext);
	path.with_file_name(name)
}

/// Timestamp encoded in a backup file name belonging to `path`, whether or not
/// the backup has been compressed yet.
pub fn parse_backup_time(path: &Path, file_name: &str) -> Option<DateTime<Local>> {
	let (stem, ext) = split_name(path);
	let rest = file_name.strip_prefix(&stem)?.strip_prefix('-')?;
	let rest = rest.strip_suffix(".gz").unwrap_or(rest);
	let stamp = rest.strip_suffix(ext.as_str())?;
	let naive = NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT).ok()?;
	Local.from_local_datetime(&naive).earliest()
}

fn split_name(path: &Path) -> (String, String) {
	let stem = path
		.file_stem()
		.map(|s| s.to_string_lossy().to_string())
		.unwrap_or_default();
	let ext = path
		.extension()
		.map(|e| format!(".{}", e.to_string_lossy()))
		.unwrap_or_default();
	(stem, ext)
}

/// Gzip `path` into `path.gz` and remove the original.
pub fn compress(path: &Path) -> io::Result<PathBuf> {
	let mut gz_name = path.as_os_str().to_owned();
	gz_name.push(".gz");
	let gz_path = PathBuf::from(gz_name);

	let mut src = File::open(path)?;
	let dst = File::create(&gz_path)?;
	let mut encoder = GzEncoder::new(dst, Compression::default());
	io::copy(&mut src, &mut encoder)?;
	encoder.finish()?;
	fs::remove_file(path)?;
	Ok(gz_path)
}

/// Post-rotation work for `backup`, a freshly rotated copy of `path`:
/// optional gzip, then pruning. Runs one rotation at a time.
pub fn finish_rotation(path: &Path, backup: &Path, policy: &RotationPolicy) {
	let _guard = HOUSEKEEPING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	if policy.compress {
		if backup.exists() {
			if let Err(e) = compress(backup) {
				tracing::warn!("failed to compress {}: {}", backup.display(), e);
			}
		} else {
			tracing::debug!("{} already pruned", backup.display());
		}
	}
	prune_backups(path, policy);
}

/// Remove backups of `path` beyond the policy's count and age limits.
pub fn prune_backups(path: &Path, policy: &RotationPolicy) {
	let dir = match path.parent() {
		Some(d) => d,
		None => return,
	};
	let entries = match fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return,
	};

	let mut backups: Vec<(PathBuf, DateTime<Local>)> = entries
		.flatten()
		.filter_map(|entry| {
			let name = entry.file_name().to_string_lossy().to_string();
			parse_backup_time(path, &name).map(|t| (entry.path(), t))
		})
		.collect();
	backups.sort_by(|a, b| b.1.cmp(&a.1));

	let cutoff = if policy.max_age.is_zero() {
		None
	} else {
		Some(DateTime::<Local>::from(SystemTime::now() - policy.max_age))
	};

	for (i, (backup, time)) in backups.iter().enumerate() {
		let over_count = policy.max_backups > 0 && i >= policy.max_backups;
		let too_old = cutoff.is_some_and(|c| *time < c);
		if over_count || too_old {
			if let Err(e) = fs::remove_file(backup) {
				tracing::warn!("failed to remove old log {}: {}", backup.display(), e);
			}
		}
	}
}
