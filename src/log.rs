use crate::paths::Paths;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default staleness timeout: a log untouched for a day may be reused.
pub const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Serializes directory scans so concurrent launches never pick the same slot.
static LOG_FILE_SELECTION: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileEntry {
    pub index: u64,
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Parse the index out of `{module}.log.{index}`.
pub fn parse_log_index(file_name: &str, module: &str) -> Option<u64> {
    let prefix = Paths::log_prefix(module);
    file_name.strip_prefix(&prefix)?.parse().ok()
}

/// All `{module}.log.{index}` files in `dir`, sorted by index.
pub fn list_log_files(dir: &Path, module: &str) -> io::Result<Vec<LogFileEntry>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = parse_log_index(&name.to_string_lossy(), module) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push(LogFileEntry {
            index,
            path: entry.path(),
            len: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    entries.sort_by_key(|e| e.index);
    Ok(entries)
}

// ---------------------------------------------------------------------------
// select_log_file: reuse a stale slot or open the next one
// ---------------------------------------------------------------------------

/// Pick the log file for the next launch of `module` in `paths`.
///
/// The first file whose modification time is older than `timeout` is
/// truncated and reused under its own index. Otherwise (or when the reuse
/// fails) a fresh file is created at one past the highest existing index.
/// The returned file has just been touched.
pub fn select_log_file(paths: &Paths, module: &str, timeout: Duration) -> io::Result<PathBuf> {
    select_log_file_with(paths, module, timeout, recreate)
}

fn select_log_file_with(
    paths: &Paths,
    module: &str,
    timeout: Duration,
    reuse: impl FnOnce(&Path) -> io::Result<()>,
) -> io::Result<PathBuf> {
    let _guard = LOG_FILE_SELECTION
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let existing = list_log_files(paths.work_dir(), module)?;
    let next_index = existing.last().map_or(0, |e| e.index + 1);

    let now = SystemTime::now();
    let stale = existing.iter().find(|e| is_stale(e.modified, now, timeout));

    let path = match stale {
        Some(entry) => match reuse(&entry.path) {
            Ok(()) => {
                tracing::debug!(path = %entry.path.display(), "reusing stale log file");
                entry.path.clone()
            }
            Err(e) => {
                tracing::warn!(
                    path = %entry.path.display(),
                    error = %e,
                    "failed to reuse stale log file, creating a new one"
                );
                create_new(paths, module, next_index)?
            }
        },
        None => create_new(paths, module, next_index)?,
    };

    touch(&path)?;
    Ok(path)
}

/// Timestamps with coarse granularity make this advisory: a file modified
/// within the last second of the window may be judged either way.
fn is_stale(modified: Option<SystemTime>, now: SystemTime, timeout: Duration) -> bool {
    let Some(modified) = modified else {
        return false;
    };
    match now.checked_sub(timeout) {
        Some(threshold) => modified < threshold,
        None => false,
    }
}

fn recreate(path: &Path) -> io::Result<()> {
    fs::remove_file(path)?;
    OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(())
}

fn create_new(paths: &Paths, module: &str, index: u64) -> io::Result<PathBuf> {
    fs::create_dir_all(paths.work_dir())?;
    let path = paths.log_file(module, index);
    OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
    tracing::debug!(path = %path.display(), "created log file");
    Ok(path)
}

fn touch(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now())
}

/// Open `path` for appending; used for the child's stdout and stderr.
pub fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
