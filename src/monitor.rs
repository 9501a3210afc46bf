use crate::process::ProcessStatus;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_MAX_LOG_LINES: usize = 10;
pub const DEFAULT_MAX_ERROR_SIZE: usize = 8192;

const CAUSED_BY: &str = "Caused by:";

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

pub fn is_exception(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("exception:") || lower.contains("exception in thread")
}

pub fn is_stack_frame(line: &str) -> bool {
    line.trim_start().starts_with("at ")
}

pub fn is_caused_by(line: &str) -> bool {
    line.starts_with(CAUSED_BY)
}

/// A line that opens a new error block.
pub fn starts_error_block(line: &str) -> bool {
    is_exception(line) && !is_stack_frame(line) && !is_caused_by(line)
}

/// A line that extends an open error block.
pub fn continues_error_block(line: &str) -> bool {
    is_exception(line) || is_stack_frame(line) || is_caused_by(line)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Bounded ring of the latest ordinary log lines.
#[derive(Debug, Clone)]
pub struct RecentLines {
    capacity: usize,
    lines: VecDeque<String>,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedError {
    Unset,
    Detected { text: String, log_file: PathBuf },
}

impl DetectedError {
    pub fn is_set(&self) -> bool {
        matches!(self, DetectedError::Detected { .. })
    }
}

/// Error and tail live under one lock so readers get a consistent snapshot.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub error: DetectedError,
    pub recent: RecentLines,
}

impl MonitorState {
    pub fn new(max_log_lines: usize) -> Self {
        Self {
            error: DetectedError::Unset,
            recent: RecentLines::new(max_log_lines),
        }
    }
}

pub type SharedState = Arc<RwLock<MonitorState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    NotStarted,
    Running,
    Released,
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OpenBlock {
    text: String,
    full: bool,
}

/// Incremental line classifier. Feeding lines one at a time yields the same
/// result as classifying the whole log at once.
#[derive(Debug)]
pub struct LineClassifier {
    log_file: PathBuf,
    max_error_size: usize,
    block: Option<OpenBlock>,
}

impl LineClassifier {
    pub fn new(log_file: PathBuf, max_error_size: usize) -> Self {
        Self {
            log_file,
            max_error_size,
            block: None,
        }
    }

    pub fn feed(&mut self, line: &str, state: &mut MonitorState) {
        if let Some(block) = self.block.as_mut() {
            if block.text.len() >= self.max_error_size {
                block.full = true;
            }
            if block.full {
                // Past the cap only frames and causes are swallowed; a new
                // signature line opens a fresh block below.
                if is_stack_frame(line) || is_caused_by(line) {
                    return;
                }
                self.block = None;
            } else if continues_error_block(line) {
                block.text.push('\n');
                block.text.push_str(line);
                state.error = detected(&block.text, &self.log_file);
                return;
            } else {
                self.block = None;
            }
        }

        if starts_error_block(line) {
            state.error = detected(line, &self.log_file);
            self.block = Some(OpenBlock {
                text: line.to_string(),
                full: false,
            });
        } else {
            state.recent.push(line.to_string());
        }
    }
}

fn detected(text: &str, log_file: &Path) -> DetectedError {
    DetectedError::Detected {
        text: text.to_string(),
        log_file: log_file.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Handle on a running monitor task.
pub struct LogMonitor {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<MonitorStatus>,
    task: JoinHandle<()>,
}

impl LogMonitor {
    pub fn status(&self) -> MonitorStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    /// Interrupt the task and wait until it has released the reader.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Marks the monitor released when dropped, whatever the exit path.
struct ReleaseGuard(watch::Sender<MonitorStatus>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.send_replace(MonitorStatus::Released);
    }
}

pub fn spawn_monitor(
    log_file: PathBuf,
    state: SharedState,
    max_error_size: usize,
    process: watch::Receiver<ProcessStatus>,
) -> LogMonitor {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(MonitorStatus::NotStarted);

    // Created outside the task so an abort before the first poll still releases.
    let guard = ReleaseGuard(status_tx);
    let task = tokio::spawn(async move {
        guard.0.send_replace(MonitorStatus::Running);
        match run_monitor(&log_file, &state, max_error_size, process, shutdown_rx).await {
            Ok(()) => tracing::debug!(log = %log_file.display(), "log monitor finished"),
            Err(e) => tracing::warn!(
                log = %log_file.display(),
                error = %e,
                "log monitor stopped on read failure"
            ),
        }
        drop(guard);
    });

    LogMonitor {
        shutdown: shutdown_tx,
        status: status_rx,
        task,
    }
}

async fn run_monitor(
    log_file: &Path,
    state: &SharedState,
    max_error_size: usize,
    mut process: watch::Receiver<ProcessStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let file = tokio::fs::File::open(log_file).await?;
    let mut reader = BufReader::new(file);
    let mut classifier = LineClassifier::new(log_file.to_path_buf(), max_error_size);
    let mut buf: Vec<u8> = Vec::new();
    let mut draining = false;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let n = reader.read_until(b'\n', &mut buf).await?;
        if n > 0 && buf.ends_with(b"\n") {
            let line = decode_line(&buf);
            buf.clear();
            classifier.feed(&line, &mut *state.write().await);
            continue;
        }

        // No complete line yet.
        if draining {
            if !buf.is_empty() {
                let line = decode_line(&buf);
                classifier.feed(&line, &mut *state.write().await);
            }
            return Ok(());
        }
        if *process.borrow_and_update() != ProcessStatus::Running {
            // The child is gone; one more pass picks up its final writes.
            draining = true;
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = String::from_utf8_lossy(buf);
    line.trim_end_matches(['\n', '\r']).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn classify(lines: &[&str], max_error_size: usize) -> MonitorState {
        let mut state = MonitorState::new(10);
        let mut classifier = LineClassifier::new(PathBuf::from("/tmp/u1/spark.log.0"), max_error_size);
        for line in lines {
            classifier.feed(line, &mut state);
        }
        state
    }

    fn error_text(state: &MonitorState) -> Option<&str> {
        match &state.error {
            DetectedError::Detected { text, .. } => Some(text),
            DetectedError::Unset => None,
        }
    }

    #[test]
    fn test_exception_signature_is_case_insensitive() {
        assert!(is_exception("java.lang.RuntimeException: boom"));
        assert!(is_exception("EXCEPTION: upper"));
        assert!(is_exception("Exception in thread \"main\""));
        assert!(is_exception("exception in thread main"));
        assert!(!is_exception("no exceptions here"));
        assert!(!is_exception("ExceptionHandler registered"));
    }

    #[test]
    fn test_stack_frame_detection() {
        assert!(is_stack_frame("\tat foo.bar(Baz.java:1)"));
        assert!(is_stack_frame("    at foo.bar(Baz.java:1)"));
        assert!(is_stack_frame("at foo.bar"));
        assert!(!is_stack_frame("attempting connection"));
        assert!(!is_stack_frame("look at this"));
    }

    #[test]
    fn test_caused_by_does_not_start_a_block() {
        assert!(!starts_error_block("Caused by: java.io.IOException: disk"));
        assert!(continues_error_block("Caused by: java.io.IOException: disk"));
        assert!(continues_error_block("Caused by:no space"));
    }

    #[test]
    fn test_single_exception_in_thread_line() {
        let line = "Exception in thread \"main\" java.lang.NoClassDefFoundError";
        let state = classify(&[line, "shutting down"], 8192);
        assert_eq!(error_text(&state), Some(line));
        assert_eq!(state.recent.to_vec(), vec!["shutting down"]);
    }

    #[test]
    fn test_exception_with_stack_frames() {
        let lines = [
            "Exception: boom",
            "\tat a.b(C.java:1)",
            "\tat d.e(F.java:2)",
            "\tat g.h(I.java:3)",
        ];
        let state = classify(&lines, 8192);
        assert_eq!(error_text(&state), Some(lines.join("\n").as_str()));
        assert!(state.recent.is_empty());
    }

    #[test]
    fn test_caused_by_chain_is_kept_in_block() {
        let lines = [
            "org.apache.spark.SparkException: Job aborted",
            "\tat org.apache.spark.Driver.run(Driver.scala:10)",
            "Caused by: java.io.IOException: No space left on device",
            "\tat java.io.FileOutputStream.write(Native Method)",
        ];
        let state = classify(&lines, 8192);
        assert_eq!(error_text(&state), Some(lines.join("\n").as_str()));
    }

    #[test]
    fn test_block_ends_at_ordinary_line() {
        let state = classify(
            &["Exception: boom", "\tat a.b(C.java:1)", "INFO retrying", "INFO done"],
            8192,
        );
        assert_eq!(error_text(&state), Some("Exception: boom\n\tat a.b(C.java:1)"));
        assert_eq!(state.recent.to_vec(), vec!["INFO retrying", "INFO done"]);
    }

    #[test]
    fn test_orphan_stack_frames_are_not_errors() {
        let state = classify(&["\tat a.b(C.java:1)", "Caused by: x.Y: z"], 8192);
        assert_eq!(state.error, DetectedError::Unset);
        assert_eq!(state.recent.len(), 2);
    }

    #[test]
    fn test_newer_error_replaces_older() {
        let state = classify(
            &["Exception: first", "\tat a.b(C.java:1)", "INFO between", "Exception: second"],
            8192,
        );
        assert_eq!(error_text(&state), Some("Exception: second"));
    }

    #[test]
    fn test_ordinary_line_never_clears_error() {
        let state = classify(&["Exception: boom", "INFO a", "INFO b"], 8192);
        assert_eq!(error_text(&state), Some("Exception: boom"));
    }

    #[test]
    fn test_block_is_capped_and_overflow_discarded() {
        let mut lines = vec!["Exception: boom".to_string()];
        for i in 0..100 {
            lines.push(format!("\tat frame{i}(X.java:{i})"));
        }
        lines.push("INFO after".to_string());
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

        let state = classify(&refs, 64);
        let text = error_text(&state).unwrap();
        assert!(text.starts_with("Exception: boom\n\tat frame0"));
        // Appending stops once the block reaches the cap.
        assert!(text.len() < 64 + 40, "block too long: {}", text.len());
        assert!(!text.contains("frame99"));
        // Frames past the cap are neither in the error nor in the tail.
        assert_eq!(state.recent.to_vec(), vec!["INFO after"]);
    }

    #[test]
    fn test_new_exception_after_full_block_replaces_it() {
        let state = classify(
            &[
                "Exception: first",
                "\tat a.b(C.java:1)",
                "\tat d.e(F.java:2)",
                "\tat g.h(I.java:3)",
                "Exception in thread \"main\" second",
                "\tat j.k(L.java:4)",
            ],
            40,
        );
        assert_eq!(
            error_text(&state),
            Some("Exception in thread \"main\" second\n\tat j.k(L.java:4)")
        );
        assert!(state.recent.is_empty());
    }

    #[test]
    fn test_full_block_swallows_causes_until_ordinary_line() {
        let state = classify(
            &[
                "Exception: first",
                "\tat a.b(C.java:1)",
                "Caused by: java.io.IOException: disk",
                "\tat c.d(E.java:2)",
                "INFO retrying",
            ],
            20,
        );
        assert_eq!(error_text(&state), Some("Exception: first\n\tat a.b(C.java:1)"));
        assert_eq!(state.recent.to_vec(), vec!["INFO retrying"]);
    }

    #[test]
    fn test_recent_lines_evict_oldest() {
        let mut recent = RecentLines::new(3);
        for i in 1..=5 {
            recent.push(format!("line{i}"));
        }
        assert_eq!(recent.to_vec(), vec!["line3", "line4", "line5"]);
        assert_eq!(recent.capacity(), 3);
    }

    #[test]
    fn test_recent_lines_zero_capacity() {
        let mut recent = RecentLines::new(0);
        recent.push("x".to_string());
        assert!(recent.is_empty());
    }

    #[test]
    fn test_decode_line_strips_line_endings() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"\tat x\n"), "\tat x");
    }

    // -------------------------------------------------------------------
    // Task
    // -------------------------------------------------------------------

    fn running() -> (watch::Sender<ProcessStatus>, watch::Receiver<ProcessStatus>) {
        watch::channel(ProcessStatus::Running)
    }

    async fn wait_until<F: Fn(&MonitorState) -> bool>(state: &SharedState, f: F) -> bool {
        for _ in 0..50 {
            if f(&*state.read().await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_monitor_follows_growing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spark.log.0");
        let mut file = std::fs::File::create(&path).unwrap();
        let state: SharedState = Arc::new(RwLock::new(MonitorState::new(10)));
        let (_proc_tx, proc_rx) = running();

        let monitor = spawn_monitor(path.clone(), Arc::clone(&state), 8192, proc_rx);

        writeln!(file, "INFO starting").unwrap();
        assert!(wait_until(&state, |s| s.recent.len() == 1).await);

        // A partial line is held until its newline arrives.
        write!(file, "Exception: bo").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(state.read().await.error, DetectedError::Unset);

        writeln!(file, "om").unwrap();
        writeln!(file, "\tat foo.bar(Baz.java:1)").unwrap();
        assert!(
            wait_until(&state, |s| s.error
                == DetectedError::Detected {
                    text: "Exception: boom\n\tat foo.bar(Baz.java:1)".to_string(),
                    log_file: path.clone(),
                })
            .await
        );
        assert_eq!(state.read().await.recent.to_vec(), vec!["INFO starting"]);

        assert_eq!(monitor.status(), MonitorStatus::Running);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_released_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spark.log.0");
        std::fs::write(&path, "").unwrap();
        let state: SharedState = Arc::new(RwLock::new(MonitorState::new(10)));
        let (_proc_tx, proc_rx) = running();

        let monitor = spawn_monitor(path, state, 8192, proc_rx);
        let mut status = monitor.status.clone();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;
        assert_eq!(*status.borrow_and_update(), MonitorStatus::Released);
    }

    #[tokio::test]
    async fn test_monitor_releases_after_process_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spark.log.0");
        std::fs::write(&path, "INFO a\nException in thread \"main\" boom\ntrailing").unwrap();
        let state: SharedState = Arc::new(RwLock::new(MonitorState::new(10)));
        let (proc_tx, proc_rx) = running();

        let monitor = spawn_monitor(path, Arc::clone(&state), 8192, proc_rx);
        proc_tx.send(ProcessStatus::Exited(Some(1))).unwrap();

        let mut status = monitor.status.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == MonitorStatus::Released),
        )
        .await
        .expect("monitor should release after the process exits")
        .unwrap();

        let snapshot = state.read().await;
        assert!(snapshot.error.is_set());
        assert_eq!(snapshot.recent.to_vec(), vec!["INFO a", "trailing"]);
    }

    #[tokio::test]
    async fn test_monitor_released_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let state: SharedState = Arc::new(RwLock::new(MonitorState::new(10)));
        let (_proc_tx, proc_rx) = running();

        let monitor = spawn_monitor(dir.path().join("missing.log.0"), state, 8192, proc_rx);
        let mut status = monitor.status.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == MonitorStatus::Released),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
