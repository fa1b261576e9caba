//! Streaming tail of an application's stdout/stderr file.
//!
//! The tailer polls file size rather than subscribing to change notifications.
//! Each attachment owns its own cursor; many tailers may watch the same file.

use std::{
    convert::Infallible,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// Line that was already in the file when the tail attached.
    History(String),
    Line { text: String, at: DateTime<Utc> },
    /// Out-of-band notice (file missing, truncated).
    Notice(String),
    /// Last event of a stream. `error` is set when the tail stopped on an I/O failure.
    Closed { error: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    pub poll_interval: Duration,
    /// Size of the trailing window replayed as history on attach.
    pub history_bytes: u64,
    pub history_max_lines: usize,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            history_bytes: 8 * 1024,
            history_max_lines: 100,
        }
    }
}

/// Which of the two per-application log files to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Handle to a running tail. Dropping it does not stop the tail; call
/// [`TailHandle::cancel`] or drop the receiving end of the sink.
///
/// Cancellation takes effect even while the tail is blocked on a full sink.
/// The final [`TailEvent::Closed`] is then delivered only if the consumer
/// frees a slot within [`CLOSE_SEND_TIMEOUT`].
#[derive(Debug)]
pub struct TailHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the tail task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "log tail task panicked");
        }
    }
}

/// How long the closing event may wait for room in the sink.
pub const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn attach_log_tail(
    path: impl Into<PathBuf>,
    sink: mpsc::Sender<TailEvent>,
    mut opts: TailOptions,
) -> TailHandle {
    opts.poll_interval = opts.poll_interval.max(MIN_POLL_INTERVAL);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_tail(path.into(), sink, opts, cancel.clone()));
    TailHandle { cancel, task }
}

fn split_lines(buf: &[u8]) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences are replaced.
    String::from_utf8_lossy(buf)
        .split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Lines of the history window, capped to the last `max_lines`.
///
/// When the window starts mid-file its first (partial) line is dropped.
fn history_lines(buf: &[u8], window_starts_mid_file: bool, max_lines: usize) -> Vec<String> {
    let buf: &[u8] = if window_starts_mid_file {
        match buf.iter().position(|&b| b == b'\n') {
            Some(nl) => &buf[nl + 1..],
            None => &[],
        }
    } else {
        buf
    };
    let mut out = split_lines(buf);
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut f = tokio::fs::File::open(path).await?;
    f.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity(end.saturating_sub(start) as usize);
    f.take(end.saturating_sub(start)).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Device and inode; `None` where the platform does not expose them.
type FileId = Option<(u64, u64)>;

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> FileId {
    None
}

enum Probe {
    File { size: u64, id: FileId },
    Missing,
}

async fn probe(path: &Path) -> std::io::Result<Probe> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Probe::File {
            size: meta.len(),
            id: file_id(&meta),
        }),
        Ok(_) => Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Probe::Missing),
        Err(e) => Err(e),
    }
}

async fn run_tail(
    path: PathBuf,
    sink: mpsc::Sender<TailEvent>,
    opts: TailOptions,
    cancel: CancellationToken,
) {
    let Err(stop) = tail_loop(&path, &sink, opts, &cancel).await;
    let closed = match stop {
        TailStop::Cancelled => TailEvent::Closed { error: None },
        TailStop::SinkClosed => return,
        TailStop::Io(e) => {
            tracing::warn!(path = %path.display(), error = %e, "log tail stopped");
            TailEvent::Closed {
                error: Some(e.to_string()),
            }
        }
    };
    if tokio::time::timeout(CLOSE_SEND_TIMEOUT, sink.send(closed))
        .await
        .is_err()
    {
        tracing::debug!(path = %path.display(), "consumer idle; closing event dropped");
    }
}

enum TailStop {
    Cancelled,
    SinkClosed,
    Io(std::io::Error),
}

impl From<std::io::Error> for TailStop {
    fn from(e: std::io::Error) -> Self {
        TailStop::Io(e)
    }
}

async fn emit(
    sink: &mpsc::Sender<TailEvent>,
    cancel: &CancellationToken,
    ev: TailEvent,
) -> Result<(), TailStop> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TailStop::Cancelled),
        sent = sink.send(ev) => sent.map_err(|_| TailStop::SinkClosed),
    }
}

/// Runs until cancelled, the consumer goes away or an I/O error occurs.
async fn tail_loop(
    path: &Path,
    sink: &mpsc::Sender<TailEvent>,
    opts: TailOptions,
    cancel: &CancellationToken,
) -> Result<Infallible, TailStop> {
    let mut missing = false;
    let mut current_id: FileId = None;
    let mut cursor = match probe(path).await? {
        Probe::File { size, id } => {
            current_id = id;
            let start = size.saturating_sub(opts.history_bytes);
            if start < size && opts.history_max_lines > 0 {
                let buf = read_range(path, start, size).await?;
                for line in history_lines(&buf, start > 0, opts.history_max_lines) {
                    emit(sink, cancel, TailEvent::History(line)).await?;
                }
            }
            size
        }
        Probe::Missing => {
            missing = true;
            emit(
                sink,
                cancel,
                TailEvent::Notice(format!("waiting for {} to be created", path.display())),
            )
            .await?;
            0
        }
    };

    let mut ticker = tokio::time::interval(opts.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TailStop::Cancelled),
            _ = sink.closed() => return Err(TailStop::SinkClosed),
            _ = ticker.tick() => {}
        }

        let (size, id) = match probe(path).await? {
            Probe::File { size, id } => {
                missing = false;
                (size, id)
            }
            Probe::Missing => {
                current_id = None;
                cursor = 0;
                if !missing {
                    missing = true;
                    emit(
                        sink,
                        cancel,
                        TailEvent::Notice(format!("{} was removed; waiting", path.display())),
                    )
                    .await?;
                }
                continue;
            }
        };

        if id != current_id {
            // Recreated or rotated: the new file is read from its start.
            if current_id.is_some() {
                emit(sink, cancel, TailEvent::Notice("log file replaced".to_string())).await?;
            }
            current_id = id;
            cursor = 0;
        } else if size < cursor {
            cursor = 0;
            emit(sink, cancel, TailEvent::Notice("log file truncated".to_string())).await?;
        }
        if size > cursor {
            let buf = read_range(path, cursor, size).await?;
            cursor += buf.len() as u64;
            let at = Utc::now();
            for text in split_lines(&buf) {
                emit(sink, cancel, TailEvent::Line { text, at }).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn opts() -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(20),
            history_bytes: 8 * 1024,
            history_max_lines: 100,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<TailEvent>) -> TailEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for tail event")
            .expect("tail channel closed")
    }

    fn append(path: &Path, s: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(s.as_bytes()).unwrap();
    }

    fn line_text(ev: TailEvent) -> String {
        match ev {
            TailEvent::Line { text, .. } => text,
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[test]
    fn history_drops_partial_first_line_and_caps() {
        let lines = history_lines(b"aaaa\nbbb\nccc\n", true, 10);
        assert_eq!(lines, vec!["bbb", "ccc"]);

        let lines = history_lines(b"one\r\ntwo\nthree\n", false, 2);
        assert_eq!(lines, vec!["two", "three"]);

        assert!(history_lines(b"no newline at all", true, 10).is_empty());
    }

    #[tokio::test]
    async fn replays_history_then_streams_each_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "first\nsecond\n");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(&path, tx, opts());

        assert_eq!(next(&mut rx).await, TailEvent::History("first".to_string()));
        assert_eq!(next(&mut rx).await, TailEvent::History("second".to_string()));

        append(&path, "third\n");
        assert_eq!(line_text(next(&mut rx).await), "third");

        // No duplicate delivery on later polls.
        let extra = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(extra.is_err());

        handle.cancel();
        assert_eq!(next(&mut rx).await, TailEvent::Closed { error: None });
        handle.join().await;
    }

    #[tokio::test]
    async fn history_window_starts_on_a_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "aaaaaaaaaa\nbbb\nccc\n");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(
            &path,
            tx,
            TailOptions {
                history_bytes: 10,
                ..opts()
            },
        );

        assert_eq!(next(&mut rx).await, TailEvent::History("bbb".to_string()));
        assert_eq!(next(&mut rx).await, TailEvent::History("ccc".to_string()));
        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr.log");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(&path, tx, opts());
        assert!(matches!(next(&mut rx).await, TailEvent::Notice(_)));

        append(&path, "booted\n");
        assert_eq!(line_text(next(&mut rx).await), "booted");
        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn truncation_is_announced_before_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "old line\n");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(&path, tx, opts());
        assert_eq!(next(&mut rx).await, TailEvent::History("old line".to_string()));

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            TailEvent::Notice("log file truncated".to_string())
        );

        append(&path, "fresh\n");
        assert_eq!(line_text(next(&mut rx).await), "fresh");
        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn replaced_file_is_read_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "old\n");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(&path, tx, opts());
        assert_eq!(next(&mut rx).await, TailEvent::History("old".to_string()));

        // Swapped in atomically and larger than the old cursor.
        let staged = dir.path().join("stdout.log.new");
        std::fs::write(&staged, "new first line\nnew second line\n").unwrap();
        std::fs::rename(&staged, &path).unwrap();

        assert_eq!(
            next(&mut rx).await,
            TailEvent::Notice("log file replaced".to_string())
        );
        assert_eq!(line_text(next(&mut rx).await), "new first line");
        assert_eq!(line_text(next(&mut rx).await), "new second line");
        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn cancel_stops_tail_blocked_on_idle_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "a\nb\nc\nd\n");

        let (tx, mut rx) = mpsc::channel(1);
        let handle = attach_log_tail(&path, tx, opts());
        // Let the tail fill the single slot and block on the next send.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle.join())
            .await
            .expect("tail did not stop after cancel");

        assert_eq!(rx.recv().await, Some(TailEvent::History("a".to_string())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn zero_poll_interval_still_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(
            &path,
            tx,
            TailOptions {
                poll_interval: Duration::ZERO,
                ..opts()
            },
        );
        append(&path, "tick\n");
        assert_eq!(line_text(next(&mut rx).await), "tick");
        handle.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn stops_when_consumer_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        append(&path, "");

        let (tx, rx) = mpsc::channel(16);
        let handle = attach_log_tail(&path, tx, opts());
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("tail did not stop after the consumer disconnected");
    }

    #[tokio::test]
    async fn directory_path_closes_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = attach_log_tail(dir.path(), tx, opts());

        match next(&mut rx).await {
            TailEvent::Closed { error: Some(msg) } => assert!(msg.contains("not a regular file")),
            other => panic!("unexpected event {other:?}"),
        }
        handle.join().await;
    }
}
