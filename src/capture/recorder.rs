//! Background traffic recorder bound to the build window.
//!
//! The recorder is split into two types so the ordering barriers are carried
//! by the API: [`ActiveCapture`] only exists once the source is recording,
//! and [`FlushedCapture`] only exists once every buffered record is on disk.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::capture::log::{CaptureLogWriter, CaptureRecord};
use crate::capture::parser::{ParseOutcome, TcpdumpParser};
use crate::capture::PacketSource;
use crate::error::CaptureError;

/// Longest capture line accepted before it is recorded as unparsed.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How long `stop` waits for the recorder to drain after closing the source.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Time interval during which events were recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl CaptureWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.stop
    }
}

/// Whether the capture log can be trusted to hold every event of the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Incomplete { reason: String },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Completeness::Complete => None,
            Completeness::Incomplete { reason } => Some(reason),
        }
    }
}

/// Counters kept by the recorder task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub events: u64,
    pub unparsed: u64,
    pub out_of_window: u64,
}

/// Recorder configuration; consumed by `start`.
pub struct TrafficCapture {
    log_path: PathBuf,
    sandbox_addresses: Vec<IpAddr>,
    drain_timeout: Duration,
}

/// State shared between the capture handle and its recorder task.
struct Shared {
    stopping: AtomicBool,
    stop_at: Mutex<Option<DateTime<Utc>>>,
    failure: Mutex<Option<String>>,
    stats: Mutex<CaptureStats>,
}

impl Shared {
    fn new() -> Self {
        Self {
            stopping: AtomicBool::new(false),
            stop_at: Mutex::new(None),
            failure: Mutex::new(None),
            stats: Mutex::new(CaptureStats::default()),
        }
    }

    fn completeness(&self) -> Completeness {
        match self.failure.lock().clone() {
            None => Completeness::Complete,
            Some(reason) => Completeness::Incomplete { reason },
        }
    }

    fn fail(&self, reason: impl Into<String>) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason.into());
        }
    }
}

impl TrafficCapture {
    /// `sandbox_addresses` are every address the guest may send from.
    pub fn new(log_path: impl Into<PathBuf>, sandbox_addresses: Vec<IpAddr>) -> Self {
        Self {
            log_path: log_path.into(),
            sandbox_addresses,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Open the source and begin recording. Returns once the source reports
    /// it is live. A source that cannot start yields a capture already marked
    /// as failed, so the build still runs and the bundle is marked incomplete.
    pub async fn start(self, mut source: Box<dyn PacketSource>) -> Result<ActiveCapture, CaptureError> {
        let mut writer = CaptureLogWriter::create(&self.log_path).await?;

        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();

        // The window opens before the source does, so nothing the source
        // reports as live traffic can predate it. Captured timestamps carry
        // microseconds, so the boundary is truncated to match.
        let started_at = truncate_to_micros(Utc::now());

        let reader = match source.open().await {
            Ok(reader) => Some(reader),
            Err(e) => {
                tracing::error!("Traffic capture failed to start: {}", e);
                shared.fail(format!("capture source failed to start: {}", e));
                None
            }
        };

        writer.append(&CaptureRecord::Start { at: started_at }).await?;
        writer.flush_durable().await?;

        let task = match reader {
            Some(reader) => {
                tracing::info!("Traffic capture started at {}", started_at);
                let parser = TcpdumpParser::new(self.sandbox_addresses);
                tokio::spawn(record(
                    reader,
                    writer,
                    parser,
                    started_at,
                    shared.clone(),
                    cancel.clone(),
                ))
            }
            None => tokio::spawn(async move { writer }),
        };

        Ok(ActiveCapture {
            source,
            task,
            shared,
            cancel,
            started_at,
            log_path: self.log_path,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// A running capture. Build commands may only be issued while one exists.
pub struct ActiveCapture {
    source: Box<dyn PacketSource>,
    task: JoinHandle<CaptureLogWriter>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
    drain_timeout: Duration,
}

impl ActiveCapture {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// False once the recorder has failed or exited on its own.
    pub fn is_healthy(&self) -> bool {
        self.shared.failure.lock().is_none() && !self.task.is_finished()
    }

    pub fn stats(&self) -> CaptureStats {
        *self.shared.stats.lock()
    }

    /// Stop the source, drain and durably flush the log. `interrupted` marks
    /// a run that was cancelled before the build finished. Failing to seal
    /// the log yields an incomplete capture, not an error.
    pub async fn stop(mut self, interrupted: bool) -> Result<FlushedCapture, CaptureError> {
        let stop_at = Utc::now();
        *self.shared.stop_at.lock() = Some(stop_at);
        self.shared.stopping.store(true, Ordering::SeqCst);

        if let Err(e) = self.source.close().await {
            tracing::error!("Traffic capture did not stop cleanly: {}", e);
            self.shared.fail(format!("capture flush failed: {}", e));
        }

        let writer = match tokio::time::timeout(self.drain_timeout, &mut self.task).await {
            Ok(joined) => joined,
            Err(_) => {
                self.shared.fail("capture recorder did not drain before timeout");
                self.cancel.cancel();
                (&mut self.task).await
            }
        };

        let writer = match writer {
            Ok(writer) => Some(writer),
            Err(e) => {
                self.shared.fail(format!("capture recorder crashed: {}", e));
                match CaptureLogWriter::reopen(&self.log_path).await {
                    Ok(writer) => Some(writer),
                    Err(e) => {
                        tracing::error!("Could not reopen capture log: {}", e);
                        None
                    }
                }
            }
        };

        if interrupted {
            self.shared.fail("run interrupted before the build finished");
        }

        let stats = *self.shared.stats.lock();
        let completeness = seal(writer, &self.shared, stop_at).await;

        match &completeness {
            Completeness::Complete => tracing::info!(
                "Traffic capture stopped: {} events, {} unparsed lines",
                stats.events,
                stats.unparsed
            ),
            Completeness::Incomplete { reason } => {
                tracing::warn!("Traffic capture is incomplete: {}", reason)
            }
        }

        Ok(FlushedCapture {
            log_path: self.log_path,
            window: CaptureWindow {
                start: self.started_at,
                stop: stop_at,
            },
            completeness,
            stats,
        })
    }
}

/// Append the stop record and sync the log. A log that cannot be sealed
/// leaves the capture incomplete rather than failing the run; the bundle
/// manifest then carries the window and the reason.
async fn seal(writer: Option<CaptureLogWriter>, shared: &Shared, stop_at: DateTime<Utc>) -> Completeness {
    let completeness = shared.completeness();
    let record = CaptureRecord::Stop {
        at: stop_at,
        complete: completeness.is_complete(),
        reason: completeness.reason().map(str::to_string),
        out_of_window: shared.stats.lock().out_of_window,
    };

    let sealed = match writer {
        Some(mut writer) => match writer.append(&record).await {
            Ok(()) => writer.flush_durable().await,
            Err(e) => Err(e),
        },
        None => Err(CaptureError::Recorder("capture log could not be reopened".to_string())),
    };

    match sealed {
        Ok(()) => completeness,
        Err(e) => {
            tracing::error!("Could not seal capture log: {}", e);
            shared.fail(format!("capture log could not be sealed: {}", e));
            shared.completeness()
        }
    }
}

/// A capture whose log is fully written and synced. Evidence collection
/// requires one.
#[derive(Debug, Clone)]
pub struct FlushedCapture {
    log_path: PathBuf,
    window: CaptureWindow,
    completeness: Completeness,
    stats: CaptureStats,
}

impl FlushedCapture {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn window(&self) -> CaptureWindow {
        self.window
    }

    pub fn completeness(&self) -> &Completeness {
        &self.completeness
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(at.nanosecond() / 1_000 * 1_000).unwrap_or(at)
}

async fn record(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    mut writer: CaptureLogWriter,
    mut parser: TcpdumpParser,
    started_at: DateTime<Utc>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> CaptureLogWriter {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let next = tokio::select! {
            biased;
            next = lines.next() => next,
            _ = cancel.cancelled() => {
                shared.fail("capture recorder cancelled before draining");
                break;
            }
        };

        let result = match next {
            Some(Ok(line)) => handle_line(&line, &mut parser, &mut writer, started_at, &shared).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                shared.stats.lock().unparsed += 1;
                writer
                    .append(&CaptureRecord::Unparsed {
                        at: Utc::now(),
                        line: format!("<line longer than {} bytes>", MAX_LINE_LENGTH),
                    })
                    .await
            }
            Some(Err(LinesCodecError::Io(e))) => {
                shared.fail(format!("capture stream error: {}", e));
                break;
            }
            None => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    tracing::error!("Capture source exited before the build finished");
                    shared.fail("capture source exited before the build finished");
                }
                break;
            }
        };

        if let Err(e) = result {
            shared.fail(format!("capture log write failed: {}", e));
            return writer;
        }
    }

    for event in parser.finish() {
        if let Err(e) = append_event(event, &mut writer, started_at, &shared).await {
            shared.fail(format!("capture log write failed: {}", e));
            break;
        }
    }

    writer
}

async fn handle_line(
    line: &str,
    parser: &mut TcpdumpParser,
    writer: &mut CaptureLogWriter,
    started_at: DateTime<Utc>,
    shared: &Shared,
) -> Result<(), CaptureError> {
    match parser.parse_line(line) {
        ParseOutcome::Events(events) => {
            for event in events {
                append_event(event, writer, started_at, shared).await?;
            }
            Ok(())
        }
        ParseOutcome::Ignored => Ok(()),
        ParseOutcome::Unparsed => {
            tracing::debug!("Unparsed capture line: {}", line);
            shared.stats.lock().unparsed += 1;
            writer
                .append(&CaptureRecord::Unparsed {
                    at: Utc::now(),
                    line: line.to_string(),
                })
                .await
        }
    }
}

async fn append_event(
    event: crate::capture::NetworkEvent,
    writer: &mut CaptureLogWriter,
    started_at: DateTime<Utc>,
    shared: &Shared,
) -> Result<(), CaptureError> {
    let stop_at = *shared.stop_at.lock();
    let in_window =
        event.timestamp >= started_at && stop_at.map(|stop| event.timestamp <= stop).unwrap_or(true);
    if !in_window {
        tracing::debug!(
            "Dropping event outside the capture window: {} at {}",
            event.host,
            event.timestamp
        );
        shared.stats.lock().out_of_window += 1;
        return Ok(());
    }

    shared.stats.lock().events += 1;
    writer.append(&CaptureRecord::Event(event)).await
}
