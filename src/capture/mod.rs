//! Network traffic capture: event model, capture log, parser and recorder.

pub mod event;
pub mod log;
pub mod parser;
pub mod recorder;
pub mod tcpdump;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::CaptureError;

pub use event::{NetworkEvent, Protocol};
pub use log::{CaptureLog, CaptureLogWriter, CaptureRecord, MalformedLine, CAPTURE_LOG_FILE};
pub use parser::{ParseOutcome, TcpdumpParser};
pub use recorder::{
    ActiveCapture, CaptureStats, CaptureWindow, Completeness, FlushedCapture, TrafficCapture,
    DEFAULT_DRAIN_TIMEOUT,
};
pub use tcpdump::TcpdumpSource;

/// A producer of raw capture lines in tcpdump text format.
#[async_trait]
pub trait PacketSource: Send {
    /// Start capturing. Must not return until the source is actually recording.
    async fn open(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError>;

    /// Stop capturing. The reader returned by `open` reaches EOF once every
    /// buffered line has been delivered.
    async fn close(&mut self) -> Result<(), CaptureError>;
}
