//! Driving-simulator dataset ingestion.
//!
//! A simulator streams frames over TCP: three length-prefixed camera images
//! (center, left, right) followed by one `steer,throttle,brake` text line.
//! Each complete frame is persisted as three image files plus one row in an
//! append-only CSV log, in the layout behavioral-cloning trainers expect.
//!
//! # Module Structure
//!
//! - `protocol`: wire decoding (frame blobs, image validation, control lines)
//! - `session`: per-connection state machine and the [`FrameSink`] seam
//! - `dataset`: persistence writer and read-only audit of a produced dataset
//! - `server`: single-active-session connection acceptor
//! - `config`: file + environment configuration for `ingestd`
//! - `preview`: bounded, lossy tap for live display consumers
//! - `error`: error taxonomy shared by all of the above

pub mod config;
pub mod dataset;
pub mod error;
pub mod preview;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{BusyPolicy, IngestdConfig};
pub use dataset::{audit, AuditReport, DatasetWriter, FrameRecord, LogRow, LOG_HEADER};
pub use error::{FrameContext, IngestError};
pub use preview::{PreviewFrame, PreviewTap};
pub use protocol::{Channel, ControlVector, DecodedImage, FrameTriplet, RawFrameBlob};
pub use server::{IngestServer, ServerHandle, ServerSummary};
pub use session::{FrameSink, Session, SessionLimits, SessionOutcome, SessionReport};
