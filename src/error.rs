//! Ingestion error taxonomy.
//!
//! Every variant carries a stable audit code and the frame context it was
//! raised in, so a data-quality audit can line anomalies up with files on disk.
//! Clean end of stream is not an error and has no variant here; see
//! [`crate::protocol::FrameRead::StreamEnded`].

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::protocol::{Channel, ControlParseFailure};

/// Where in a session an error was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameContext {
    BeforeFirstFrame,
    Frame(u64),
}

impl fmt::Display for FrameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameContext::BeforeFirstFrame => write!(f, "before first frame"),
            FrameContext::Frame(id) => write!(f, "frame {}", id),
        }
    }
}

/// Which part of a length-prefixed frame was being read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePart {
    LengthPrefix,
    Payload,
    ControlLine,
}

impl fmt::Display for FramePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePart::LengthPrefix => write!(f, "length prefix"),
            FramePart::Payload => write!(f, "payload"),
            FramePart::ControlLine => write!(f, "control line"),
        }
    }
}

/// Why a frame stopped short.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truncation {
    Closed,
    TimedOut,
}

#[derive(Debug)]
pub enum IngestError {
    /// Connection closed or stalled mid length-prefix or mid-payload, or
    /// stalled mid control line. `channel` is `None` for the control line,
    /// where `expected` is the line ceiling.
    TruncatedFrame {
        context: FrameContext,
        channel: Option<Channel>,
        part: FramePart,
        received: usize,
        expected: usize,
        cause: Truncation,
    },
    /// Declared payload length above the configured ceiling.
    OversizedFrame {
        context: FrameContext,
        channel: Channel,
        declared: u32,
        limit: usize,
    },
    /// Payload fully received but not a decodable image.
    CorruptImage {
        context: FrameContext,
        channel: Channel,
        reason: String,
    },
    /// Control line missing or malformed; recovered with the neutral vector.
    ControlParse {
        context: FrameContext,
        failure: ControlParseFailure,
    },
    /// Image write or log append failed.
    Persistence {
        context: FrameContext,
        path: PathBuf,
        source: io::Error,
    },
    /// Any other socket error while reading a frame.
    Io {
        context: FrameContext,
        channel: Option<Channel>,
        source: io::Error,
    },
    /// Listening endpoint could not be established.
    Bind { addr: String, source: io::Error },
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::TruncatedFrame { .. } => "TRUNCATED_FRAME",
            IngestError::OversizedFrame { .. } => "OVERSIZED_FRAME",
            IngestError::CorruptImage { .. } => "CORRUPT_IMAGE",
            IngestError::ControlParse { .. } => "CONTROL_PARSE",
            IngestError::Persistence { .. } => "PERSISTENCE_FAILURE",
            IngestError::Io { .. } => "CONNECTION_IO",
            IngestError::Bind { .. } => "BIND_FAILURE",
        }
    }

    /// True when the error ends the session it was raised in.
    ///
    /// Sample-local errors (corrupt image, bad control line) are recovered and
    /// counted; bind failures never reach a session.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            IngestError::CorruptImage { .. } | IngestError::ControlParse { .. }
        )
    }

    pub fn context(&self) -> FrameContext {
        match self {
            IngestError::TruncatedFrame { context, .. }
            | IngestError::OversizedFrame { context, .. }
            | IngestError::CorruptImage { context, .. }
            | IngestError::ControlParse { context, .. }
            | IngestError::Persistence { context, .. }
            | IngestError::Io { context, .. } => *context,
            IngestError::Bind { .. } => FrameContext::BeforeFirstFrame,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.code())?;
        match self {
            IngestError::TruncatedFrame {
                context,
                channel,
                part,
                received,
                expected,
                cause,
            } => {
                let how = match cause {
                    Truncation::Closed => "connection closed",
                    Truncation::TimedOut => "read timed out",
                };
                match channel {
                    Some(channel) => write!(
                        f,
                        "{} channel {}: {} after {} of {} {} bytes",
                        context, channel, how, received, expected, part
                    ),
                    None => write!(
                        f,
                        "{} {}: {} after {} bytes without a terminator",
                        context, part, how, received
                    ),
                }
            }
            IngestError::OversizedFrame {
                context,
                channel,
                declared,
                limit,
            } => write!(
                f,
                "{} channel {}: declared length {} exceeds limit {}",
                context, channel, declared, limit
            ),
            IngestError::CorruptImage {
                context,
                channel,
                reason,
            } => write!(f, "{} channel {}: {}", context, channel, reason),
            IngestError::ControlParse { context, failure } => {
                write!(f, "{} control line: {}", context, failure)
            }
            IngestError::Persistence {
                context,
                path,
                source,
            } => write!(f, "{} writing {}: {}", context, path.display(), source),
            IngestError::Io {
                context,
                channel: Some(channel),
                source,
            } => write!(f, "{} channel {}: {}", context, channel, source),
            IngestError::Io {
                context,
                channel: None,
                source,
            } => write!(f, "{}: {}", context, source),
            IngestError::Bind { addr, source } => {
                write!(f, "cannot listen on {}: {}", addr, source)
            }
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Persistence { source, .. }
            | IngestError::Io { source, .. }
            | IngestError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}
