//! Control record decoder: one newline-terminated `steer,throttle,brake` line.
//!
//! A malformed line never ends a session. It decodes to
//! [`ControlVector::NEUTRAL`] and the failure is handed back for the caller to
//! log and count, so frame/record alignment is preserved at the cost of a
//! neutral-action label. A sender that stalls mid-line is different: the
//! stream position is lost, so that is a session-fatal error.

use std::fmt;
use std::io::{self, BufRead, ErrorKind, Read};

use crate::error::{FrameContext, FramePart, IngestError, Truncation};

/// Default ceiling on one control line, terminator included.
pub const DEFAULT_MAX_CONTROL_LINE_BYTES: usize = 256;

const FIELD_NAMES: [&str; 3] = ["steer", "throttle", "brake"];

/// Commanded vehicle action at a frame.
///
/// `steer` is nominally in `[-1.0, 1.0]`; ranges are not enforced here.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlVector {
    pub steer: f32,
    pub throttle: f32,
    pub brake: f32,
}

impl ControlVector {
    pub const NEUTRAL: ControlVector = ControlVector {
        steer: 0.0,
        throttle: 0.0,
        brake: 0.0,
    };

    pub fn new(steer: f32, throttle: f32, brake: f32) -> Self {
        Self {
            steer,
            throttle,
            brake,
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }

    /// Parse one control line. Surrounding whitespace and a trailing
    /// `\r\n`/`\n` are ignored.
    pub fn parse_line(line: &str) -> Result<Self, ControlParseFailure> {
        let line = line.trim();
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != FIELD_NAMES.len() {
            return Err(ControlParseFailure::FieldCount {
                found: fields.len(),
                line: line.to_string(),
            });
        }
        let mut values = [0f32; 3];
        for ((value, token), field) in values.iter_mut().zip(&fields).zip(FIELD_NAMES) {
            *value = token
                .parse::<f32>()
                .map_err(|_| ControlParseFailure::NotNumeric {
                    field,
                    token: token.to_string(),
                })?;
        }
        Ok(Self::new(values[0], values[1], values[2]))
    }

    /// The line a simulator sends for this vector.
    pub fn to_wire_line(&self) -> String {
        format!("{},{},{}\n", self.steer, self.throttle, self.brake)
    }
}

/// Why a control line fell back to the neutral vector.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlParseFailure {
    FieldCount { found: usize, line: String },
    NotNumeric { field: &'static str, token: String },
    NotUtf8,
    /// Connection closed before the terminator.
    Unterminated { received: usize },
    LineTooLong { limit: usize },
}

impl fmt::Display for ControlParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlParseFailure::FieldCount { found, line } => {
                write!(f, "expected 3 fields, found {} in {:?}", found, line)
            }
            ControlParseFailure::NotNumeric { field, token } => {
                write!(f, "field {} is not numeric: {:?}", field, token)
            }
            ControlParseFailure::NotUtf8 => write!(f, "line is not valid UTF-8"),
            ControlParseFailure::Unterminated { received } => write!(
                f,
                "connection closed after {} bytes without a line terminator",
                received
            ),
            ControlParseFailure::LineTooLong { limit } => {
                write!(f, "line exceeds {} bytes", limit)
            }
        }
    }
}

/// Outcome of reading one control line. Always carries a usable vector.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlRecord {
    pub control: ControlVector,
    pub failure: Option<ControlParseFailure>,
}

impl ControlRecord {
    fn parsed(control: ControlVector) -> Self {
        Self {
            control,
            failure: None,
        }
    }

    fn neutral(failure: ControlParseFailure) -> Self {
        Self {
            control: ControlVector::NEUTRAL,
            failure: Some(failure),
        }
    }
}

/// Read bytes up to and including the next `\n` and parse them.
///
/// Bytes after the terminator stay in `reader`. A line longer than
/// `max_line_bytes` is discarded through its terminator so the next frame's
/// length prefix is still found at the right offset.
///
/// Content problems and a close before the terminator yield a neutral
/// record. A read timeout or socket error yields `Err`.
pub fn read_control_record<R: BufRead>(
    reader: &mut R,
    context: FrameContext,
    max_line_bytes: usize,
) -> Result<ControlRecord, IngestError> {
    let mut line = Vec::with_capacity(64);
    let limit = max_line_bytes as u64;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut line);
    if let Err(e) = read {
        return Err(read_error(context, line.len(), max_line_bytes, e));
    }

    if line.last() != Some(&b'\n') {
        if line.len() as u64 == limit {
            skip_through_newline(reader)
                .map_err(|e| read_error(context, line.len(), max_line_bytes, e))?;
            return Ok(ControlRecord::neutral(ControlParseFailure::LineTooLong {
                limit: max_line_bytes,
            }));
        }
        return Ok(ControlRecord::neutral(ControlParseFailure::Unterminated {
            received: line.len(),
        }));
    }

    let Ok(text) = std::str::from_utf8(&line) else {
        return Ok(ControlRecord::neutral(ControlParseFailure::NotUtf8));
    };
    Ok(match ControlVector::parse_line(text) {
        Ok(control) => ControlRecord::parsed(control),
        Err(failure) => ControlRecord::neutral(failure),
    })
}

fn read_error(
    context: FrameContext,
    received: usize,
    max_line_bytes: usize,
    err: io::Error,
) -> IngestError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => IngestError::TruncatedFrame {
            context,
            channel: None,
            part: FramePart::ControlLine,
            received,
            expected: max_line_bytes,
            cause: Truncation::TimedOut,
        },
        _ => IngestError::Io {
            context,
            channel: None,
            source: err,
        },
    }
}

fn skip_through_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let (done, used) = {
            let available = match reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}
