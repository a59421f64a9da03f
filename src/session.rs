//! Session protocol engine.
//!
//! One session per accepted connection. Each frame attempt reads the three
//! channel blobs in wire order, then the control line, then commits through a
//! [`FrameSink`]. Processing is strictly sequential: a frame is fully
//! persisted before the next length prefix is read.
//!
//! Frame ids start at 0 and advance only on a successful commit, so the ids a
//! session commits are exactly `0..N`.

use std::fmt;
use std::io::{BufReader, Read};
use std::time::{Duration, Instant};

use crate::dataset::FrameRecord;
use crate::error::{FrameContext, IngestError};
use crate::preview::PreviewTap;
use crate::protocol::control::DEFAULT_MAX_CONTROL_LINE_BYTES;
use crate::protocol::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::protocol::{
    decode_image, read_control_record, read_frame_blob, Channel, ControlVector, FrameRead,
    FrameTriplet, RawFrameBlob,
};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Destination of committed frames.
pub trait FrameSink {
    /// Called once before the first frame of a session.
    fn begin_session(&mut self, _session: u64) -> Result<(), IngestError> {
        Ok(())
    }

    fn commit(
        &mut self,
        frame_id: u64,
        images: &FrameTriplet,
        control: ControlVector,
    ) -> Result<FrameRecord, IngestError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_frame_bytes: usize,
    pub max_control_line_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_control_line_bytes: DEFAULT_MAX_CONTROL_LINE_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitFrames,
    AwaitControl,
    Commit,
    Ended,
    Failed,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// Peer closed cleanly at a channel boundary.
    Ended,
    Failed(IngestError),
}

impl SessionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, SessionOutcome::Ended)
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            SessionOutcome::Ended => None,
            SessionOutcome::Failed(err) => Some(err),
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub session: u64,
    pub peer: String,
    pub outcome: SessionOutcome,
    pub frames_committed: u64,
    pub corrupt_frames: u64,
    pub control_parse_errors: u64,
    pub elapsed: Duration,
}

impl SessionReport {
    /// Mean commit rate over the session.
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_committed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.outcome {
            SessionOutcome::Ended => "ended".to_string(),
            SessionOutcome::Failed(err) => format!("failed ({})", err),
        };
        write!(
            f,
            "session {} from {} {}: committed={} corrupt={} control_errors={} fps={:.1}",
            self.session,
            self.peer,
            outcome,
            self.frames_committed,
            self.corrupt_frames,
            self.control_parse_errors,
            self.frames_per_second()
        )
    }
}

enum Attempt {
    Committed(u64),
    Skipped,
    Ended,
}

pub struct Session {
    number: u64,
    peer: String,
    limits: SessionLimits,
    state: SessionState,
    next_frame_id: u64,
    corrupt_frames: u64,
    control_parse_errors: u64,
    preview: Option<PreviewTap>,
}

impl Session {
    pub fn new(number: u64, peer: impl Into<String>, limits: SessionLimits) -> Self {
        Self {
            number,
            peer: peer.into(),
            limits,
            state: SessionState::AwaitFrames,
            next_frame_id: 0,
            corrupt_frames: 0,
            control_parse_errors: 0,
            preview: None,
        }
    }

    pub fn with_preview(mut self, preview: Option<PreviewTap>) -> Self {
        self.preview = preview;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Give the preview tap back once the session is over.
    pub fn take_preview(&mut self) -> Option<PreviewTap> {
        self.preview.take()
    }

    /// Drive the session until the stream ends or fails.
    pub fn run<R: Read, S: FrameSink>(&mut self, stream: R, sink: &mut S) -> SessionReport {
        let started = Instant::now();
        log::info!("session {} started: peer {}", self.number, self.peer);
        if let Some(preview) = self.preview.as_mut() {
            preview.begin_session();
        }

        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, stream);
        let outcome = match sink.begin_session(self.number) {
            Ok(()) => self.run_frames(&mut reader, sink),
            Err(err) => SessionOutcome::Failed(err),
        };
        self.state = match &outcome {
            SessionOutcome::Ended => SessionState::Ended,
            SessionOutcome::Failed(_) => SessionState::Failed,
        };

        let report = SessionReport {
            session: self.number,
            peer: self.peer.clone(),
            outcome,
            frames_committed: self.next_frame_id,
            corrupt_frames: self.corrupt_frames,
            control_parse_errors: self.control_parse_errors,
            elapsed: started.elapsed(),
        };
        match &report.outcome {
            SessionOutcome::Ended => log::info!("{}", report),
            SessionOutcome::Failed(_) => log::error!("{}", report),
        }
        if let Some(preview) = &self.preview {
            if preview.is_closed() {
                log::debug!("session {}: preview subscriber gone", self.number);
            } else if preview.dropped() > 0 {
                log::debug!(
                    "session {}: preview dropped {} frame(s) so far",
                    self.number,
                    preview.dropped()
                );
            }
        }
        report
    }

    fn run_frames<R: Read, S: FrameSink>(
        &mut self,
        reader: &mut BufReader<R>,
        sink: &mut S,
    ) -> SessionOutcome {
        loop {
            match self.next_frame(reader, sink) {
                Ok(Attempt::Committed(frame_id)) => {
                    log::debug!("session {}: committed frame {}", self.number, frame_id);
                }
                Ok(Attempt::Skipped) => {}
                Ok(Attempt::Ended) => return SessionOutcome::Ended,
                Err(err) => return SessionOutcome::Failed(err),
            }
        }
    }

    fn next_frame<R: Read, S: FrameSink>(
        &mut self,
        reader: &mut BufReader<R>,
        sink: &mut S,
    ) -> Result<Attempt, IngestError> {
        let frame_id = self.next_frame_id;
        let context = if frame_id == 0 {
            FrameContext::BeforeFirstFrame
        } else {
            FrameContext::Frame(frame_id)
        };

        self.state = SessionState::AwaitFrames;
        let Some(blobs) = self.read_blobs(reader, context)? else {
            return Ok(Attempt::Ended);
        };

        let mut decoded = Vec::with_capacity(3);
        let mut corrupt = false;
        for blob in blobs {
            match decode_image(blob, context) {
                Ok(image) => decoded.push(image),
                Err(err) if !err.is_session_fatal() => {
                    log::warn!("session {}: {}", self.number, err);
                    corrupt = true;
                }
                Err(err) => return Err(err),
            }
        }

        // The control line is consumed even for a corrupt frame to stay aligned.
        self.state = SessionState::AwaitControl;
        let record = read_control_record(reader, context, self.limits.max_control_line_bytes)?;
        if let Some(failure) = record.failure {
            self.control_parse_errors += 1;
            let err = IngestError::ControlParse { context, failure };
            log::warn!("session {}: {} (using neutral control)", self.number, err);
        }

        if corrupt {
            self.corrupt_frames += 1;
            log::warn!(
                "session {}: {} not persisted ({} corrupt frame attempts so far)",
                self.number,
                context,
                self.corrupt_frames
            );
            return Ok(Attempt::Skipped);
        }

        let mut decoded = decoded.into_iter();
        let (Some(center), Some(left), Some(right)) =
            (decoded.next(), decoded.next(), decoded.next())
        else {
            return Ok(Attempt::Skipped);
        };
        let triplet = FrameTriplet {
            center,
            left,
            right,
        };

        self.state = SessionState::Commit;
        sink.commit(frame_id, &triplet, record.control)?;
        self.next_frame_id += 1;

        if let Some(preview) = self.preview.as_mut() {
            preview.offer(self.number, frame_id, triplet.center.image());
        }
        Ok(Attempt::Committed(frame_id))
    }

    /// Read center, left and right. `None` when the peer closed cleanly at a
    /// channel boundary; a partial triplet is dropped.
    fn read_blobs<R: Read>(
        &self,
        reader: &mut BufReader<R>,
        context: FrameContext,
    ) -> Result<Option<Vec<RawFrameBlob>>, IngestError> {
        let mut blobs = Vec::with_capacity(3);
        for channel in Channel::ORDER {
            match read_frame_blob(reader, channel, context, self.limits.max_frame_bytes)? {
                FrameRead::Blob(blob) => blobs.push(blob),
                FrameRead::StreamEnded => {
                    if !blobs.is_empty() {
                        log::warn!(
                            "session {}: stream ended before channel {} of {}; dropping {} received channel(s)",
                            self.number,
                            channel,
                            context,
                            blobs.len()
                        );
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(blobs))
    }
}
