//! Live preview tap.
//!
//! Committed center images can be offered to an optional subscriber (a
//! viewer, a health logger). Offering never blocks: when the subscriber lags
//! behind the frame is dropped, and once it hangs up the tap goes quiet.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::time::Instant;

use image::DynamicImage;

#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub session: u64,
    pub frame_id: u64,
    pub image: DynamicImage,
    /// Instantaneous commit rate at this frame.
    pub fps: f32,
}

/// Frames-per-second from the gap between consecutive ticks.
#[derive(Debug, Default)]
pub struct FpsMeter {
    last: Option<Instant>,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at `now`. Returns 0 for the first frame or a zero gap.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let fps = match self.last {
            Some(last) => {
                let gap = now.saturating_duration_since(last).as_secs_f32();
                if gap > 0.0 {
                    1.0 / gap
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some(now);
        fps
    }

    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub struct PreviewTap {
    tx: SyncSender<PreviewFrame>,
    fps: FpsMeter,
    dropped: u64,
    closed: bool,
}

impl PreviewTap {
    /// A tap and its receiving end, buffering at most `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, Receiver<PreviewFrame>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (
            Self {
                tx,
                fps: FpsMeter::new(),
                dropped: 0,
                closed: false,
            },
            rx,
        )
    }

    /// Offer a committed frame without blocking.
    pub fn offer(&mut self, session: u64, frame_id: u64, image: &DynamicImage) {
        let fps = self.fps.tick();
        if self.closed {
            return;
        }
        let frame = PreviewFrame {
            session,
            frame_id,
            image: image.clone(),
            fps,
        };
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped += 1,
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("preview subscriber disconnected; preview disabled");
                self.closed = true;
            }
        }
    }

    /// Called at session start so the rate does not span two sessions.
    pub fn begin_session(&mut self) {
        self.fps.reset();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
