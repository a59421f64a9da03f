//! Simulator wire protocol.
//!
//! Per frame the simulator sends, in this fixed order:
//! - `center`, `left`, `right`: each `[u32 LE length L][L bytes encoded image]`
//! - one ASCII control line `"<steer>,<throttle>,<brake>\n"`
//!
//! EOF before a length prefix is a clean end of stream.
//!
//! The frame and control decoders share one buffered reader so that bytes
//! buffered past a control line terminator are handed to the next length
//! prefix read unchanged.

pub mod control;
pub mod frame;

use std::fmt;

use image::{DynamicImage, ImageFormat};

pub use control::{read_control_record, ControlParseFailure, ControlRecord, ControlVector};
pub use frame::{decode_image, read_frame_blob, FrameRead};

/// One of the three camera viewpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Center,
    Left,
    Right,
}

impl Channel {
    /// Wire order. The simulator must send channels in exactly this order.
    pub const ORDER: [Channel; 3] = [Channel::Center, Channel::Left, Channel::Right];

    pub fn label(self) -> &'static str {
        match self {
            Channel::Center => "center",
            Channel::Left => "left",
            Channel::Right => "right",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Encoded image bytes exactly as received for one channel.
///
/// The decoder only ever builds a blob whose payload length equals the
/// declared length.
#[derive(Debug)]
pub struct RawFrameBlob {
    pub channel: Channel,
    pub declared_len: u32,
    pub payload: Vec<u8>,
}

/// A blob that decoded successfully.
///
/// `bytes` is always a JPEG stream: the payload itself when the simulator
/// sent JPEG, otherwise a re-encoding of the decoded pixels.
pub struct DecodedImage {
    channel: Channel,
    format: ImageFormat,
    image: DynamicImage,
    bytes: Vec<u8>,
}

impl DecodedImage {
    pub(crate) fn new(
        channel: Channel,
        format: ImageFormat,
        image: DynamicImage,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            channel,
            format,
            image,
            bytes,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Format the payload arrived in.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when `bytes` is the payload exactly as received.
    pub fn is_passthrough(&self) -> bool {
        self.format == ImageFormat::Jpeg
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("channel", &self.channel)
            .field("format", &self.format)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Three decoded images of one frame, one per channel.
#[derive(Debug)]
pub struct FrameTriplet {
    pub center: DecodedImage,
    pub left: DecodedImage,
    pub right: DecodedImage,
}

impl FrameTriplet {
    /// Images in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &DecodedImage> {
        [&self.center, &self.left, &self.right].into_iter()
    }
}
