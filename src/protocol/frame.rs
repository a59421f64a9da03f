//! Frame channel decoder: one length-prefixed image blob per call.

use std::io::{ErrorKind, Read};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use super::{Channel, DecodedImage, RawFrameBlob};
use crate::error::{FrameContext, FramePart, IngestError, Truncation};

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default ceiling on a declared payload length (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Quality used when a non-JPEG payload is re-encoded for storage.
pub const REENCODE_JPEG_QUALITY: u8 = 95;

#[derive(Debug)]
pub enum FrameRead {
    Blob(RawFrameBlob),
    /// The peer closed cleanly before sending any byte of the length prefix.
    StreamEnded,
}

/// Read one `[u32 LE length][payload]` blob for `channel`.
///
/// Blocks until the whole payload has arrived. A short read of either part
/// is reported as [`IngestError::TruncatedFrame`]; a read timeout is treated
/// the same way because frame boundaries can no longer be trusted.
pub fn read_frame_blob<R: Read>(
    reader: &mut R,
    channel: Channel,
    context: FrameContext,
    max_frame_bytes: usize,
) -> Result<FrameRead, IngestError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let got = read_full(reader, &mut prefix)
        .map_err(|(filled, err)| {
            read_error(context, channel, FramePart::LengthPrefix, filled, LENGTH_PREFIX_BYTES, err)
        })?;
    if got == 0 {
        return Ok(FrameRead::StreamEnded);
    }
    if got < LENGTH_PREFIX_BYTES {
        return Err(IngestError::TruncatedFrame {
            context,
            channel: Some(channel),
            part: FramePart::LengthPrefix,
            received: got,
            expected: LENGTH_PREFIX_BYTES,
            cause: Truncation::Closed,
        });
    }

    let declared = u32::from_le_bytes(prefix);
    let len = declared as usize;
    if len > max_frame_bytes {
        return Err(IngestError::OversizedFrame {
            context,
            channel,
            declared,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload)
        .map_err(|(filled, err)| read_error(context, channel, FramePart::Payload, filled, len, err))?;
    if got < len {
        return Err(IngestError::TruncatedFrame {
            context,
            channel: Some(channel),
            part: FramePart::Payload,
            received: got,
            expected: len,
            cause: Truncation::Closed,
        });
    }

    Ok(FrameRead::Blob(RawFrameBlob {
        channel,
        declared_len: declared,
        payload,
    }))
}

/// Decode a fully received blob into an image.
///
/// JPEG payloads are kept byte for byte. Any other decodable format is
/// re-encoded as JPEG so every stored image has the same format.
pub fn decode_image(blob: RawFrameBlob, context: FrameContext) -> Result<DecodedImage, IngestError> {
    let corrupt = |reason: String| IngestError::CorruptImage {
        context,
        channel: blob.channel,
        reason,
    };
    if blob.payload.is_empty() {
        return Err(corrupt("empty payload".to_string()));
    }
    let format = image::guess_format(&blob.payload)
        .map_err(|e| corrupt(format!("unrecognized image format: {}", e)))?;
    let image = image::load_from_memory_with_format(&blob.payload, format)
        .map_err(|e| corrupt(format!("decode {:?}: {}", format, e)))?;
    let bytes = if format == ImageFormat::Jpeg {
        blob.payload
    } else {
        encode_jpeg(&image).map_err(|e| corrupt(format!("re-encode {:?} as JPEG: {}", format, e)))?
    };
    Ok(DecodedImage::new(blob.channel, format, image, bytes))
}

fn encode_jpeg(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    // The JPEG encoder takes no alpha channel or 16-bit samples.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, REENCODE_JPEG_QUALITY))?;
    Ok(out)
}

/// Fill `buf` until it is full or the reader reports EOF.
///
/// Returns the number of bytes read. On error, also returns how many bytes
/// had been read before it.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, (usize, std::io::Error)> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err((filled, e)),
        }
    }
    Ok(filled)
}

fn read_error(
    context: FrameContext,
    channel: Channel,
    part: FramePart,
    received: usize,
    expected: usize,
    err: std::io::Error,
) -> IngestError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => IngestError::TruncatedFrame {
            context,
            channel: Some(channel),
            part,
            received,
            expected,
            cause: Truncation::TimedOut,
        },
        ErrorKind::UnexpectedEof => IngestError::TruncatedFrame {
            context,
            channel: Some(channel),
            part,
            received,
            expected,
            cause: Truncation::Closed,
        },
        _ => IngestError::Io {
            context,
            channel: Some(channel),
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_support::{corrupt_jpeg, framed, jpeg_bytes, png_bytes};
    use std::io::Cursor;

    const CTX: FrameContext = FrameContext::Frame(0);

    struct StallingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::new(ErrorKind::WouldBlock, "stalled")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn clean_eof_before_prefix_ends_stream() {
        let mut reader = Cursor::new(Vec::new());
        let read = read_frame_blob(&mut reader, Channel::Center, CTX, DEFAULT_MAX_FRAME_BYTES)
            .expect("clean end");
        assert!(matches!(read, FrameRead::StreamEnded));
    }

    #[test]
    fn partial_prefix_is_truncated() {
        let mut reader = Cursor::new(vec![0x10, 0x00]);
        let err = read_frame_blob(&mut reader, Channel::Center, CTX, DEFAULT_MAX_FRAME_BYTES)
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::TruncatedFrame {
                part: FramePart::LengthPrefix,
                received: 2,
                expected: 4,
                ..
            }
        ));
    }

    #[test]
    fn short_payload_is_truncated_not_short_blob() {
        let mut bytes = 100u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB; 40]);
        let mut reader = Cursor::new(bytes);
        let err = read_frame_blob(&mut reader, Channel::Left, CTX, DEFAULT_MAX_FRAME_BYTES)
            .unwrap_err();
        match err {
            IngestError::TruncatedFrame {
                channel,
                part,
                received,
                expected,
                cause,
                ..
            } => {
                assert_eq!(channel, Some(Channel::Left));
                assert_eq!(part, FramePart::Payload);
                assert_eq!(received, 40);
                assert_eq!(expected, 100);
                assert_eq!(cause, Truncation::Closed);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn prefix_only_then_close_is_truncated() {
        let mut reader = Cursor::new(100u32.to_le_bytes().to_vec());
        let err = read_frame_blob(&mut reader, Channel::Center, CTX, DEFAULT_MAX_FRAME_BYTES)
            .unwrap_err();
        assert_eq!(err.code(), "TRUNCATED_FRAME");
    }

    #[test]
    fn stalled_read_counts_as_truncation() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut reader = StallingReader {
            data: Cursor::new(bytes),
        };
        let err = read_frame_blob(&mut reader, Channel::Right, CTX, DEFAULT_MAX_FRAME_BYTES)
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::TruncatedFrame {
                received: 3,
                cause: Truncation::TimedOut,
                ..
            }
        ));
    }

    #[test]
    fn oversized_declaration_is_rejected_before_allocation() {
        let mut reader = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        let err = read_frame_blob(&mut reader, Channel::Center, CTX, 1024).unwrap_err();
        assert!(matches!(err, IngestError::OversizedFrame { limit: 1024, .. }));
    }

    #[test]
    fn blob_is_exact_and_leaves_following_bytes() {
        let payload = jpeg_bytes(3);
        let mut bytes = framed(&payload);
        bytes.extend_from_slice(b"next");
        let mut reader = Cursor::new(bytes);
        let FrameRead::Blob(blob) =
            read_frame_blob(&mut reader, Channel::Center, CTX, DEFAULT_MAX_FRAME_BYTES).unwrap()
        else {
            panic!("expected blob");
        };
        assert_eq!(blob.declared_len as usize, payload.len());
        assert_eq!(blob.payload, payload);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "next");
    }

    #[test]
    fn jpeg_payload_decodes() {
        let payload = jpeg_bytes(9);
        let blob = RawFrameBlob {
            channel: Channel::Center,
            declared_len: payload.len() as u32,
            payload,
        };
        let image = decode_image(blob, CTX).expect("decode");
        assert!(image.is_passthrough());
        assert_eq!(image.bytes(), jpeg_bytes(9).as_slice());
        assert_eq!((image.width(), image.height()), (16, 8));
    }

    #[test]
    fn png_payload_is_stored_as_jpeg() {
        let payload = png_bytes(9);
        let blob = RawFrameBlob {
            channel: Channel::Center,
            declared_len: payload.len() as u32,
            payload,
        };
        let image = decode_image(blob, CTX).expect("decode");
        assert_eq!(image.format(), ImageFormat::Png);
        assert!(!image.is_passthrough());
        assert_eq!(image::guess_format(image.bytes()).unwrap(), ImageFormat::Jpeg);
        let stored = image::load_from_memory(image.bytes()).unwrap();
        assert_eq!((stored.width(), stored.height()), (16, 8));
    }

    #[test]
    fn corrupt_payload_is_corrupt_image() {
        let payload = corrupt_jpeg();
        let blob = RawFrameBlob {
            channel: Channel::Left,
            declared_len: payload.len() as u32,
            payload,
        };
        let err = decode_image(blob, FrameContext::Frame(4)).unwrap_err();
        assert!(matches!(
            err,
            IngestError::CorruptImage {
                channel: Channel::Left,
                context: FrameContext::Frame(4),
                ..
            }
        ));
    }

    #[test]
    fn garbage_payload_is_corrupt_image() {
        let blob = RawFrameBlob {
            channel: Channel::Right,
            declared_len: 5,
            payload: b"hello".to_vec(),
        };
        assert_eq!(decode_image(blob, CTX).unwrap_err().code(), "CORRUPT_IMAGE");
    }
}
