//! Correlated dataset on disk: an image directory plus an append-only CSV log.
//!
//! Log layout:
//!
//! ```text
//! center_frame,left_frame,right_frame,steer,throttle,brake
//! center_00000.jpg,left_00000.jpg,right_00000.jpg,0.5,1.0,0.0
//! ```
//!
//! A row is only appended after its three images are durable, so every row
//! points at files that exist.

pub mod audit;
pub mod writer;

use anyhow::{anyhow, Result};

use crate::protocol::{Channel, ControlVector};

pub use audit::{audit, read_log, AuditReport, LogContents, LogRow};
pub use writer::DatasetWriter;

pub const LOG_HEADER: [&str; 6] = [
    "center_frame",
    "left_frame",
    "right_frame",
    "steer",
    "throttle",
    "brake",
];

/// One committed frame. Never mutated after it is appended.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRecord {
    pub frame_id: u64,
    /// Paths relative to the image directory, in wire order.
    pub files: [String; 3],
    pub control: ControlVector,
}

impl FrameRecord {
    /// CSV row including the trailing newline.
    pub fn to_log_row(&self) -> String {
        format!(
            "{},{},{},{},{},{}\n",
            self.files[0],
            self.files[1],
            self.files[2],
            format_float(self.control.steer),
            format_float(self.control.throttle),
            format_float(self.control.brake),
        )
    }
}

/// Every stored image is JPEG.
pub const IMAGE_EXTENSION: &str = "jpg";

/// `{label}_{frame_id:05}.jpg`
pub fn image_file_name(channel: Channel, frame_id: u64) -> String {
    format!("{}_{:05}.{}", channel.label(), frame_id, IMAGE_EXTENSION)
}

/// Frame id encoded in an image file name, if it follows the naming scheme.
pub fn frame_id_from_file_name(name: &str) -> Option<u64> {
    let base = name.rsplit('/').next()?;
    let stem = base.split('.').next()?;
    let (_, digits) = stem.rsplit_once('_')?;
    digits.parse().ok()
}

pub fn header_line() -> String {
    format!("{}\n", LOG_HEADER.join(","))
}

/// Shortest decimal that parses back to the same `f32`, always with a
/// fractional part for finite whole numbers (`1.0`, not `1`).
pub fn format_float(value: f32) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// Parse a data row into its files and control vector.
pub fn parse_log_row(line: &str) -> Result<([String; 3], ControlVector)> {
    let fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split(',').collect();
    if fields.len() != LOG_HEADER.len() {
        return Err(anyhow!(
            "expected {} fields, found {}",
            LOG_HEADER.len(),
            fields.len()
        ));
    }
    let mut values = [0f32; 3];
    for (idx, value) in values.iter_mut().enumerate() {
        let token = fields[3 + idx];
        *value = token
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} is not numeric: {:?}", LOG_HEADER[3 + idx], token))?;
    }
    Ok((
        [
            fields[0].to_string(),
            fields[1].to_string(),
            fields[2].to_string(),
        ],
        ControlVector::new(values[0], values[1], values[2]),
    ))
}
