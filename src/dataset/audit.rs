//! Read-only audit of a produced dataset.
//!
//! Checks that every logged row references images that exist and decode, and
//! that frame ids advance without gaps inside each session. It never filters
//! or rewrites anything.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

use super::{frame_id_from_file_name, parse_log_row, LOG_HEADER};
use crate::protocol::ControlVector;

#[derive(Clone, Debug, PartialEq)]
pub struct LogRow {
    /// 1-based line number in the log file.
    pub line: usize,
    pub files: [String; 3],
    pub control: ControlVector,
}

#[derive(Debug, Default)]
pub struct LogContents {
    pub rows: Vec<LogRow>,
    /// (line, reason) for rows that could not be parsed.
    pub malformed: Vec<(usize, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageProblem {
    pub line: usize,
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub rows: usize,
    pub neutral_rows: usize,
    /// Number of runs of frame ids starting at 0.
    pub sessions: usize,
    pub malformed: Vec<(usize, String)>,
    pub image_problems: Vec<ImageProblem>,
    /// (line, expected frame id, found frame id)
    pub sequence_gaps: Vec<(usize, u64, u64)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.malformed.is_empty() && self.image_problems.is_empty() && self.sequence_gaps.is_empty()
    }

    pub fn broken_rows(&self) -> usize {
        let mut lines: Vec<usize> = self
            .malformed
            .iter()
            .map(|(line, _)| *line)
            .chain(self.image_problems.iter().map(|p| p.line))
            .collect();
        lines.sort_unstable();
        lines.dedup();
        lines.len()
    }
}

pub fn read_log(path: &Path) -> Result<LogContents> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read log {}", path.display()))?;
    let mut lines = raw.lines().enumerate();
    let header = match lines.next() {
        Some((_, header)) => header.trim_end_matches('\r'),
        None => return Err(anyhow!("log {} is empty (no header)", path.display())),
    };
    if header != LOG_HEADER.join(",") {
        return Err(anyhow!(
            "log {} has unexpected header {:?}",
            path.display(),
            header
        ));
    }

    let mut contents = LogContents::default();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        match parse_log_row(line) {
            Ok((files, control)) => contents.rows.push(LogRow {
                line: line_no,
                files,
                control,
            }),
            Err(e) => contents.malformed.push((line_no, e.to_string())),
        }
    }
    Ok(contents)
}

pub fn audit(image_dir: &Path, log_path: &Path) -> Result<AuditReport> {
    let contents = read_log(log_path)?;
    let mut report = AuditReport {
        rows: contents.rows.len(),
        malformed: contents.malformed,
        ..AuditReport::default()
    };

    let mut expected_next: Option<u64> = None;
    for row in &contents.rows {
        if row.control.is_neutral() {
            report.neutral_rows += 1;
        }

        match frame_id_from_file_name(&row.files[0]) {
            Some(0) => {
                report.sessions += 1;
                expected_next = Some(1);
            }
            Some(id) => {
                if let Some(expected) = expected_next {
                    if id != expected {
                        report.sequence_gaps.push((row.line, expected, id));
                    }
                }
                expected_next = Some(id + 1);
            }
            None => {}
        }

        for file in &row.files {
            if let Some(reason) = check_image(&image_dir.join(file)) {
                report.image_problems.push(ImageProblem {
                    line: row.line,
                    file: file.clone(),
                    reason,
                });
            }
        }
    }
    Ok(report)
}

fn check_image(path: &Path) -> Option<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return Some(format!("unreadable: {}", e)),
    };
    match image::load_from_memory(&bytes) {
        Ok(_) => None,
        Err(e) => Some(format!("undecodable: {}", e)),
    }
}
