//! Persistence writer: the only owner of the image directory and the log.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{header_line, image_file_name, FrameRecord};
use crate::error::{FrameContext, IngestError};
use crate::protocol::{ControlVector, FrameTriplet};
use crate::session::FrameSink;

const WRITE_CHECK_FILE: &str = ".ingest_write_check";

pub struct DatasetWriter {
    image_dir: PathBuf,
    log_path: PathBuf,
    log: File,
    session_subdirs: bool,
    session_dir: Option<String>,
    rows_appended: u64,
    /// Set when a failed append could not be rolled back; refuses all commits.
    poisoned: bool,
}

impl DatasetWriter {
    /// Create the image directory and log file if needed.
    ///
    /// The header row is written only when the log is empty, so reopening an
    /// existing dataset never duplicates it. Fails when the image directory is
    /// not writable.
    pub fn open(image_dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Result<Self> {
        let image_dir = image_dir.into();
        let log_path = log_path.into();

        fs::create_dir_all(&image_dir)
            .with_context(|| format!("create image directory {}", image_dir.display()))?;
        check_writable(&image_dir)?;

        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open log {}", log_path.display()))?;
        let existing = file
            .metadata()
            .with_context(|| format!("stat log {}", log_path.display()))?
            .len();
        let mut log = file;
        if existing == 0 {
            log.write_all(header_line().as_bytes())
                .and_then(|_| log.sync_data())
                .with_context(|| format!("write log header to {}", log_path.display()))?;
            log::info!("created dataset log {}", log_path.display());
        } else {
            log::info!(
                "appending to existing dataset log {} ({} bytes)",
                log_path.display(),
                existing
            );
        }

        Ok(Self {
            image_dir,
            log_path,
            log,
            session_subdirs: false,
            session_dir: None,
            rows_appended: 0,
            poisoned: false,
        })
    }

    /// Store each session's images under `session_NNN/`.
    pub fn with_session_subdirs(mut self, enabled: bool) -> Self {
        self.session_subdirs = enabled;
        self
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Rows appended by this writer since it was opened.
    pub fn rows_appended(&self) -> u64 {
        self.rows_appended
    }

    /// True once the log may hold a row whose images were removed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[cfg(test)]
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Write the three images, then append and sync the log row.
    ///
    /// The row is the commit marker: if any image write fails, images already
    /// written for this frame are removed and no row is appended. If the row
    /// append fails the log is cut back to its previous length before the
    /// images are removed.
    pub fn commit(
        &mut self,
        frame_id: u64,
        images: &FrameTriplet,
        control: ControlVector,
    ) -> Result<FrameRecord, IngestError> {
        let context = FrameContext::Frame(frame_id);
        if self.poisoned {
            return Err(IngestError::Persistence {
                context,
                path: self.log_path.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    "log could not be rolled back after an earlier failure",
                ),
            });
        }
        let mut written: Vec<PathBuf> = Vec::with_capacity(3);
        let mut files: Vec<String> = Vec::with_capacity(3);

        for image in images.iter() {
            let name = image_file_name(image.channel(), frame_id);
            let relative = match &self.session_dir {
                Some(dir) => format!("{}/{}", dir, name),
                None => name,
            };
            let path = self.image_dir.join(&relative);
            if path.exists() {
                log::warn!(
                    "{}: overwriting {} left by an earlier session",
                    context,
                    path.display()
                );
            }
            if let Err(source) = write_atomic(&path, image.bytes()) {
                remove_all(&written);
                return Err(IngestError::Persistence {
                    context,
                    path,
                    source,
                });
            }
            written.push(path);
            files.push(relative);
        }

        let files: [String; 3] = files
            .try_into()
            .map_err(|_| IngestError::Persistence {
                context,
                path: self.image_dir.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, "frame without three images"),
            })?;
        let record = FrameRecord {
            frame_id,
            files,
            control,
        };

        if let Err(source) = self.append_row(record.to_log_row().as_bytes()) {
            remove_all(&written);
            return Err(IngestError::Persistence {
                context,
                path: self.log_path.clone(),
                source,
            });
        }
        self.rows_appended += 1;
        Ok(record)
    }

    /// One unbuffered write plus `sync_data`. On failure nothing of the row
    /// is left behind, or the writer is poisoned.
    fn append_row(&mut self, row: &[u8]) -> io::Result<()> {
        let before = self.log.metadata()?.len();
        let appended = self.log.write_all(row).and_then(|_| self.log.sync_data());
        if let Err(err) = appended {
            self.roll_back(before);
            return Err(err);
        }
        Ok(())
    }

    fn roll_back(&mut self, len: u64) {
        let file = &self.log;
        let restored = file.metadata().and_then(|meta| {
            if meta.len() == len {
                Ok(())
            } else {
                file.set_len(len).and_then(|_| file.sync_data())
            }
        });
        if let Err(e) = restored {
            log::error!(
                "failed to roll back {} to {} bytes: {}; refusing further commits",
                self.log_path.display(),
                len,
                e
            );
            self.poisoned = true;
        }
    }
}

impl FrameSink for DatasetWriter {
    fn begin_session(&mut self, session: u64) -> Result<(), IngestError> {
        if !self.session_subdirs {
            self.session_dir = None;
            return Ok(());
        }
        let dir = format!("session_{:03}", session);
        let path = self.image_dir.join(&dir);
        fs::create_dir_all(&path).map_err(|source| IngestError::Persistence {
            context: FrameContext::BeforeFirstFrame,
            path,
            source,
        })?;
        self.session_dir = Some(dir);
        Ok(())
    }

    fn commit(
        &mut self,
        frame_id: u64,
        images: &FrameTriplet,
        control: ControlVector,
    ) -> Result<FrameRecord, IngestError> {
        DatasetWriter::commit(self, frame_id, images, control)
    }
}

fn check_writable(dir: &Path) -> Result<()> {
    let marker = dir.join(WRITE_CHECK_FILE);
    File::create(&marker)
        .and_then(|mut f| f.write_all(b"ok"))
        .map_err(|e| anyhow!("image directory {} is not writable: {}", dir.display(), e))?;
    fs::remove_file(&marker)
        .map_err(|e| anyhow!("remove write check file {}: {}", marker.display(), e))?;
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        e
    })
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("failed to remove partial frame file {}: {}", path.display(), e);
        }
    }
}
