//! Resumable reassembly of one file
//!
//! Decoded segments are appended in order to `<name>.nzbpart<N>`, where `N` is
//! the number of segments the artifact already holds. After each append the
//! artifact is renamed to `N + 1`, so an interrupted download resumes from the
//! highest count found on disk. The final rename gives the file its real name.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use super::segment::{Segment, DEFAULT_ATTEMPTS};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::nntp::ConnectionPool;
use crate::progress::{ChangeSignal, FileSnapshot, Progress, ProgressItem, Severity, Stage};
use crate::yenc;

const TEMP_TAG: &str = ".nzbpart";

#[derive(Default)]
struct Segments {
    done: Vec<Segment>,
    pending: VecDeque<Segment>,
}

pub struct FileEntry {
    path: PathBuf,
    filename: String,
    segments: Mutex<Segments>,
    progress: ProgressItem,
}

/// Path of the temp artifact holding the first `count` segments of `path`
pub fn temp_path(path: &Path, count: usize) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{}{}", TEMP_TAG, count));
    path.with_file_name(name)
}

/// Highest segment count of a temp artifact of `path` found on disk
fn resume_point(path: &Path) -> usize {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return 0;
    };
    let prefix = format!("{}{}", name, TEMP_TAG);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot scan {} for partial files: {}", dir.display(), e);
            return 0;
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|count| count.parse::<usize>().ok())
        })
        .max()
        .unwrap_or(0)
}

impl FileEntry {
    /// Create the entry for `path`, picking up whatever is already on disk
    pub fn new(path: PathBuf, mut segments: Vec<Segment>, changes: ChangeSignal) -> Self {
        segments.sort_by_key(|s| s.number);

        let total: u64 = segments.iter().map(|s| s.bytes).sum();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let progress = ProgressItem::new(changes);
        progress.set_total(total);

        let complete = path.exists();
        let skip = if complete {
            segments.len()
        } else {
            resume_point(&path).min(segments.len())
        };
        let pending: VecDeque<Segment> = segments.split_off(skip).into();
        let done_bytes: u64 = segments.iter().map(|s| s.bytes).sum();

        if complete {
            tracing::info!("File already complete, skipping: {}", filename);
            progress.set_stage(Stage::Done);
        } else {
            if skip > 0 {
                tracing::info!("Resuming {} after {} segments", filename, skip);
            }
            progress.set_done(done_bytes);
        }

        Self {
            path,
            filename,
            segments: Mutex::new(Segments {
                done: segments,
                pending,
            }),
            progress,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn stage(&self) -> Stage {
        self.progress.stage()
    }

    pub fn progress(&self) -> Progress {
        self.progress.get()
    }

    pub fn total_bytes(&self) -> u64 {
        self.progress.get().total
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.progress.get().done
    }

    pub fn has_errors(&self) -> bool {
        self.progress.severity() == Severity::Error
    }

    pub fn pending_segments(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            filename: self.filename.clone(),
            progress: self.progress.get().snapshot(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Segments> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Download, decode and append every pending segment, then give the file its final name
    ///
    /// A segment that cannot be fetched or decoded is replaced by zeros of its
    /// declared size and flags the entry with an error. Only cancellation and
    /// local I/O failures abort the loop.
    pub async fn load(&self, pool: &ConnectionPool, token: &CancellationToken) -> Result<()> {
        if self.stage() == Stage::Done {
            return Ok(());
        }
        self.progress.set_stage(Stage::Downloading);

        loop {
            token.check()?;

            let next = {
                let mut segments = self.lock();
                segments
                    .pending
                    .pop_front()
                    .map(|segment| (segment, segments.done.len()))
            };
            let Some((segment, completed)) = next else {
                break;
            };

            let fetched = match segment.download_retry(pool, token, DEFAULT_ATTEMPTS).await {
                Ok(raw) => yenc::decode_to_buffer(&raw, segment.bytes).map_err(Into::into),
                Err(e) => Err(e),
            };

            let data = match fetched {
                Ok(data) => data,
                Err(e) if e.is_cancelled() => {
                    self.lock().pending.push_front(segment);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Error decoding part {} of {}, filling with zeros: {}",
                        segment.number,
                        self.filename,
                        e
                    );
                    self.progress.set_message(
                        format!("error decoding part {}, reason: {}", segment.number, e),
                        Severity::Error,
                    );
                    vec![0u8; segment.bytes as usize]
                }
            };

            if let Err(e) = self.append(completed, &data).await {
                self.lock().pending.push_front(segment);
                return Err(e);
            }

            self.progress.add_done(segment.bytes);
            self.lock().done.push(segment);
        }

        self.finish().await
    }

    async fn append(&self, completed: usize, data: &[u8]) -> Result<()> {
        let current = temp_path(&self.path, completed);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&current, temp_path(&self.path, completed + 1)).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let completed = self.lock().done.len();
        let temp = temp_path(&self.path, completed);

        if tokio::fs::try_exists(&temp).await? {
            tokio::fs::rename(&temp, &self.path).await?;
        } else {
            tokio::fs::File::create(&self.path).await?;
        }

        tracing::info!("Completed {}", self.filename);
        self.progress.set_stage(Stage::Done);
        Ok(())
    }
}
