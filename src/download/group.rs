use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::file_entry::FileEntry;
use super::nzb::{is_nzb, is_par2, Nzb};
use crate::cancel::{CancellationSource, CancellationToken};
use crate::config::GroupConfig;
use crate::disk;
use crate::error::{Error, ResourceError, Result};
use crate::nntp::ConnectionPool;
use crate::processing::ExternalTools;
use crate::progress::{ChangeSignal, GroupSnapshot, ProgressItem, Severity, Stage};

/// Suffix given to a nested NZB before it is queued, so it is not picked up twice
const RECURSE_SUFFIX: &str = "_recurse";

/// Everything downloaded from one NZB document
pub struct Group {
    config: Arc<GroupConfig>,
    nzb_path: PathBuf,
    name: String,
    download_dir: PathBuf,
    main: Vec<Arc<FileEntry>>,
    addpar2: Vec<Arc<FileEntry>>,
    source: CancellationSource,
    progress: ProgressItem,
    started: AtomicBool,
}

/// Split entries into the files needed for a first verification pass and the
/// extra recovery volumes. The first par2 file goes with the main set.
pub fn split_entries<T, F>(entries: Vec<T>, is_parity: F) -> (Vec<T>, Vec<T>)
where
    F: Fn(&T) -> bool,
{
    let (mut main, mut parity): (Vec<T>, Vec<T>) =
        entries.into_iter().partition(|entry| !is_parity(entry));
    if !parity.is_empty() {
        main.push(parity.remove(0));
    }
    (main, parity)
}

impl Group {
    /// Derived name of the group built from `nzb_path`
    pub fn name_from_path(nzb_path: &Path) -> String {
        let file_name = nzb_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match file_name.strip_suffix(".nzb") {
            Some(stem) => stem.to_string(),
            None => file_name,
        }
    }

    /// Parse `nzb_path` and set up one entry per declared file
    pub fn from_nzb_file(
        config: Arc<GroupConfig>,
        nzb_path: &Path,
        parent: &CancellationToken,
        changes: ChangeSignal,
    ) -> Result<Self> {
        let name = Self::name_from_path(nzb_path);
        let download_dir = config.download_root.join(&name);
        let nzb = Nzb::from_file(nzb_path)?;
        std::fs::create_dir_all(&download_dir)?;

        let mut entries = Vec::with_capacity(nzb.files().len());
        for file in nzb.files() {
            let path = download_dir.join(file.filename());
            let segments = file.to_segments(&path)?;
            entries.push(Arc::new(FileEntry::new(path, segments, changes.clone())));
        }
        entries.sort_by(|a, b| a.filename().cmp(b.filename()));

        let (main, addpar2) = split_entries(entries, |e| is_par2(e.path()));

        let progress = ProgressItem::new(changes);
        progress.set_total(
            main.iter()
                .chain(addpar2.iter())
                .map(|e| e.total_bytes())
                .sum(),
        );

        tracing::info!(
            "Added {} ({} files, {} recovery volumes held back)",
            name,
            main.len() + addpar2.len(),
            addpar2.len()
        );

        Ok(Self {
            config,
            nzb_path: nzb_path.to_path_buf(),
            name,
            download_dir,
            main,
            addpar2,
            source: CancellationSource::child_of(parent),
            progress,
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nzb_path(&self) -> &Path {
        &self.nzb_path
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn main_entries(&self) -> &[Arc<FileEntry>] {
        &self.main
    }

    pub fn addpar2_entries(&self) -> &[Arc<FileEntry>] {
        &self.addpar2
    }

    /// All entries, main set first
    pub fn entries(&self) -> impl Iterator<Item = &Arc<FileEntry>> {
        self.main.iter().chain(self.addpar2.iter())
    }

    pub fn stage(&self) -> Stage {
        self.progress.stage()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries().map(|e| e.total_bytes()).sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.entries().map(|e| e.downloaded_bytes()).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.entries().any(|e| e.has_errors())
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let mut progress = self.progress.get();
        progress.done = self.downloaded_bytes();
        progress.total = self.total_bytes();

        GroupSnapshot {
            name: self.name.clone(),
            progress: progress.snapshot(),
            files: self.entries().map(|e| e.snapshot()).collect(),
            downloaded_bytes: progress.done,
            total_bytes: progress.total,
        }
    }

    /// Stop the group unless it already finished
    pub fn cancel(&self) {
        if self.stage() != Stage::Done {
            self.source.cancel();
            self.progress.set_stage(Stage::Cancelled);
        }
    }

    /// Download, repair and extract the group. Runs once; later calls return immediately.
    ///
    /// Cancellation leaves the group in [`Stage::Cancelled`]. Any other failure
    /// is recorded as an error message and the stage is left where it was.
    pub async fn process(
        &self,
        pool: &ConnectionPool,
        tools: &dyn ExternalTools,
        add_nzb: &(dyn Fn(PathBuf) + Send + Sync),
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.run(pool, tools, add_nzb).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                tracing::info!("{} cancelled", self.name);
                self.progress.set_stage(Stage::Cancelled);
                Err(e)
            }
            Err(e) => {
                tracing::error!("{} failed: {}", self.name, e);
                self.progress.set_message(e.to_string(), Severity::Error);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        pool: &ConnectionPool,
        tools: &dyn ExternalTools,
        add_nzb: &(dyn Fn(PathBuf) + Send + Sync),
    ) -> Result<()> {
        let token = self.source.token();
        token.check()?;
        self.ensure_disk_space()?;

        self.load_files(pool, &self.main, &token).await?;

        if self.config.repair_and_extract {
            if self.has_errors() || !tools.verify(&self.download_dir, &token).await? {
                self.load_files(pool, &self.addpar2, &token).await?;
                self.progress.set_stage(Stage::Repairing);
                tools
                    .repair(&self.download_dir, self.config.remove_after, &token)
                    .await?;
            }
            self.progress.set_stage(Stage::Extracting);
            tools
                .extract(&self.download_dir, self.config.remove_after, &token)
                .await?;
        } else {
            self.load_files(pool, &self.addpar2, &token).await?;
        }

        self.progress.set_stage(Stage::Done);
        tracing::info!("{} done", self.name);

        if self.config.recurse {
            self.recurse_nzb(add_nzb).await;
        }
        Ok(())
    }

    fn ensure_disk_space(&self) -> Result<()> {
        let needed = self.total_bytes();
        let available = disk::available_space(&self.download_dir)?;
        if available < needed {
            return Err(ResourceError::InsufficientSpace {
                name: self.name.clone(),
                needed,
                available,
            }
            .into());
        }
        Ok(())
    }

    /// Download `entries` with one worker per pooled connection pulling from a shared queue
    async fn load_files(
        &self,
        pool: &ConnectionPool,
        entries: &[Arc<FileEntry>],
        token: &CancellationToken,
    ) -> Result<()> {
        self.progress.set_stage(Stage::Downloading);

        let pending: Vec<Arc<FileEntry>> = entries
            .iter()
            .filter(|e| e.stage() != Stage::Done)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let workers = pool.total().min(pending.len()).max(1);
        tracing::debug!(
            "{}: {} files over {} workers",
            self.name,
            pending.len(),
            workers
        );

        let (tx, rx) = mpsc::channel(pending.len());
        for entry in pending {
            if tx.send(entry).await.is_err() {
                break;
            }
        }
        drop(tx);
        let queue = Mutex::new(rx);

        let results = join_all((0..workers).map(|_| async {
            loop {
                let next = queue.lock().await.recv().await;
                let Some(entry) = next else {
                    return Ok::<(), Error>(());
                };
                entry.load(pool, token).await?;
                if entry.has_errors() {
                    let message = entry.progress().message;
                    self.progress.set_message(
                        format!("{}: {}", entry.filename(), message),
                        Severity::Error,
                    );
                }
            }
        }))
        .await;

        // a real failure is more interesting than the cancellations it caused
        let mut outcome = Ok(());
        for result in results {
            match result {
                Err(e) if !e.is_cancelled() => return Err(e),
                Err(e) => outcome = Err(e),
                Ok(()) => {}
            }
        }
        outcome
    }

    async fn recurse_nzb(&self, add_nzb: &(dyn Fn(PathBuf) + Send + Sync)) {
        let mut candidates = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.download_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!("Cannot look for nested NZB in {}: {}", self.name, e);
                return;
            }
        };
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if !is_par2(&path) {
                        candidates.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Cannot look for nested NZB in {}: {}", self.name, e);
                    return;
                }
            }
        }

        if let [nested] = candidates.as_slice() {
            if is_nzb(nested) {
                let mut renamed = nested.clone().into_os_string();
                renamed.push(RECURSE_SUFFIX);
                let renamed = PathBuf::from(renamed);
                match tokio::fs::rename(nested, &renamed).await {
                    Ok(()) => {
                        tracing::info!("{} contains a nested NZB, queueing it", self.name);
                        add_nzb(renamed);
                    }
                    Err(e) => tracing::error!("Cannot rename nested NZB: {}", e),
                }
            }
        }
    }
}
