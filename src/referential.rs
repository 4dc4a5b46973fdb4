//! Registry of the groups of a download session

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;

use crate::cancel::CancellationSource;
use crate::config::{Config, GroupConfig};
use crate::download::Group;
use crate::error::{DownloadError, Result};
use crate::nntp::ConnectionPool;
use crate::processing::{ExternalTools, NoopTools, ProcessTools};
use crate::progress::{ChangeSignal, Snapshot};
use crate::scheduler::Scheduler;

/// Owns every group of a session, the pool they share and the scheduler admitting them
pub struct Referential {
    config: Arc<GroupConfig>,
    pool: ConnectionPool,
    tools: Arc<dyn ExternalTools>,
    scheduler: Scheduler,
    groups: Mutex<Vec<Arc<Group>>>,
    source: CancellationSource,
    changes: ChangeSignal,
    this: Weak<Referential>,
}

impl Referential {
    pub fn new(
        config: GroupConfig,
        pool: ConnectionPool,
        tools: Arc<dyn ExternalTools>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config: Arc::new(config),
            pool,
            tools,
            scheduler: Scheduler::new(),
            groups: Mutex::new(Vec::new()),
            source: CancellationSource::new(),
            changes: ChangeSignal::new(),
            this: this.clone(),
        })
    }

    /// Session built from the loaded configuration, with the platform's tools
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let pool = ConnectionPool::from_config(&config.usenet)?;
        let tools: Arc<dyn ExternalTools> = if config.post_processing.repair_and_extract {
            ProcessTools::detect()
        } else {
            Arc::new(NoopTools)
        };
        Ok(Self::new(config.group_config(), pool, tools))
    }

    fn lock_groups(&self) -> MutexGuard<'_, Vec<Arc<Group>>> {
        self.groups.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register the NZB at `path` and schedule its processing
    ///
    /// Returns `false` when a group with the same name is already registered.
    /// Small NZBs skip the queue when `prioritize_small` is set.
    pub fn add_file(&self, path: &Path) -> Result<bool> {
        if self.source.is_cancelled() {
            return Err(DownloadError::Cancelled.into());
        }

        let name = Group::name_from_path(path);
        if self.group(&name).is_some() {
            tracing::info!("{} is already queued", name);
            return Ok(false);
        }

        let group = Arc::new(Group::from_nzb_file(
            self.config.clone(),
            path,
            &self.source.token(),
            self.changes.clone(),
        )?);

        {
            let mut groups = self.lock_groups();
            if groups.iter().any(|g| g.name() == group.name()) {
                return Ok(false);
            }
            groups.push(group.clone());
        }

        let out_of_band =
            self.config.prioritize_small && group.total_bytes() < self.config.small_threshold;
        tracing::debug!(
            "Scheduling {} ({})",
            group.name(),
            if out_of_band { "out of band" } else { "queued" }
        );

        let pool = self.pool.clone();
        let tools = self.tools.clone();
        let this = self.this.clone();
        self.scheduler.schedule(
            async move {
                let add_nzb = move |nested: PathBuf| {
                    let Some(referential) = this.upgrade() else {
                        return;
                    };
                    if let Err(e) = referential.add_file(&nested) {
                        tracing::error!("Cannot queue {}: {}", nested.display(), e);
                    }
                };

                match group.process(&pool, tools.as_ref(), &add_nzb).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::debug!("{} stopped: {}", group.name(), e),
                }
            },
            out_of_band,
        );

        self.changes.notify();
        Ok(true)
    }

    /// [`Referential::add_file`] for several paths; failures are logged and skipped
    ///
    /// Returns the number of groups added.
    pub fn add_files<P: AsRef<Path>>(&self, paths: &[P]) -> usize {
        let mut added = 0;
        for path in paths {
            match self.add_file(path.as_ref()) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Cannot add {}: {}", path.as_ref().display(), e),
            }
        }
        added
    }

    /// Forget the group called `name` and cancel it
    pub fn remove_file(&self, name: &str) -> bool {
        let removed = {
            let mut groups = self.lock_groups();
            groups
                .iter()
                .position(|g| g.name() == name)
                .map(|index| groups.remove(index))
        };

        match removed {
            Some(group) => {
                group.cancel();
                self.changes.notify();
                tracing::info!("Removed {}", name);
                true
            }
            None => false,
        }
    }

    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.lock_groups().iter().find(|g| g.name() == name).cloned()
    }

    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.lock_groups().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            groups: self.lock_groups().iter().map(|g| g.snapshot()).collect(),
        }
    }

    /// Receiver woken whenever any progress of the session changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// True while a scheduled group has not finished processing
    pub fn is_downloading(&self) -> bool {
        self.scheduler.outstanding() > 0
    }

    /// Wait until every scheduled group has settled
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    /// Cancel everything, wait for it to settle, then close the pool and the tools
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        for group in self.groups() {
            group.cancel();
        }
        self.source.cancel();
        self.scheduler.shutdown().await;
        self.pool.end().await;
        self.tools.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Stage;
    use crate::testing::{post_file, write_nzb, FakeServer};
    use std::time::Duration;
    use tempfile::TempDir;

    fn group_config(root: &Path) -> GroupConfig {
        GroupConfig {
            download_root: root.to_path_buf(),
            repair_and_extract: false,
            remove_after: false,
            prioritize_small: false,
            recurse: true,
            small_threshold: 5_000_000,
        }
    }

    #[tokio::test]
    async fn test_same_name_is_added_once() {
        let dir = TempDir::new().unwrap();
        let server = FakeServer::new();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let files = vec![post_file(&server, "\"x.bin\" yEnc", "x.bin", &[1u8; 10], 1)];
        let first = write_nzb(&dir.path().join("a"), "same.nzb", &files);
        let second = write_nzb(&dir.path().join("b"), "same.nzb", &files);

        let referential = Referential::new(
            group_config(&dir.path().join("out")),
            server.pool(1),
            Arc::new(NoopTools),
        );
        assert!(referential.add_file(&first).unwrap());
        assert!(!referential.add_file(&second).unwrap());
        assert_eq!(referential.add_files(&[first, second]), 0);

        referential.wait_idle().await;
        assert_eq!(referential.groups().len(), 1);
        assert_eq!(referential.snapshot().groups.len(), 1);
    }

    #[tokio::test]
    async fn test_two_file_nzb_end_to_end() {
        let dir = TempDir::new().unwrap();
        let server = FakeServer::new();
        let first: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
        let second: Vec<u8> = (0..1234u32).map(|i| (255 - i % 256) as u8).collect();
        let files = vec![
            post_file(&server, "[1/2] - \"first.bin\" yEnc (1/3)", "first.bin", &first, 3),
            post_file(&server, "[2/2] - \"second.bin\" yEnc (1/2)", "second.bin", &second, 2),
        ];
        let nzb = write_nzb(dir.path(), "pair.nzb", &files);
        let root = dir.path().join("out");

        let referential = Referential::new(group_config(&root), server.pool(2), Arc::new(NoopTools));
        let changes = referential.subscribe();
        referential.add_file(&nzb).unwrap();
        referential.wait_idle().await;

        let written: Vec<_> = std::fs::read_dir(root.join("pair"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read(root.join("pair/first.bin")).unwrap(), first);
        assert_eq!(std::fs::read(root.join("pair/second.bin")).unwrap(), second);

        assert!(changes.has_changed().unwrap());
        let snapshot = referential.snapshot();
        assert_eq!(snapshot.groups[0].name, "pair");
        assert_eq!(snapshot.groups[0].progress.stage, Stage::Done);
        assert_eq!(snapshot.groups[0].progress.percentage, Some(100));
        assert!(snapshot.groups[0]
            .files
            .iter()
            .all(|f| f.progress.percentage == Some(100)));
        assert!(!referential.is_downloading());
    }

    #[tokio::test]
    async fn test_nested_nzb_becomes_a_group() {
        let dir = TempDir::new().unwrap();
        let server = FakeServer::new();
        let inner = crate::testing::nzb_xml(&[post_file(
            &server,
            "\"payload.bin\" yEnc",
            "payload.bin",
            &[5u8; 64],
            1,
        )]);
        let files = vec![post_file(&server, "\"inner.nzb\" yEnc", "inner.nzb", inner.as_bytes(), 1)];
        let nzb = write_nzb(dir.path(), "outer.nzb", &files);
        let root = dir.path().join("out");

        let referential = Referential::new(group_config(&root), server.pool(1), Arc::new(NoopTools));
        referential.add_file(&nzb).unwrap();
        referential.wait_idle().await;

        let names: Vec<String> = referential
            .groups()
            .iter()
            .map(|g| g.name().to_string())
            .collect();
        assert_eq!(names, vec!["outer", "inner.nzb_recurse"]);
        assert_eq!(
            std::fs::read(root.join("inner.nzb_recurse/payload.bin")).unwrap(),
            vec![5u8; 64]
        );
    }

    #[tokio::test]
    async fn test_remove_cancels_group() {
        let dir = TempDir::new().unwrap();
        let server = FakeServer::new();
        server.set_delay(Duration::from_millis(20));
        let files = vec![post_file(&server, "\"slow.bin\" yEnc", "slow.bin", &[1u8; 500], 25)];
        let nzb = write_nzb(dir.path(), "slow.nzb", &files);

        let referential = Referential::new(
            group_config(&dir.path().join("out")),
            server.pool(1),
            Arc::new(NoopTools),
        );
        referential.add_file(&nzb).unwrap();
        let group = referential.group("slow").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(referential.remove_file("slow"));
        assert!(!referential.remove_file("slow"));
        referential.wait_idle().await;

        assert_eq!(group.stage(), Stage::Cancelled);
        assert!(referential.snapshot().groups.is_empty());
        assert!(server.body_calls() < 25);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let dir = TempDir::new().unwrap();
        let server = FakeServer::new();
        server.set_delay(Duration::from_millis(20));
        let files = vec![post_file(&server, "\"big.bin\" yEnc", "big.bin", &[2u8; 500], 25)];
        let nzb = write_nzb(dir.path(), "big.nzb", &files);
        let pool = server.pool(2);

        let referential = Referential::new(
            group_config(&dir.path().join("out")),
            pool.clone(),
            Arc::new(NoopTools),
        );
        referential.add_file(&nzb).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(5), referential.shutdown())
            .await
            .unwrap();
        assert!(pool.is_closed());
        assert!(!referential.is_downloading());
        assert_eq!(
            referential.group("big").unwrap().stage(),
            Stage::Cancelled
        );
        assert!(referential.add_file(&nzb).unwrap_err().is_cancelled());
    }
}
