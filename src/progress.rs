//! Progress tracking and reporting
//!
//! Every file and group owns a [`ProgressItem`]. Updates go through a watch
//! channel and only wake subscribers when a field actually changed. All items
//! of one session share a [`ChangeSignal`] so a presentation layer can wait for
//! "something changed" and then pull a [`Snapshot`].

use human_bytes::human_bytes;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle as IndicatifStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle stage of a file or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    None,
    Cancelled,
    Downloading,
    Repairing,
    Extracting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// Current progress values of one item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub done: u64,
    pub total: u64,
    pub message: String,
    pub severity: Severity,
}

impl Progress {
    /// Completion in percent, `None` when there is nothing meaningful to show
    pub fn percentage(&self) -> Option<u8> {
        if self.stage == Stage::Done {
            return Some(100);
        }
        if self.total == 0 {
            return (self.stage == Stage::Downloading).then_some(0);
        }
        let ratio = (self.done as f64 / self.total as f64 * 100.0).round();
        Some(ratio.min(100.0) as u8)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: self.stage,
            percentage: self.percentage(),
            severity: self.severity,
            message: self.message.clone(),
        }
    }
}

/// Revision counter bumped by every progress change of a session
#[derive(Clone)]
pub struct ChangeSignal {
    revision: Arc<watch::Sender<u64>>,
}

impl Default for ChangeSignal {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            revision: Arc::new(revision),
        }
    }
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Observable progress of one file or group
pub struct ProgressItem {
    state: watch::Sender<Progress>,
    changes: ChangeSignal,
}

impl ProgressItem {
    pub fn new(changes: ChangeSignal) -> Self {
        let (state, _) = watch::channel(Progress::default());
        Self { state, changes }
    }

    /// Apply `modify`, notifying observers only if it reports a change
    fn update(&self, modify: impl FnOnce(&mut Progress) -> bool) {
        if self.state.send_if_modified(modify) {
            self.changes.notify();
        }
    }

    /// Move to `stage`. Message and severity are cleared, except when entering
    /// `Done`, which also forces `done == total`. Re-entering the current stage
    /// changes nothing.
    pub fn set_stage(&self, stage: Stage) {
        self.update(|p| {
            if p.stage == stage {
                return false;
            }
            let before = p.clone();
            p.stage = stage;
            if stage == Stage::Done {
                if p.total == 0 {
                    p.total = 1;
                }
                p.done = p.total;
            } else {
                p.message.clear();
                p.severity = Severity::Info;
            }
            *p != before
        });
        tracing::debug!("Stage changed to {:?}", stage);
    }

    pub fn set_message(&self, message: impl Into<String>, severity: Severity) {
        let message = message.into();
        self.update(|p| {
            if p.message == message && p.severity == severity {
                return false;
            }
            p.message = message;
            p.severity = severity;
            true
        });
    }

    pub fn set_total(&self, total: u64) {
        self.update(|p| {
            let changed = p.total != total;
            p.total = total;
            changed
        });
    }

    pub fn set_done(&self, done: u64) {
        self.update(|p| {
            let changed = p.done != done;
            p.done = done;
            changed
        });
    }

    pub fn add_done(&self, amount: u64) {
        self.update(|p| {
            p.done += amount;
            amount > 0
        });
    }

    pub fn get(&self) -> Progress {
        self.state.borrow().clone()
    }

    pub fn stage(&self) -> Stage {
        self.state.borrow().stage
    }

    pub fn severity(&self) -> Severity {
        self.state.borrow().severity
    }

    /// Receiver woken on every actual change of this item
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.state.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub percentage: Option<u8>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    pub filename: String,
    pub progress: ProgressSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub progress: ProgressSnapshot,
    pub files: Vec<FileSnapshot>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

/// Read-only view of every group of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub groups: Vec<GroupSnapshot>,
}

/// Progress display style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStyle {
    Download,
    Par2,
    Extract,
}

/// Create a progress bar with the specified style
pub fn create_progress_bar(total: u64, style: ProgressStyle) -> ProgressBar {
    let bar = ProgressBar::new(total);
    apply_style(&bar, style);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Apply a style to an existing progress bar
pub fn apply_style(bar: &ProgressBar, style: ProgressStyle) {
    match style {
        ProgressStyle::Download => {
            bar.set_style(
                IndicatifStyle::with_template(
                    "{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} {msg}"
                )
                .unwrap()
                .progress_chars("━━╸ ")
                .with_key("bytes_per_sec", |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                    let bytes_per_sec = state.per_sec();
                    if bytes_per_sec > 1_048_576.0 {
                        let _ = write!(w, "{:>7.2} MiB/s", bytes_per_sec / 1_048_576.0);
                    } else if bytes_per_sec > 1024.0 {
                        let _ = write!(w, "{:>7.2} KiB/s", bytes_per_sec / 1024.0);
                    } else {
                        let _ = write!(w, "{:>7.0}  B/s", bytes_per_sec);
                    }
                })
            );
        }
        ProgressStyle::Par2 => {
            bar.set_style(
                IndicatifStyle::with_template("{prefix:.bold} [{bar:40.yellow}] repairing {msg}")
                    .unwrap()
                    .progress_chars("━━╸ ")
            );
        }
        ProgressStyle::Extract => {
            bar.set_style(
                IndicatifStyle::with_template("{prefix:.bold} [{bar:40.green}] extracting {msg}")
                    .unwrap()
                    .progress_chars("━━╸ ")
            );
        }
    }
}

/// Format the closing line of a group
pub fn format_group_summary(group: &GroupSnapshot) -> String {
    let finished = group
        .files
        .iter()
        .filter(|f| f.progress.stage == Stage::Done)
        .count();
    let failed = group
        .files
        .iter()
        .filter(|f| f.progress.severity == Severity::Error)
        .count();

    match group.progress.stage {
        Stage::Cancelled => format!("✗ Cancelled ({}/{} files)", finished, group.files.len()),
        Stage::Done if failed == 0 => format!(
            "({}/{}) ✓ Downloaded {}",
            finished,
            group.files.len(),
            human_bytes(group.total_bytes as f64)
        ),
        Stage::Done => format!(
            "({}/{}) ⚠ Downloaded {} ({} with errors)",
            finished,
            group.files.len(),
            human_bytes(group.total_bytes as f64),
            failed
        ),
        _ => format!("✗ {}", group.progress.message),
    }
}

/// Terminal rendering of snapshots, one bar per group
pub struct ProgressDisplay {
    multi: MultiProgress,
    bars: HashMap<String, (ProgressBar, Stage)>,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Bring the bars in line with `snapshot`
    pub fn render(&mut self, snapshot: &Snapshot) {
        for group in &snapshot.groups {
            let (bar, shown) = self.bars.entry(group.name.clone()).or_insert_with(|| {
                let bar = self
                    .multi
                    .add(create_progress_bar(group.total_bytes, ProgressStyle::Download));
                bar.set_prefix(group.name.clone());
                (bar, Stage::Downloading)
            });

            if bar.is_finished() {
                continue;
            }

            let stage = group.progress.stage;
            if stage != *shown {
                match stage {
                    Stage::Repairing => apply_style(bar, ProgressStyle::Par2),
                    Stage::Extracting => apply_style(bar, ProgressStyle::Extract),
                    Stage::Downloading => apply_style(bar, ProgressStyle::Download),
                    _ => {}
                }
                *shown = stage;
            }

            bar.set_length(group.total_bytes.max(1));
            bar.set_position(group.downloaded_bytes);
            bar.set_message(group.progress.message.clone());

            if matches!(stage, Stage::Done | Stage::Cancelled) {
                bar.finish_with_message(format_group_summary(group));
            }
        }
    }

    /// Mark every unfinished bar with its last message
    pub fn finish(&mut self, snapshot: &Snapshot) {
        for group in &snapshot.groups {
            if let Some((bar, _)) = self.bars.get(&group.name) {
                if !bar.is_finished() {
                    bar.abandon_with_message(format_group_summary(group));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(stage: Stage, done: u64, total: u64) -> Progress {
        Progress {
            stage,
            done,
            total,
            ..Default::default()
        }
    }

    #[test]
    fn test_percentage() {
        assert_eq!(progress(Stage::Downloading, 0, 0).percentage(), Some(0));
        assert_eq!(progress(Stage::Repairing, 0, 0).percentage(), None);
        assert_eq!(progress(Stage::Done, 0, 0).percentage(), Some(100));
        assert_eq!(progress(Stage::Downloading, 1, 3).percentage(), Some(33));
        assert_eq!(progress(Stage::Downloading, 2, 3).percentage(), Some(67));
    }

    #[test]
    fn test_stage_change_resets_message_except_done() {
        let item = ProgressItem::new(ChangeSignal::new());
        item.set_stage(Stage::Downloading);
        item.set_message("part 3 is broken", Severity::Error);

        item.set_stage(Stage::Done);
        let p = item.get();
        assert_eq!(p.severity, Severity::Error);
        assert_eq!(p.done, 1);
        assert_eq!(p.total, 1);

        item.set_stage(Stage::Repairing);
        let p = item.get();
        assert_eq!(p.severity, Severity::Info);
        assert!(p.message.is_empty());
    }

    #[test]
    fn test_same_stage_keeps_message() {
        let item = ProgressItem::new(ChangeSignal::new());
        item.set_stage(Stage::Downloading);
        item.set_message("part 2 is missing", Severity::Error);

        item.set_stage(Stage::Downloading);
        let p = item.get();
        assert_eq!(p.severity, Severity::Error);
        assert_eq!(p.message, "part 2 is missing");
    }

    #[test]
    fn test_notifies_only_on_change() {
        let changes = ChangeSignal::new();
        let revision = changes.subscribe();
        let item = ProgressItem::new(changes);
        let mut rx = item.subscribe();

        item.set_total(10);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        let after_first = *revision.borrow();

        item.set_total(10);
        item.set_done(0);
        item.add_done(0);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(*revision.borrow(), after_first);

        item.add_done(4);
        assert!(rx.has_changed().unwrap());
        assert!(*revision.borrow() > after_first);
        assert_eq!(item.get().percentage(), Some(40));
    }

    #[test]
    fn test_snapshot_serializes_lowercase() {
        let snapshot = progress(Stage::Downloading, 1, 2).snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["stage"], "downloading");
        assert_eq!(json["severity"], "info");
        assert_eq!(json["percentage"], 50);
    }

    #[test]
    fn test_group_summary() {
        let group = GroupSnapshot {
            name: "show".to_string(),
            progress: progress(Stage::Done, 1, 1).snapshot(),
            files: vec![FileSnapshot {
                filename: "a.bin".to_string(),
                progress: progress(Stage::Done, 1, 1).snapshot(),
            }],
            downloaded_bytes: 2048,
            total_bytes: 2048,
        };
        assert!(format_group_summary(&group).starts_with("(1/1) ✓ Downloaded"));
    }
}
