//! PAR2 verification/repair and archive extraction through external binaries

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::cancel::CancellationToken;
use crate::download::is_par2;
use crate::error::{DownloadError, ResourceError, Result};

static ARCHIVE_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:rar|zip|7z|[rz]\d\d|\d\d\d)$").unwrap());
static RAR_EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:rar|r\d\d)$").unwrap());
static ZIP_EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:zip|z\d\d)$").unwrap());

/// Verification, repair and extraction of a finished download directory
#[async_trait]
pub trait ExternalTools: Send + Sync {
    /// True when the files in `dir` pass PAR2 verification (or there is no PAR2 set)
    async fn verify(&self, dir: &Path, token: &CancellationToken) -> Result<bool>;

    /// Repair `dir` from its PAR2 set; fails when the set cannot repair it
    async fn repair(&self, dir: &Path, remove_par2: bool, token: &CancellationToken) -> Result<()>;

    /// Extract the archives found in `dir`
    async fn extract(&self, dir: &Path, remove_archives: bool, token: &CancellationToken)
        -> Result<()>;

    /// Refuse to start any further process
    fn shutdown(&self);
}

/// Tools that accept everything and do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTools;

#[async_trait]
impl ExternalTools for NoopTools {
    async fn verify(&self, _dir: &Path, _token: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn repair(&self, _dir: &Path, _remove: bool, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn extract(&self, _dir: &Path, _remove: bool, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// Which binaries are used on this platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStrategy {
    /// `par2` and 7-Zip for every archive type (Windows, Linux)
    SevenZip { par2: PathBuf, sevenzip: PathBuf },
    /// `par2`, `unrar` for rar volumes and `unzip` for zip files (macOS)
    UnrarUnzip {
        par2: PathBuf,
        unrar: PathBuf,
        unzip: PathBuf,
    },
    Unsupported,
}

/// Find a tool next to our executable, falling back to a PATH lookup at spawn time
fn locate(name: &str) -> PathBuf {
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            for candidate in [exe_dir.join(&file_name), exe_dir.join("tools").join(&file_name)] {
                if candidate.exists() {
                    return candidate;
                }
            }
        }
    }

    PathBuf::from(file_name)
}

impl ToolStrategy {
    /// Pick the strategy for the platform we run on
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "windows" | "linux" => ToolStrategy::SevenZip {
                par2: locate("par2"),
                sevenzip: locate("7z"),
            },
            "macos" => ToolStrategy::UnrarUnzip {
                par2: locate("par2"),
                unrar: locate("unrar"),
                unzip: PathBuf::from("unzip"),
            },
            _ => ToolStrategy::Unsupported,
        }
    }

    fn par2(&self) -> Option<&Path> {
        match self {
            ToolStrategy::SevenZip { par2, .. } | ToolStrategy::UnrarUnzip { par2, .. } => {
                Some(par2)
            }
            ToolStrategy::Unsupported => None,
        }
    }

    /// Program and arguments extracting `archive`, if this strategy handles it
    fn extract_command(&self, archive: &Path) -> Option<(PathBuf, Vec<OsString>)> {
        let archive = archive.as_os_str().to_os_string();
        match self {
            ToolStrategy::SevenZip { sevenzip, .. } => Some((
                sevenzip.clone(),
                vec!["x".into(), "-pp".into(), "-y".into(), archive],
            )),
            ToolStrategy::UnrarUnzip { unrar, unzip, .. } => {
                let extension = lowercase_extension(Path::new(&archive));
                if RAR_EXTENSION.is_match(&extension) {
                    Some((
                        unrar.clone(),
                        vec!["x".into(), "-pp".into(), "-y".into(), archive],
                    ))
                } else if ZIP_EXTENSION.is_match(&extension) {
                    Some((unzip.clone(), vec!["-Pp".into(), "-q".into(), archive]))
                } else {
                    None
                }
            }
            ToolStrategy::Unsupported => None,
        }
    }
}

fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

pub fn is_archive(path: &Path) -> bool {
    ARCHIVE_EXTENSION.is_match(&lowercase_extension(path))
}

fn list_dir(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| keep(path))
        .collect();
    files.sort();
    Ok(files)
}

/// PAR2 files of `dir`, the index file (shortest name) first
fn par2_list(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = list_dir(dir, is_par2)?;
    files.sort_by_key(|p| p.file_name().map(|n| n.len()).unwrap_or(usize::MAX));
    Ok(files)
}

/// Archives of `dir`, sorted by name
fn archive_list(dir: &Path) -> Result<Vec<PathBuf>> {
    list_dir(dir, is_archive)
}

async fn remove_all(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            tracing::debug!("Could not remove {}: {}", file.display(), e);
        }
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Runs the strategy's binaries one at a time
pub struct ProcessTools {
    strategy: ToolStrategy,
    slot: Semaphore,
}

impl ProcessTools {
    pub fn new(strategy: ToolStrategy) -> Self {
        Self {
            strategy,
            slot: Semaphore::new(1),
        }
    }

    /// Tools for this platform, or [`NoopTools`] where none are known
    pub fn detect() -> Arc<dyn ExternalTools> {
        match ToolStrategy::detect() {
            ToolStrategy::Unsupported => {
                tracing::warn!("No repair/extract tools for this platform, post-processing disabled");
                Arc::new(NoopTools)
            }
            strategy => Arc::new(Self::new(strategy)),
        }
    }

    pub fn strategy(&self) -> &ToolStrategy {
        &self.strategy
    }

    /// Run `program` in `cwd`; killed when cancelled
    async fn exec(
        &self,
        program: &Path,
        cwd: &Path,
        args: &[OsString],
        token: &CancellationToken,
    ) -> Result<()> {
        token.check()?;
        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| ResourceError::ToolsShutdown)?;
        token.check()?;

        let tool = tool_name(program);
        tracing::info!(
            "Starting command: {} {}",
            program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ResourceError::ToolNotFound { tool: tool.clone() },
                _ => ResourceError::ToolFailed {
                    tool: tool.clone(),
                    reason: e.to_string(),
                },
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| ResourceError::ToolFailed {
                tool: tool.clone(),
                reason: e.to_string(),
            })?,
            _ = token.cancelled() => {
                tracing::info!("{} interrupted", tool);
                return Err(DownloadError::Cancelled.into());
            }
        };

        tracing::trace!("{} echoed: {}", tool, String::from_utf8_lossy(&output.stdout));

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(line) => format!("{}: {}", output.status, line.trim()),
                None => output.status.to_string(),
            };
            tracing::error!("{} failed, reason: {}", tool, reason);
            return Err(ResourceError::ToolFailed { tool, reason }.into());
        }

        tracing::info!("Command complete");
        Ok(())
    }

    fn par2_args(mode: &str, index: &Path) -> Vec<OsString> {
        vec![mode.into(), index.as_os_str().to_os_string(), "*".into()]
    }
}

#[async_trait]
impl ExternalTools for ProcessTools {
    async fn verify(&self, dir: &Path, token: &CancellationToken) -> Result<bool> {
        let par2_files = par2_list(dir)?;
        let (Some(index), Some(par2)) = (par2_files.first(), self.strategy.par2()) else {
            return Ok(true);
        };

        match self.exec(par2, dir, &Self::par2_args("v", index), token).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                tracing::info!("Verification of {} failed: {}", dir.display(), e);
                Ok(false)
            }
        }
    }

    async fn repair(&self, dir: &Path, remove_par2: bool, token: &CancellationToken) -> Result<()> {
        let par2_files = par2_list(dir)?;
        let (Some(index), Some(par2)) = (par2_files.first(), self.strategy.par2()) else {
            return Ok(());
        };

        self.exec(par2, dir, &Self::par2_args("r", index), token)
            .await?;
        if remove_par2 {
            remove_all(&par2_files).await;
        }
        Ok(())
    }

    async fn extract(
        &self,
        dir: &Path,
        remove_archives: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let archives = archive_list(dir)?;
        let Some(first) = archives
            .iter()
            .find(|a| lowercase_extension(a) == "rar")
            .or_else(|| archives.first())
        else {
            return Ok(());
        };

        let Some((program, args)) = self.strategy.extract_command(first) else {
            tracing::warn!("No extractor for {}", first.display());
            return Ok(());
        };

        self.exec(&program, dir, &args, token).await?;
        if remove_archives {
            remove_all(&archive_list(dir)?).await;
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.slot.close();
    }
}
