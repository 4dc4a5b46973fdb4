//! Cooperative cancellation
//!
//! A [`CancellationSource`] owns the right to cancel; the [`CancellationToken`]s
//! it hands out can only observe. Cancellation is one-way and idempotent, and
//! child sources are cancelled together with their parent.

use crate::error::{DownloadError, Result};

/// Read-only view of a cancellation flag, cheap to clone and pass around
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// A token that is never cancelled
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Fail fast with [`DownloadError::Cancelled`] once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.inner.is_cancelled() {
            tracing::debug!("Cancellation requested");
            return Err(DownloadError::Cancelled.into());
        }
        Ok(())
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

/// Owner side of a cancellation flag
#[derive(Debug, Default)]
pub struct CancellationSource {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that is cancelled whenever `parent` is
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            inner: parent.inner.child_token(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}
