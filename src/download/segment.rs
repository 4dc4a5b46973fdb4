use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::{DownloadError, Result};
use crate::nntp::ConnectionPool;

/// Attempts made for every segment before giving up on it
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// Pause between two attempts of the same segment
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// One article holding a slice of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub message_id: String,
    /// Declared size in bytes
    pub bytes: u64,
    /// 1-based position within the file
    pub number: u32,
    pub group: String,
    pub filename: PathBuf,
}

impl Segment {
    /// Fetch the raw article body over a pooled connection
    pub async fn download(&self, pool: &ConnectionPool, token: &CancellationToken) -> Result<Bytes> {
        token.check()?;
        let mut conn = pool.acquire().await?;
        token.check()?;

        conn.group(&self.group).await?;
        let body = conn.body(&self.message_id).await?;
        pool.release(conn);
        Ok(body)
    }

    /// [`Segment::download`], tried up to `attempts` times
    ///
    /// Cancellation and missing articles are not retried.
    pub async fn download_retry(
        &self,
        pool: &ConnectionPool,
        token: &CancellationToken,
        attempts: u32,
    ) -> Result<Bytes> {
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            match self.download(pool, token).await {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Segment {} of {} failed (attempt {}/{}): {}",
                        self.number,
                        self.filename.display(),
                        attempt,
                        attempts,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        _ = token.cancelled() => return Err(DownloadError::Cancelled.into()),
                    }
                }
                Err(e) => {
                    tracing::warn!("Segment {} failed for good: {}", self.message_id, e);
                }
            }
        }

        Err(DownloadError::SegmentFailed {
            message_id: self.message_id.clone(),
            filename: self.filename.display().to_string(),
            attempts,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::error::{Error, NntpError, NNTP_NO_SUCH_ARTICLE};
    use crate::testing::FakeServer;

    fn segment(message_id: &str) -> Segment {
        Segment {
            message_id: message_id.to_string(),
            bytes: 5,
            number: 1,
            group: "alt.binaries.test".to_string(),
            filename: PathBuf::from("file.bin"),
        }
    }

    #[tokio::test]
    async fn test_download_selects_group_and_fetches_body() {
        let server = FakeServer::new();
        server.article("a@x", b"hello".to_vec());
        let pool = server.pool(1);

        let body = segment("a@x")
            .download(&pool, &CancellationToken::none())
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(server.group_calls(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_connection_released_on_failure() {
        let server = FakeServer::new();
        let pool = server.pool(1);

        assert!(segment("missing@x")
            .download(&pool, &CancellationToken::none())
            .await
            .is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_one_failure() {
        let server = FakeServer::new();
        server.article("a@x", b"hello".to_vec());
        server.fail_article("a@x", 1, 503);
        let pool = server.pool(1);

        let body = segment("a@x")
            .download_retry(&pool, &CancellationToken::none(), 2)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(server.body_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_article_is_not_retried() {
        let server = FakeServer::new();
        let pool = server.pool(1);

        let err = segment("missing@x")
            .download_retry(&pool, &CancellationToken::none(), 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Nntp(NntpError::Response { code: NNTP_NO_SUCH_ARTICLE, .. })
        ));
        assert_eq!(server.body_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts() {
        let server = FakeServer::new();
        server.article("a@x", b"hello".to_vec());
        server.fail_article("a@x", 2, 500);
        let pool = server.pool(1);

        let err = segment("a@x")
            .download_retry(&pool, &CancellationToken::none(), 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Download(DownloadError::SegmentFailed { attempts: 2, .. })
        ));
        assert_eq!(server.body_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_acquire() {
        let server = FakeServer::new();
        let pool = server.pool(1);
        let source = CancellationSource::new();
        source.cancel();

        let err = segment("a@x")
            .download_retry(&pool, &source.token(), 2)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(server.connects(), 0);
    }
}
