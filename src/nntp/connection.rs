use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_native_tls::TlsConnector;

use crate::config::UsenetConfig;
use crate::error::{NntpError, Result};

const AUTH_CONTINUE: u16 = 381;

/// One NNTP session as seen by the connection pool
#[async_trait]
pub trait NntpSession: Send {
    fn is_connected(&self) -> bool;

    /// Open the socket, read the greeting and authenticate
    async fn connect(&mut self) -> Result<()>;

    /// Select a newsgroup, skipping the round-trip when it is already selected
    async fn group(&mut self, name: &str) -> Result<()>;

    /// Fetch the raw (still yEnc encoded) body of an article
    async fn body(&mut self, message_id: &str) -> Result<Bytes>;

    /// Say goodbye and close the socket
    async fn end(&mut self) -> Result<()>;
}

struct Stream {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: Box<dyn AsyncWrite + Unpin + Send + Sync>,
}

/// Async NNTP connection over TCP or TLS
pub struct NntpConnection {
    config: Arc<UsenetConfig>,
    tls_connector: Option<Arc<TlsConnector>>,
    stream: Option<Stream>,
    current_group: Option<String>,
}

/// Build the TLS connector shared by every connection of a pool
///
/// Sharing one connector enables TLS session reuse across connections to the same server.
pub fn tls_connector(config: &UsenetConfig) -> Result<TlsConnector> {
    let mut tls_builder = native_tls::TlsConnector::builder();
    if !config.verify_ssl_certs {
        tls_builder.danger_accept_invalid_certs(true);
        tls_builder.danger_accept_invalid_hostnames(true);
    }
    Ok(TlsConnector::from(tls_builder.build()?))
}

/// Normalise an article id to its `<id>` form
pub fn bracket_message_id(message_id: &str) -> String {
    let trimmed = message_id.trim();
    let inner = trimmed.trim_start_matches('<').trim_end_matches('>');
    format!("<{}>", inner)
}

impl NntpConnection {
    /// Create a disconnected session; the socket is opened by [`NntpSession::connect`]
    pub fn new(config: Arc<UsenetConfig>, tls_connector: Option<Arc<TlsConnector>>) -> Self {
        Self {
            config,
            tls_connector,
            stream: None,
            current_group: None,
        }
    }

    fn timeout_secs(&self) -> u64 {
        self.config.timeout.max(1)
    }

    fn has_credentials(&self) -> bool {
        !self.config.username.is_empty()
    }

    /// Drop the socket without any protocol exchange
    fn destroy(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Socket to {} destroyed", self.config.server);
        }
        self.current_group = None;
    }

    async fn open_stream(&self) -> Result<Stream> {
        let addr = format!("{}:{}", self.config.server, self.config.port);
        let seconds = self.timeout_secs();

        let tcp_stream = timeout(Duration::from_secs(seconds), TcpStream::connect(&addr))
            .await
            .map_err(|_| NntpError::Timeout {
                seconds,
                operation: "connecting",
            })?
            .map_err(|e| NntpError::ConnectionFailed {
                server: self.config.server.clone(),
                port: self.config.port,
                source: e,
            })?;

        tcp_stream.set_nodelay(true)?;

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send + Sync>,
            Box<dyn AsyncWrite + Unpin + Send + Sync>,
        ) = if self.config.ssl {
            let connector = match &self.tls_connector {
                Some(shared) => shared.clone(),
                None => Arc::new(tls_connector(&self.config)?),
            };

            let tls_stream = timeout(
                Duration::from_secs(seconds),
                connector.connect(&self.config.server, tcp_stream),
            )
            .await
            .map_err(|_| NntpError::Timeout {
                seconds,
                operation: "negotiating TLS",
            })?
            .map_err(|e| NntpError::Tls(e.to_string()))?;

            let (read_half, write_half) = tokio::io::split(tls_stream);
            (Box::new(read_half), Box::new(write_half))
        } else {
            let (read_half, write_half) = tokio::io::split(tcp_stream);
            (Box::new(read_half), Box::new(write_half))
        };

        Ok(Stream {
            reader: BufReader::with_capacity(256 * 1024, reader),
            writer,
        })
    }

    async fn handshake(&mut self) -> Result<()> {
        self.read_response().await?;

        if self.has_credentials() {
            self.send_command(&format!("AUTHINFO USER {}", self.config.username))
                .await?;
            let (code, _) = self.read_response().await?;
            if code == AUTH_CONTINUE || code >= 300 {
                self.send_command(&format!("AUTHINFO PASS {}", self.config.password))
                    .await?;
                self.read_response().await?;
            }
        }

        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        let seconds = self.timeout_secs();
        if command.starts_with("AUTHINFO PASS") {
            tracing::debug!("> AUTHINFO PASS ********");
        } else {
            tracing::debug!("> {}", command);
        }

        let stream = self.stream.as_mut().ok_or(NntpError::NotConnected)?;
        let write = async {
            stream.writer.write_all(command.as_bytes()).await?;
            stream.writer.write_all(b"\r\n").await?;
            stream.writer.flush().await
        };

        match timeout(Duration::from_secs(seconds), write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.destroy();
                Err(NntpError::Io(e).into())
            }
            Err(_) => {
                self.destroy();
                Err(NntpError::Timeout {
                    seconds,
                    operation: "writing",
                }
                .into())
            }
        }
    }

    /// Read one CRLF-terminated line into `line`, under the socket timeout
    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<()> {
        let seconds = self.timeout_secs();
        let stream = self.stream.as_mut().ok_or(NntpError::NotConnected)?;

        match timeout(
            Duration::from_secs(seconds),
            stream.reader.read_until(b'\n', line),
        )
        .await
        {
            Ok(Ok(0)) => {
                self.destroy();
                Err(NntpError::ConnectionClosed.into())
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.destroy();
                Err(NntpError::Io(e).into())
            }
            Err(_) => {
                self.destroy();
                Err(NntpError::Timeout {
                    seconds,
                    operation: "reading",
                }
                .into())
            }
        }
    }

    /// Read a status line; codes of the 4xx and 5xx classes become errors
    async fn read_response(&mut self) -> Result<(u16, String)> {
        let mut line = Vec::with_capacity(128);
        self.read_line(&mut line).await?;

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        tracing::trace!("< {}", text);

        let (code, message) = parse_status(text)
            .ok_or_else(|| NntpError::MalformedResponse(text.to_string()))?;

        if code >= 400 {
            return Err(NntpError::Response { code, message }.into());
        }

        Ok((code, message))
    }

    /// Read a multi-line data block up to the lone-dot terminator, unstuffing dots
    async fn read_block(&mut self) -> Result<Bytes> {
        let mut body = Vec::with_capacity(1024 * 1024);
        let mut line = Vec::with_capacity(256);

        loop {
            line.clear();
            self.read_line(&mut line).await?;

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            if line.starts_with(b"..") {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
        }

        Ok(Bytes::from(body))
    }
}

fn parse_status(line: &str) -> Option<(u16, String)> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let code = parts.next()?.parse::<u16>().ok()?;
    let message = parts.next().unwrap_or("").trim().to_string();
    Some((code, message))
}

#[async_trait]
impl NntpSession for NntpConnection {
    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(NntpError::AlreadyConnected.into());
        }

        tracing::info!(
            "Connecting to {}:{}{}",
            self.config.server,
            self.config.port,
            if self.config.ssl { " (TLS)" } else { "" }
        );
        self.stream = Some(self.open_stream().await?);

        if let Err(e) = self.handshake().await {
            self.destroy();
            return Err(e);
        }

        tracing::info!("Connected to {}", self.config.server);
        Ok(())
    }

    async fn group(&mut self, name: &str) -> Result<()> {
        if self.current_group.as_deref() == Some(name) {
            return Ok(());
        }

        self.send_command(&format!("GROUP {}", name)).await?;
        self.read_response().await?;
        self.current_group = Some(name.to_string());
        Ok(())
    }

    async fn body(&mut self, message_id: &str) -> Result<Bytes> {
        let message_id = bracket_message_id(message_id);
        self.send_command(&format!("BODY {}", message_id)).await?;
        self.read_response().await?;
        self.read_block().await
    }

    async fn end(&mut self) -> Result<()> {
        tracing::info!("Disconnecting from {}", self.config.server);

        let quit = async {
            self.send_command("QUIT").await?;
            self.read_response().await.map(|_| ())
        };
        let result = quit.await;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.writer.shutdown().await;
        }
        self.current_group = None;

        result
    }
}
