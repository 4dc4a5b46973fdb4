//! Test doubles shared by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{NntpError, Result, NNTP_NO_SUCH_ARTICLE};
use crate::nntp::{ConnectionPool, NntpSession};

/// Encode `data` as a yEnc article body, optionally as part `(number, begin, total_size)`
pub(crate) fn yenc_article(name: &str, data: &[u8], part: Option<(u32, u64, u64)>) -> Vec<u8> {
    let mut out = Vec::new();
    match part {
        Some((number, begin, total)) => {
            out.extend_from_slice(
                format!("=ybegin part={} line=128 size={} name={}\r\n", number, total, name)
                    .as_bytes(),
            );
            out.extend_from_slice(
                format!("=ypart begin={} end={}\r\n", begin, begin + data.len() as u64 - 1)
                    .as_bytes(),
            );
        }
        None => {
            out.extend_from_slice(
                format!("=ybegin line=128 size={} name={}\r\n", data.len(), name).as_bytes(),
            );
        }
    }

    let mut column = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let critical = matches!(encoded, 0 | b'\n' | b'\r' | b'=')
            || (column == 0 && matches!(encoded, b'.' | b'\t' | b' '));
        if critical {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            column += 2;
        } else {
            out.push(encoded);
            column += 1;
        }
        if column >= 128 {
            out.extend_from_slice(b"\r\n");
            column = 0;
        }
    }
    if column > 0 {
        out.extend_from_slice(b"\r\n");
    }

    match part {
        Some((number, _, _)) => out.extend_from_slice(
            format!("=yend size={} part={}\r\n", data.len(), number).as_bytes(),
        ),
        None => out.extend_from_slice(format!("=yend size={}\r\n", data.len()).as_bytes()),
    }
    out
}

/// One file of an NZB fixture: subject, group and segment `(message_id, bytes)` list
pub(crate) struct NzbFixtureFile<'a> {
    pub subject: &'a str,
    pub group: &'a str,
    pub segments: Vec<(String, u64)>,
}

pub(crate) fn nzb_xml(files: &[NzbFixtureFile<'_>]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    for file in files {
        xml.push_str(&format!(
            "  <file subject=\"{}\">\n",
            file.subject.replace('"', "&quot;")
        ));
        xml.push_str(&format!(
            "    <groups><group>{}</group></groups>\n    <segments>\n",
            file.group
        ));
        for (number, (message_id, bytes)) in file.segments.iter().enumerate() {
            xml.push_str(&format!(
                "      <segment bytes=\"{}\" number=\"{}\">{}</segment>\n",
                bytes,
                number + 1,
                message_id
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}

pub(crate) fn write_nzb(dir: &Path, name: &str, files: &[NzbFixtureFile<'_>]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, nzb_xml(files)).unwrap();
    path
}

/// Post `content` to `server` as `parts` articles and describe them as an NZB file entry
pub(crate) fn post_file<'a>(
    server: &FakeServer,
    subject: &'a str,
    name: &str,
    content: &[u8],
    parts: usize,
) -> NzbFixtureFile<'a> {
    let chunk = content.len().div_ceil(parts.max(1)).max(1);
    let mut segments = Vec::new();
    let mut begin = 1u64;
    for (index, data) in content.chunks(chunk).enumerate() {
        let message_id = format!("{}.part{}@fixture", name, index + 1);
        server.article(
            &message_id,
            yenc_article(name, data, Some((index as u32 + 1, begin, content.len() as u64))),
        );
        segments.push((message_id, data.len() as u64));
        begin += data.len() as u64;
    }
    NzbFixtureFile {
        subject,
        group: "alt.binaries.test",
        segments,
    }
}

#[derive(Default)]
struct Script {
    articles: HashMap<String, Bytes>,
    failures: HashMap<String, VecDeque<u16>>,
    failing_connects: usize,
}

/// In-memory news server answering with scripted article bodies
#[derive(Default)]
pub(crate) struct FakeServer {
    script: Mutex<Script>,
    connects: AtomicUsize,
    quits: AtomicUsize,
    body_calls: AtomicUsize,
    group_calls: AtomicUsize,
    delay_ms: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn article(&self, message_id: &str, raw: Vec<u8>) {
        let mut script = self.script.lock().unwrap();
        script
            .articles
            .insert(message_id.to_string(), Bytes::from(raw));
    }

    /// Answer `code` for the next `times` BODY requests of `message_id`
    pub fn fail_article(&self, message_id: &str, times: usize, code: u16) {
        let mut script = self.script.lock().unwrap();
        script
            .failures
            .entry(message_id.to_string())
            .or_default()
            .extend(std::iter::repeat(code).take(times));
    }

    pub fn fail_next_connects(&self, times: usize) {
        self.script.lock().unwrap().failing_connects = times;
    }

    /// Latency added to every BODY request
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }

    pub fn body_calls(&self) -> usize {
        self.body_calls.load(Ordering::SeqCst)
    }

    pub fn group_calls(&self) -> usize {
        self.group_calls.load(Ordering::SeqCst)
    }

    pub fn session(self: &Arc<Self>) -> FakeSession {
        FakeSession {
            server: self.clone(),
            connected: false,
            group: None,
        }
    }

    pub fn pool(self: &Arc<Self>, capacity: usize) -> ConnectionPool {
        let server = self.clone();
        ConnectionPool::new(capacity, move || Box::new(server.session())).unwrap()
    }
}

pub(crate) struct FakeSession {
    server: Arc<FakeServer>,
    connected: bool,
    group: Option<String>,
}

#[async_trait]
impl NntpSession for FakeSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(NntpError::AlreadyConnected.into());
        }
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.server.script.lock().unwrap();
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                return Err(NntpError::Response {
                    code: 502,
                    message: "service unavailable".to_string(),
                }
                .into());
            }
        }
        self.connected = true;
        Ok(())
    }

    async fn group(&mut self, name: &str) -> Result<()> {
        if !self.connected {
            return Err(NntpError::NotConnected.into());
        }
        if self.group.as_deref() != Some(name) {
            self.server.group_calls.fetch_add(1, Ordering::SeqCst);
            self.group = Some(name.to_string());
        }
        Ok(())
    }

    async fn body(&mut self, message_id: &str) -> Result<Bytes> {
        if !self.connected {
            return Err(NntpError::NotConnected.into());
        }
        self.server.body_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.server.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let mut script = self.server.script.lock().unwrap();
        if let Some(code) = script
            .failures
            .get_mut(message_id)
            .and_then(|codes| codes.pop_front())
        {
            return Err(NntpError::Response {
                code,
                message: "scripted failure".to_string(),
            }
            .into());
        }
        script
            .articles
            .get(message_id)
            .cloned()
            .ok_or_else(|| {
                NntpError::Response {
                    code: NNTP_NO_SUCH_ARTICLE,
                    message: "no such article".to_string(),
                }
                .into()
            })
    }

    async fn end(&mut self) -> Result<()> {
        self.server.quits.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        self.group = None;
        Ok(())
    }
}
