use nzb_rs::Nzb as NzbRs;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::path::Path;
use std::str::FromStr;

use super::segment::Segment;
use crate::error::{NzbError, Result};

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:&quot;|")([^"]+?)(?:&quot;|")"#).unwrap());
static PART_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\(\d+/\d+\)\s*$").unwrap());
static FILE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<file\b((?:[^>"']|"[^"]*"|'[^']*')*)>"#).unwrap());
static ATTR_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static POSTER_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\sposter\s*=").unwrap());
static DATE_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\sdate\s*=").unwrap());

#[derive(Debug, Clone, Serialize)]
pub struct NzbSegment {
    pub bytes: u64,
    pub number: u32,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NzbFile {
    pub subject: String,
    pub groups: Vec<String>,
    pub segments: Vec<NzbSegment>,
}

impl NzbFile {
    /// Name of the file on disk, derived from the subject
    pub fn filename(&self) -> String {
        filename_from_subject(&self.subject)
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    /// Segments of this file, sorted by number, all tagged with the first declared group
    pub fn to_segments(&self, path: &Path) -> Result<Vec<Segment>> {
        let group = self
            .groups
            .first()
            .ok_or_else(|| NzbError::MissingGroup(self.subject.clone()))?;

        let mut segments: Vec<Segment> = self
            .segments
            .iter()
            .map(|s| Segment {
                message_id: s.message_id.clone(),
                bytes: s.bytes,
                number: s.number,
                group: group.clone(),
                filename: path.to_path_buf(),
            })
            .collect();
        segments.sort_by_key(|s| s.number);
        segments.dedup_by_key(|s| s.number);
        Ok(segments)
    }
}

/// Parsed NZB document
#[derive(Debug, Clone)]
pub struct Nzb {
    files: Vec<NzbFile>,
}

impl Nzb {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| NzbError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    fn parse_content(content: &str) -> Result<Self> {
        let inner = NzbRs::parse(fill_file_attributes(content))
            .map_err(|e| NzbError::ParseError(format!("Failed to parse NZB: {}", e)))?;

        let files: Vec<NzbFile> = inner
            .files
            .iter()
            .map(|file| NzbFile {
                subject: file.subject.clone(),
                groups: file.groups.clone(),
                segments: file
                    .segments
                    .iter()
                    .map(|segment| NzbSegment {
                        bytes: segment.size as u64,
                        number: segment.number,
                        message_id: segment.message_id.clone(),
                    })
                    .collect(),
            })
            .collect();

        if files.is_empty() {
            return Err(NzbError::EmptyNzb.into());
        }

        Ok(Nzb { files })
    }

    pub fn files(&self) -> &[NzbFile] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(NzbFile::total_size).sum()
    }

    pub fn total_segments(&self) -> usize {
        self.files.iter().map(|file| file.segments.len()).sum()
    }
}

impl FromStr for Nzb {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_content(s)
    }
}

/// Give every `<file>` element the `poster` and `date` attributes nzb-rs insists on
///
/// Only subject, groups and segments are read, so plenty of NZBs in the wild omit both.
fn fill_file_attributes(content: &str) -> Cow<'_, str> {
    FILE_TAG.replace_all(content, |caps: &regex::Captures<'_>| {
        let attributes = &caps[1];
        let names = ATTR_VALUE.replace_all(attributes, "\"\"");
        let mut tag = String::from("<file");
        if !POSTER_ATTR.is_match(&names) {
            tag.push_str(" poster=\"\"");
        }
        if !DATE_ATTR.is_match(&names) {
            tag.push_str(" date=\"0\"");
        }
        tag.push_str(attributes);
        tag.push('>');
        tag
    })
}

/// Extract a file name from a subject line like `[1/9] - "name.ext" yEnc (1/52)`
///
/// Quoted text wins. Otherwise a dangling quote and a trailing `(x/y)` part
/// marker are stripped. The result is made safe to use as a single path component.
pub fn filename_from_subject(subject: &str) -> String {
    if let Some(quoted) = QUOTED.captures(subject).and_then(|caps| caps.get(1)) {
        return sanitize_filename(quoted.as_str());
    }

    let mut name = subject.trim().to_string();
    for marker in ["&quot;", "\""] {
        if let Some(stripped) = name.strip_suffix(marker) {
            name = stripped.to_string();
        }
        if let Some(stripped) = name.strip_prefix(marker) {
            name = stripped.to_string();
        }
    }
    let name = PART_MARKER.replace(&name, "");
    sanitize_filename(name.trim())
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| {
            !matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"') && !c.is_control()
        })
        .collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned.to_string(),
    }
}

fn extension_is(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

pub fn is_par2(path: &Path) -> bool {
    extension_is(path, "par2")
}

pub fn is_nzb(path: &Path) -> bool {
    extension_is(path, "nzb")
}
