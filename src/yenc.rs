//! yEnc codec
//!
//! Articles carry a `=ybegin` header line, an optional `=ypart` line for
//! multi-part posts, the escaped payload and a `=yend` trailer. Decoding
//! drops line breaks, un-escapes `=`-prefixed bytes and removes the 42 offset.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::str::FromStr;

use crate::error::YencError;

const ESCAPE: u8 = b'=';
const ESCAPE_OFFSET: u8 = 64;
const OFFSET: u8 = 42;

static PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)part=(\d+)").unwrap());
static LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)line=(\d+)").unwrap());
static SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)size=(\d+)").unwrap());
static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)name=(.*)$").unwrap());
static BEGIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)begin=(\d+)").unwrap());
static END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)end=(\d+)").unwrap());

/// Parsed `=ybegin` / `=ypart` / `=yend` lines of one article
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Part number, present for multi-part posts
    pub part: Option<u32>,
    pub line: u32,
    /// Size of the whole file as declared in the header
    pub size: u64,
    pub name: String,
    /// 1-based byte range covered by this part (`=ypart begin= end=`)
    pub range: Option<(u64, u64)>,
    /// Size declared by the trailer (the part size for multi-part posts)
    pub trailer_size: u64,
    pub trailer_part: Option<u32>,
}

impl Envelope {
    /// Number of decoded bytes this article is expected to carry
    pub fn payload_size(&self) -> u64 {
        match self.range {
            Some((begin, end)) if end >= begin => end - begin + 1,
            _ => self.trailer_size,
        }
    }
}

/// Decode a yEnc payload (without envelope lines)
pub fn decode(payload: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(payload.len());
    let mut escaped = false;

    for &byte in payload {
        if byte == b'\r' || byte == b'\n' {
            continue;
        }
        if byte == ESCAPE && !escaped {
            escaped = true;
            continue;
        }
        let mut value = byte;
        if escaped {
            escaped = false;
            value = value.wrapping_sub(ESCAPE_OFFSET);
        }
        output.push(value.wrapping_sub(OFFSET));
    }

    output
}

/// Parse the envelope of a raw article body
pub fn parse_envelope(raw: &[u8]) -> Result<Envelope, YencError> {
    split(raw).map(|(envelope, _)| envelope)
}

/// Decode a raw article body into the bytes it carries.
///
/// `expected_size` is only used for diagnostics; callers decide what to do
/// with a size mismatch.
pub fn decode_to_buffer(raw: &[u8], expected_size: u64) -> Result<Vec<u8>, YencError> {
    let (envelope, payload) = split(raw)?;
    let decoded = decode(payload);

    if decoded.len() as u64 != envelope.payload_size() {
        tracing::debug!(
            "yEnc payload of {} decoded to {} bytes, envelope declares {}",
            envelope.name,
            decoded.len(),
            envelope.payload_size()
        );
    }
    if expected_size > 0 && decoded.len() as u64 > expected_size {
        tracing::debug!(
            "Decoded {} bytes for a segment declared as {} bytes",
            decoded.len(),
            expected_size
        );
    }

    Ok(decoded)
}

/// Isolate the envelope lines and the payload between them
fn split(raw: &[u8]) -> Result<(Envelope, &[u8]), YencError> {
    let data = trim_line_breaks(raw);

    let header_end = find_eol(data).ok_or(YencError::MissingHeader)?;
    let header = &data[..header_end];
    if !header.starts_with(b"=ybegin") {
        return Err(YencError::MissingHeader);
    }

    let trailer_start = rfind(data, b"=yend")
        .filter(|&idx| idx > header_end)
        .ok_or(YencError::MissingTrailer)?;
    let trailer_rest = &data[trailer_start..];
    let trailer = &trailer_rest[..find_eol(trailer_rest).unwrap_or(trailer_rest.len())];

    let mut payload = trim_line_breaks(&data[header_end..trailer_start]);

    let part = optional_number(&PART, header, "part")?;
    let mut range = None;
    if payload.starts_with(b"=ypart") {
        let part_end = find_eol(payload).unwrap_or(payload.len());
        let part_line = &payload[..part_end];
        range = Some((
            number(&BEGIN, part_line, "begin")?,
            number(&END, part_line, "end")?,
        ));
        payload = &payload[part_end..];
    } else if part.is_some() {
        return Err(YencError::MissingPart);
    }

    let name = NAME
        .captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string())
        .ok_or_else(|| invalid("name", header))?;

    let envelope = Envelope {
        part,
        line: number(&LINE, header, "line")?,
        size: number(&SIZE, header, "size")?,
        name,
        range,
        trailer_size: number(&SIZE, trailer, "size")?,
        trailer_part: optional_number(&PART, trailer, "part")?,
    };

    Ok((envelope, payload))
}

fn number<T: FromStr>(re: &Regex, line: &[u8], field: &'static str) -> Result<T, YencError> {
    optional_number(re, line, field)?.ok_or_else(|| invalid(field, line))
}

fn optional_number<T: FromStr>(
    re: &Regex,
    line: &[u8],
    field: &'static str,
) -> Result<Option<T>, YencError> {
    match re.captures(line).and_then(|caps| caps.get(1)) {
        None => Ok(None),
        Some(m) => std::str::from_utf8(m.as_bytes())
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| invalid(field, line)),
    }
}

fn invalid(field: &'static str, line: &[u8]) -> YencError {
    YencError::InvalidField {
        field,
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

fn find_eol(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\r' || b == b'\n')
}

fn trim_line_breaks(mut data: &[u8]) -> &[u8] {
    while let [b'\r' | b'\n', rest @ ..] = data {
        data = rest;
    }
    data
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
