//! Parsing of raw captured HTTP/1.x request payloads.
//!
//! A payload is exactly what a socket capture of a request looks like: a request
//! line, header lines, a blank line and an optional body. The parser is lenient
//! about everything except the pieces needed to replay the request: the
//! request line and the head/body delimiter.

use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning a payload into a [`ParsedRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No blank line separates the head from the body.
    #[error("cannot parse payload: no blank line between head and body")]
    MalformedPayload,
    /// The request line is not `METHOD TARGET HTTP/VERSION`.
    #[error("cannot parse payload, problem with request line: {0:?}")]
    MalformedHeaderLine(String),
}

/// A captured request, split into the parts needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRequest {
    pub method: String,
    /// Request target as captured, absolute (`http://host/a`) or origin-form (`/a`).
    pub url: String,
    /// Version digits only, e.g. `1.1`.
    pub http_version: String,
    /// Headers in the order their names were last seen, names in captured
    /// case. A repeated name keeps only its last value.
    pub headers: Vec<(String, String)>,
    /// Everything after the delimiter, untouched. `None` when empty.
    pub body: Option<Bytes>,
}

impl ParsedRequest {
    /// Looks a header up ignoring ASCII case. Of several case variants the
    /// one seen last wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rfind(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl FromStr for ParsedRequest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_request(s.as_bytes())
    }
}

/// Parse a raw payload.
///
/// The head ends at the first `\r?\n\r?\n`. The first head line must be the
/// request line; every other line is kept if it looks like `NAME: VALUE` and
/// dropped otherwise.
pub fn parse_request(payload: &[u8]) -> Result<ParsedRequest, ParseError> {
    let (head_end, body_start) = find_delimiter(payload).ok_or(ParseError::MalformedPayload)?;

    let head = std::str::from_utf8(&payload[..head_end])
        .map_err(|_| ParseError::MalformedHeaderLine("head is not valid UTF-8".to_string()))?;

    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let request_line = lines.next().unwrap_or_default();
    let (method, url, http_version) = parse_request_line(request_line)
        .ok_or_else(|| ParseError::MalformedHeaderLine(request_line.to_string()))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for (name, value) in lines.filter_map(parse_header_line) {
        headers.retain(|(seen, _)| seen != name);
        headers.push((name.to_string(), value.to_string()));
    }

    let body = &payload[body_start..];
    Ok(ParsedRequest {
        method: method.to_string(),
        url: url.to_string(),
        http_version: http_version.to_string(),
        headers,
        body: (!body.is_empty()).then(|| Bytes::copy_from_slice(body)),
    })
}

/// Returns `(end of head, start of body)` for the first blank line.
fn find_delimiter(payload: &[u8]) -> Option<(usize, usize)> {
    payload.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        let end = match payload.get(i + 1..) {
            Some([b'\n', ..]) => i + 2,
            Some([b'\r', b'\n', ..]) => i + 3,
            _ => return None,
        };
        let start = if i > 0 && payload[i - 1] == b'\r' { i - 1 } else { i };
        Some((start, end))
    })
}

fn parse_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.split(' ');
    let (method, target, protocol) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || method.is_empty() || target.is_empty() {
        return None;
    }
    let version = match protocol.get(..5) {
        Some(scheme) if scheme.eq_ignore_ascii_case("HTTP/") => &protocol[5..],
        _ => return None,
    };
    let well_formed = !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit() || b == b'.');
    well_formed.then_some((method, target, version))
}

fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim_end();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value.trim()))
}
