//! HTTP/1.1 framing for object range requests
//!
//! Requests are written into a caller-owned buffer so a connection can reuse
//! one allocation for every request it sends. Responses are inspected in
//! place: the exchange loop only needs to know when a response is complete,
//! and the range operations only need the status, the body and one numeric
//! field.

use std::borrow::Cow;
use std::fmt::Write as _;

/// Room reserved for the response status line and headers
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Exact status line a successful range write must answer with
pub const PUT_CONFIRMATION: &[u8] = b"HTTP/1.1 204 No Content";

/// Request method for range requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

impl Method {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

/// Coarse classification of a status code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

/// Build a range request for bytes `start..=end` of `path`.
///
/// Reads carry a `Range` header. Writes carry `Content-Range` and the
/// `Content-Length` of the payload, which is sent separately after the header.
pub fn write_range_request(
    out: &mut Vec<u8>,
    method: Method,
    host: &str,
    path: &str,
    start: u64,
    end: u64,
) {
    let mut head = String::with_capacity(128 + path.len());
    let _ = write!(head, "{} {path} HTTP/1.1\r\nHost: {host}\r\n", method.as_str());
    match method {
        Method::Get => {
            let _ = write!(head, "Range: bytes={start}-{end}\r\n");
        }
        Method::Put => {
            let _ = write!(
                head,
                "Content-Range: bytes {start}-{end}/*\r\nContent-Length: {}\r\n",
                end - start + 1
            );
        }
    }
    head.push_str("\r\n");

    out.clear();
    out.extend_from_slice(head.as_bytes());
}

/// Build a metadata request for `path`, answered with a CDMI object document
pub fn write_metadata_request(out: &mut Vec<u8>, host: &str, path: &str) {
    let mut head = String::with_capacity(160 + path.len());
    let _ = write!(
        head,
        "GET {path}?metadata HTTP/1.1\r\n\
         Host: {host}\r\n\
         Accept: application/cdmi-object\r\n\
         X-CDMI-Specification-Version: 1.0.1\r\n\r\n"
    );

    out.clear();
    out.extend_from_slice(head.as_bytes());
}

/// Parsed status line and framing headers
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    /// Offset of the first body byte
    body_start: usize,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    chunked: bool,
}

impl ResponseHead {
    /// Responses that never carry a body
    const fn is_bodiless(&self) -> bool {
        matches!(self.status, 100..=199 | 204 | 304)
    }
}

/// Find the position of `\r\n\r\n` in data, returns index of the first `\r`.
fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| {
        data[i] == b'\r' && data[i + 1] == b'\n' && data[i + 2] == b'\r' && data[i + 3] == b'\n'
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

/// Parse the response head, `None` until the header terminator arrived or if
/// the head is not valid HTTP.
fn parse_head(data: &[u8]) -> Option<ResponseHead> {
    let header_end = find_header_end(data)?;
    let text = std::str::from_utf8(&data[..header_end]).ok()?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status: u16 = parts.next()?.parse().ok()?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();

            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            }
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.eq_ignore_ascii_case("chunked")
            {
                chunked = true;
            }

            headers.push((name, value));
        }
    }

    Some(ResponseHead {
        status,
        body_start: header_end + 4,
        headers,
        content_length,
        chunked,
    })
}

/// Why a chunked body could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkError {
    /// More bytes are needed
    Incomplete,
    /// The body can never become valid
    Malformed,
}

/// Longest chunk-size line accepted, extensions included
const MAX_CHUNK_LINE: usize = 1024;

fn chunk_line(data: &[u8]) -> Result<usize, ChunkError> {
    match find_crlf(data) {
        Some(crlf) if crlf <= MAX_CHUNK_LINE => Ok(crlf),
        Some(_) => Err(ChunkError::Malformed),
        None if data.len() > MAX_CHUNK_LINE => Err(ChunkError::Malformed),
        None => Err(ChunkError::Incomplete),
    }
}

/// Decode a chunked body once the last chunk has arrived
fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut out = Vec::new();
    loop {
        let crlf = chunk_line(data)?;
        let size_line = std::str::from_utf8(&data[..crlf]).map_err(|_| ChunkError::Malformed)?;
        // Strip chunk extensions (;key=value).
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| ChunkError::Malformed)?;
        data = &data[crlf + 2..];

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                let end = chunk_line(data)?;
                if end == 0 {
                    return Ok(out);
                }
                data = &data[end + 2..];
            }
        }

        let end = size.checked_add(2).ok_or(ChunkError::Malformed)?;
        if data.len() < end {
            return Err(ChunkError::Incomplete);
        }
        if &data[size..end] != b"\r\n" {
            return Err(ChunkError::Malformed);
        }
        out.extend_from_slice(&data[..size]);
        data = &data[end..];
    }
}

/// Whether `data` holds a complete HTTP response.
///
/// A response is complete once its head has arrived and then:
/// - it has a bodiless status (1xx, 204, 304), or
/// - `Content-Length` bytes of body are present, or
/// - the terminating chunk of a chunked body is present, or
/// - it declares neither length nor chunking (empty body).
///
/// A head that is terminated but unparsable, or a chunked body that can never
/// become valid, counts as complete so the caller fails on it instead of
/// waiting for more bytes.
#[must_use]
pub fn is_response_complete(data: &[u8]) -> bool {
    if find_header_end(data).is_none() {
        return false;
    }
    let Some(head) = parse_head(data) else {
        return true;
    };
    if head.is_bodiless() {
        return true;
    }

    let body = &data[head.body_start..];
    if head.chunked {
        decode_chunked(body) != Err(ChunkError::Incomplete)
    } else if let Some(len) = head.content_length {
        body.len() >= len
    } else {
        true
    }
}

/// Status code of a response, `None` when the status line is malformed
#[must_use]
pub fn parse_status(data: &[u8]) -> Option<u16> {
    parse_head(data).map(|head| head.status)
}

#[must_use]
pub const fn status_class(status: u16) -> StatusClass {
    match status {
        100..=199 => StatusClass::Informational,
        200..=299 => StatusClass::Success,
        300..=399 => StatusClass::Redirection,
        400..=499 => StatusClass::ClientError,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::Unknown,
    }
}

/// Body of a complete response with the head stripped.
///
/// Chunked bodies are decoded into an owned buffer; anything else is borrowed
/// as every byte following the head.
#[must_use]
pub fn strip_header(data: &[u8]) -> Option<Cow<'_, [u8]>> {
    let head = parse_head(data)?;
    let body = &data[head.body_start..];
    if head.is_bodiless() {
        return Some(Cow::Borrowed(&[]));
    }
    if head.chunked {
        return decode_chunked(body).ok().map(Cow::Owned);
    }
    Some(Cow::Borrowed(body))
}

/// Look up a numeric field by name.
///
/// Response headers are searched first (case-insensitive), then the body is
/// parsed as JSON and searched at any depth. Values may be JSON numbers or
/// decimal strings.
#[must_use]
pub fn get_numeric_field(data: &[u8], name: &str) -> Option<u64> {
    let head = parse_head(data)?;
    if let Some((_, value)) = head
        .headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
    {
        return value.parse().ok();
    }

    let body = strip_header(data)?;
    let document: serde_json::Value = serde_json::from_slice(&body).ok()?;
    find_json_number(&document, name)
}

fn find_json_number(value: &serde_json::Value, name: &str) -> Option<u64> {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(name) {
                match found {
                    Value::Number(n) => return n.as_u64(),
                    Value::String(s) => return s.trim().parse().ok(),
                    _ => {}
                }
            }
            map.values().find_map(|v| find_json_number(v, name))
        }
        Value::Array(items) => items.iter().find_map(|v| find_json_number(v, name)),
        _ => None,
    }
}
