//! Range operations on a remote object
//!
//! Each operation builds its request in the descriptor's transmit buffer,
//! runs it through [`retried_send_receive`] with the descriptor's retry
//! budget and validates the response.

use restblock_common::{Error, Result};
use tracing::{debug, error};

use crate::descriptor::ConnectionDescriptor;
use crate::exchange::{ResponseSize, retried_send_receive};
use crate::http::{self, MAX_HEADER_BYTES, Method, PUT_CONFIRMATION, StatusClass};

/// Metadata field holding the object size
pub const SIZE_FIELD: &str = "cdmi_size";

/// Size of the remote object in bytes
pub fn get_size(desc: &mut ConnectionDescriptor) -> Result<u64> {
    let attempts = desc.attempts();
    desc.prepare_metadata_request();
    let rcvd = retried_send_receive(desc, &[], ResponseSize::default(), attempts)?;
    let response = &desc.xmit[..rcvd];

    check_status(response, desc.url().path(), "getsize")?;

    let size = http::get_numeric_field(response, SIZE_FIELD).ok_or_else(|| {
        error!(path = desc.url().path(), "Cannot find object size in metadata");
        Error::remote(format!("no {SIZE_FIELD} in metadata of {}", desc.url().path()))
    })?;
    debug!(path = desc.url().path(), size, "Object size");
    Ok(size)
}

/// Read `length` bytes at `offset` into `segments`, in order.
///
/// The segments must add up to exactly `length`.
pub fn get_range(
    desc: &mut ConnectionDescriptor,
    offset: u64,
    length: usize,
    segments: &mut [&mut [u8]],
) -> Result<usize> {
    let total: usize = segments.iter().map(|s| s.len()).sum();
    let end = range_end(offset, length, total)?;

    desc.prepare_range_request(Method::Get, offset, end);
    let capacity = length
        .checked_add(MAX_HEADER_BYTES)
        .ok_or_else(|| Error::invalid_argument(format!("read of {length} bytes is too large")))?;
    let attempts = desc.attempts();
    let rcvd = retried_send_receive(desc, &[], ResponseSize::AtMost(capacity), attempts)?;
    let response = &desc.xmit[..rcvd];

    check_status(response, desc.url().path(), "getrange")?;

    let body = http::strip_header(response)
        .ok_or_else(|| Error::remote("getrange: malformed response"))?;
    if body.len() != length {
        error!(
            received = body.len(),
            expected = length,
            "getrange: unexpected body length"
        );
        return Err(Error::Incomplete {
            done: body.len(),
            expected: length,
        });
    }

    let mut cursor = 0;
    for segment in segments.iter_mut() {
        let len = segment.len();
        segment.copy_from_slice(&body[cursor..cursor + len]);
        cursor += len;
    }
    Ok(length)
}

/// Write `segments`, concatenated, at `offset`
pub fn put_range(desc: &mut ConnectionDescriptor, offset: u64, segments: &[&[u8]]) -> Result<()> {
    let length: usize = segments.iter().map(|s| s.len()).sum();
    let end = range_end(offset, length, length)?;

    let attempts = desc.attempts();
    desc.prepare_range_request(Method::Put, offset, end);
    let rcvd = retried_send_receive(desc, segments, ResponseSize::default(), attempts)?;
    let response = &desc.xmit[..rcvd];

    if response.starts_with(PUT_CONFIRMATION) {
        return Ok(());
    }

    let path = desc.url().path();
    match http::parse_status(response) {
        Some(404) => {
            error!(path, "putrange: object not found");
            Err(Error::RemoteNotFound(path.to_string()))
        }
        status => {
            error!(path, ?status, "putrange: unexpected confirmation");
            Err(Error::remote(format!(
                "putrange: unexpected confirmation for {path} (status {status:?})"
            )))
        }
    }
}

/// Last byte of a `length`-byte range at `offset`
fn range_end(offset: u64, length: usize, total: usize) -> Result<u64> {
    if length == 0 {
        return Err(Error::invalid_argument("empty range"));
    }
    if total != length {
        return Err(Error::invalid_argument(format!(
            "segments hold {total} bytes, range is {length}"
        )));
    }
    u64::try_from(length - 1)
        .ok()
        .and_then(|last| offset.checked_add(last))
        .ok_or_else(|| Error::invalid_argument("range end overflows"))
}

fn check_status(response: &[u8], path: &str, op: &str) -> Result<()> {
    let Some(status) = http::parse_status(response) else {
        error!(path, "{op}: cannot get http response status");
        return Err(Error::remote(format!("{op}: malformed response status")));
    };

    match http::status_class(status) {
        StatusClass::Success => Ok(()),
        _ if status == 404 => {
            error!(path, "{op}: object not found");
            Err(Error::RemoteNotFound(path.to_string()))
        }
        _ => {
            error!(path, status, "{op}: http error");
            Err(Error::remote(format!("{op}: http status {status} for {path}")))
        }
    }
}
