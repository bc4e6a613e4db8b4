//! Streaming of regular files with content-type, conditional and range support

use crate::error::{full_body, BoxError, GatewayBody, GatewayError};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// A single satisfiable byte range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Outcome of interpreting a Range header
#[derive(Debug, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range; send the whole file
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Interpret a `Range` header for a file of `file_size` bytes.
///
/// Only single `bytes=` ranges are honoured; malformed or multi-range headers
/// fall back to the full body.
pub fn parse_range(value: Option<&HeaderValue>, file_size: u64) -> RangeRequest {
    let Some(range) = value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return RangeRequest::Full;
    };
    if range.contains(',') {
        return RangeRequest::Full;
    }

    let Some((start_part, end_part)) = range.split_once('-') else {
        return RangeRequest::Full;
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    if start_part.is_empty() {
        let Ok(suffix) = end_part.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || file_size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: file_size.saturating_sub(suffix),
            end: file_size - 1,
        });
    }

    let Ok(start) = start_part.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if end_part.is_empty() {
        file_size.saturating_sub(1)
    } else {
        match end_part.parse::<u64>() {
            Ok(end) if end >= start => end.min(file_size.saturating_sub(1)),
            _ => return RangeRequest::Full,
        }
    };

    if start >= file_size {
        return RangeRequest::Unsatisfiable;
    }

    RangeRequest::Partial(ByteRange { start, end })
}

/// HTTP dates have one-second resolution
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

/// Content type inferred from the file extension
pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

/// Stream `path` to the client.
///
/// A file that vanished after resolution answers 404.
pub async fn serve_file(
    path: &Path,
    request_headers: &HeaderMap,
) -> Result<Response<GatewayBody>, GatewayError> {
    let io_error = |source: std::io::Error| {
        if source.kind() == std::io::ErrorKind::NotFound {
            GatewayError::NotFound(path.to_path_buf())
        } else {
            GatewayError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let metadata = file.metadata().await.map_err(io_error)?;
    let file_size = metadata.len();
    let modified = metadata.modified().ok().map(truncate_to_seconds);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(modified) = modified {
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }

    if let (Some(modified), Some(since)) = (
        modified,
        header_date(request_headers, header::IF_MODIFIED_SINCE),
    ) {
        if modified <= since {
            debug!(path = %path.display(), "Not modified");
            return Ok(builder
                .status(StatusCode::NOT_MODIFIED)
                .body(full_body(Bytes::new()))
                .expect("valid response builder"));
        }
    }

    // If-Range: only honour the range when the validator still matches
    let if_range_matches = match request_headers.get(header::IF_RANGE) {
        None => true,
        Some(_) => match (modified, header_date(request_headers, header::IF_RANGE)) {
            (Some(modified), Some(date)) => modified <= date,
            _ => false,
        },
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)
    } else {
        RangeRequest::Full
    };

    match range {
        RangeRequest::Unsatisfiable => Err(GatewayError::RangeNotSatisfiable(file_size)),
        RangeRequest::Partial(range) => {
            debug!(path = %path.display(), start = range.start, end = range.end, "Serving byte range");
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(io_error)?;
            let body = stream_body(file.take(range.length()));
            Ok(builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, file_size),
                )
                .header(header::CONTENT_LENGTH, range.length())
                .body(body)
                .expect("valid response builder"))
        }
        RangeRequest::Full => {
            debug!(path = %path.display(), size = file_size, "Serving file");
            Ok(builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, file_size)
                .body(stream_body(file))
                .expect("valid response builder"))
        }
    }
}

fn stream_body<R>(reader: R) -> GatewayBody
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    let stream = ReaderStream::new(reader)
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    StreamBody::new(stream).boxed()
}
