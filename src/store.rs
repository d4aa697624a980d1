//! Serving stored blobs: conditional requests, ranges, and on-disk gzip
//!
//! A location resolves to either the raw file or a `.gz`-suffixed sibling,
//! never both. Compressed blobs are passed through verbatim when the client
//! accepts gzip and decoded on the fly otherwise.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_compression::tokio::bufread::GzipDecoder;
use axum::body::Body;
use axum::response::Response;
use http::header::{
	ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
	LAST_MODIFIED, RANGE,
};
use http::{HeaderMap, Method, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio_util::io::ReaderStream;

use crate::httputil::{etag_matches, gzip_accepted, modified_since_matches, parse_range, ByteRange};
use crate::mime_types::MimeTable;

/// Join a rooted location onto the data directory
pub fn data_path(root: &Path, location: &str) -> PathBuf {
	root.join(location.trim_start_matches('/'))
}

/// A blob opened for serving
struct StoredFile {
	file: File,
	size: u64,
	mtime: SystemTime,
	compressed: bool,
}

async fn open_variant(root: &Path, location: &str, compressed: bool) -> Option<StoredFile> {
	let suffix = if compressed { ".gz" } else { "" };
	let path = data_path(root, &format!("{}{}", location, suffix));
	let file = File::open(&path).await.ok()?;
	let meta = file.metadata().await.ok()?;
	if !meta.is_file() {
		return None;
	}
	Some(StoredFile {
		file,
		size: meta.len(),
		mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
		compressed,
	})
}

/// Serve a blob from the local store, or `None` when it's absent and the
/// caller should try the peers.
pub async fn serve_file(
	root: &Path,
	mime: &MimeTable,
	method: &Method,
	headers: &HeaderMap,
	path: &str,
) -> Option<Response> {
	let stored = match open_variant(root, path, false).await {
		Some(f) => f,
		None => open_variant(root, path, true).await?,
	};

	// verm files are immutable, so the path works as a constant etag
	if modified_since_matches(headers, stored.mtime) || etag_matches(headers, path) {
		let response = Response::builder()
			.status(StatusCode::NOT_MODIFIED)
			.header(ETAG, path)
			.body(Body::empty())
			.ok()?;
		return Some(response);
	}

	// infer the content-type from the filename extension; always set a header
	// so nothing downstream sniffs the content and mislabels gzip data
	let extension = match path.rfind('.') {
		Some(idx) if !path[idx..].contains('/') => &path[idx..],
		_ => "",
	};
	let content_type = match mime.type_by_extension(extension) {
		"" => "application/octet-stream",
		t => t,
	};

	let mut builder = Response::builder()
		.header(LAST_MODIFIED, httpdate::fmt_http_date(stored.mtime))
		.header(ETAG, path)
		.header(CONTENT_TYPE, content_type);

	let head = *method == Method::HEAD;

	if !stored.compressed {
		return ranged_response(builder, stored, headers, head).await;
	}

	if gzip_accepted(headers) {
		builder = builder.header(CONTENT_ENCODING, "gzip");
		return ranged_response(builder, stored, headers, head).await;
	}

	// the client can't take gzip: decode on the fly. The decoded length isn't
	// known up front, so no content-length and no range support here.
	let mut response = builder.status(StatusCode::OK);
	let body = if head {
		Body::empty()
	} else {
		let decoder = GzipDecoder::new(BufReader::new(stored.file));
		Body::from_stream(ReaderStream::new(decoder))
	};
	response = response.header(ACCEPT_RANGES, "none");
	response.body(body).ok()
}

async fn ranged_response(
	builder: http::response::Builder,
	stored: StoredFile,
	headers: &HeaderMap,
	head: bool,
) -> Option<Response> {
	let mut file = stored.file;
	let range_header = headers.get(RANGE).and_then(|v| v.to_str().ok());

	match parse_range(range_header, stored.size) {
		ByteRange::Full => {
			let body = if head {
				Body::empty()
			} else {
				Body::from_stream(ReaderStream::new(file))
			};
			builder
				.status(StatusCode::OK)
				.header(ACCEPT_RANGES, "bytes")
				.header(CONTENT_LENGTH, stored.size)
				.body(body)
				.ok()
		}
		ByteRange::Partial { start, length } => {
			let body = if head {
				Body::empty()
			} else {
				file.seek(SeekFrom::Start(start)).await.ok()?;
				Body::from_stream(ReaderStream::new(file.take(length)))
			};
			builder
				.status(StatusCode::PARTIAL_CONTENT)
				.header(ACCEPT_RANGES, "bytes")
				.header(CONTENT_LENGTH, length)
				.header(
					CONTENT_RANGE,
					format!("bytes {}-{}/{}", start, start + length - 1, stored.size),
				)
				.body(body)
				.ok()
		}
		ByteRange::Unsatisfiable => builder
			.status(StatusCode::RANGE_NOT_SATISFIABLE)
			.header(CONTENT_RANGE, format!("bytes */{}", stored.size))
			.body(Body::empty())
			.ok(),
	}
}


// vim: ts=4
