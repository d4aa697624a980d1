//! Small HTTP helpers shared by the serving and forwarding paths

use std::sync::LazyLock;
use std::time::SystemTime;

use http::header::{
	HeaderMap, ACCEPT_ENCODING, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use regex::Regex;

static GZIP_EXPRESSION: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\b(x-)?gzip\b").unwrap());

/// Whether the client can be sent a gzip-encoded response.
///
/// RFC 9110 says the "common" encodings are implicitly acceptable when the
/// client doesn't say otherwise, so an absent or empty Accept-Encoding counts
/// as acceptance.
pub fn gzip_accepted(headers: &HeaderMap) -> bool {
	match headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) {
		None | Some("") => true,
		Some(accept) => GZIP_EXPRESSION.is_match(accept),
	}
}

/// Copy the named header fields from `src` to `dst`, skipping absent ones
pub fn copy_header_fields(src: &HeaderMap, dst: &mut HeaderMap, fields: &[http::HeaderName]) {
	for field in fields {
		if let Some(value) = src.get(field) {
			dst.insert(field.clone(), value.clone());
		}
	}
}

/// Lexically resolve `.` and `..` segments and collapse repeated slashes.
///
/// Always returns a rooted path with no trailing slash (other than the root
/// path itself), so `<root> + cleaned` can never escape the data directory.
pub fn clean_path(path: &str) -> String {
	let mut stack: Vec<&str> = Vec::new();
	for segment in path.split('/') {
		match segment {
			"" | "." => {}
			".." => {
				stack.pop();
			}
			other => stack.push(other),
		}
	}
	if stack.is_empty() {
		"/".to_string()
	} else {
		format!("/{}", stack.join("/"))
	}
}

/// True when an `If-Modified-Since` header shows the client copy is current
pub fn modified_since_matches(headers: &HeaderMap, mtime: SystemTime) -> bool {
	let since = match headers.get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) {
		Some(value) => match httpdate::parse_http_date(value) {
			Ok(t) => t,
			Err(_) => return false,
		},
		None => return false,
	};

	// HTTP dates have second resolution; truncate the file time to match
	let mtime_secs = mtime.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs());
	let since_secs = since.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs());
	match (mtime_secs, since_secs) {
		(Ok(m), Ok(s)) => m <= s,
		_ => false,
	}
}

/// True when an `If-None-Match` header matches the file's ETag
pub fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
	match headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
		Some("*") => true,
		Some(value) => value.split(',').any(|candidate| candidate.trim() == etag),
		None => false,
	}
}

/// The last value of a query parameter, like Go's url.Values handling
pub fn last_query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
	query
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.filter(|(k, _)| *k == key)
		.map(|(_, value)| value)
		.next_back()
}

/// Header fields mirrored from a winning replica response
pub fn replica_response_fields() -> [http::HeaderName; 6] {
	[
		http::header::CONTENT_TYPE,
		http::header::CONTENT_ENCODING,
		http::header::CONTENT_LENGTH,
		http::header::CONTENT_RANGE,
		LAST_MODIFIED,
		ETAG,
	]
}

/// Outcome of parsing a `Range` request header against a representation size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
	/// No usable range; serve the full representation
	Full,
	/// Serve `length` bytes starting at `start`
	Partial { start: u64, length: u64 },
	/// The range cannot be satisfied; respond 416
	Unsatisfiable,
}

/// Parse a single-range `Range: bytes=...` header.
///
/// Multi-range requests and malformed headers fall back to the full
/// representation, which RFC 9110 permits a server to do.
pub fn parse_range(header: Option<&str>, size: u64) -> ByteRange {
	let spec = match header.and_then(|h| h.strip_prefix("bytes=")) {
		Some(s) => s.trim(),
		None => return ByteRange::Full,
	};
	if spec.contains(',') {
		return ByteRange::Full;
	}

	let (start_str, end_str) = match spec.split_once('-') {
		Some(parts) => parts,
		None => return ByteRange::Full,
	};

	if start_str.is_empty() {
		// suffix range: last N bytes
		let suffix: u64 = match end_str.parse() {
			Ok(n) => n,
			Err(_) => return ByteRange::Full,
		};
		if suffix == 0 {
			return ByteRange::Unsatisfiable;
		}
		let length = suffix.min(size);
		return ByteRange::Partial { start: size - length, length };
	}

	let start: u64 = match start_str.parse() {
		Ok(n) => n,
		Err(_) => return ByteRange::Full,
	};
	if start >= size {
		return ByteRange::Unsatisfiable;
	}
	let end: u64 = if end_str.is_empty() {
		size - 1
	} else {
		match end_str.parse::<u64>() {
			Ok(n) => n.min(size - 1),
			Err(_) => return ByteRange::Full,
		}
	};
	if end < start {
		return ByteRange::Full;
	}
	ByteRange::Partial { start, length: end - start + 1 }
}


// vim: ts=4
