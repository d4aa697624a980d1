//! The serving side of the resync manifest exchange
//!
//! A peer PUTs a gzipped, line-delimited list of locations to `/_missing`;
//! the response is the subset this instance doesn't have. The response is
//! buffered so the request body is fully consumed before any response bytes
//! go out.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::StatusCode;

use crate::encoding::ContentEncoding;
use crate::error::VermError;
use crate::httputil::{clean_path, gzip_accepted};
use crate::logging::*;
use crate::server::VermServer;
use crate::store::data_path;

/// Read newline-delimited locations, tolerating a stream that ends in a
/// decode error - sync-flushed gzip manifests have no trailer, so the last
/// read of a batch fails rather than returning a clean EOF
pub fn read_location_lines(reader: impl Read) -> Vec<String> {
	let mut locations = Vec::new();
	for line in BufReader::new(reader).lines() {
		match line {
			Ok(line) => {
				let location = line.trim_end_matches('\r');
				if !location.is_empty() {
					locations.push(location.to_string());
				}
			}
			Err(_) => break,
		}
	}
	locations
}

/// Which of the given locations are absent from the local store?
///
/// Stat errors count as missing: that causes a replication attempt, which
/// will surface the real error.
pub async fn list_missing_files(root: &Path, locations: Vec<String>) -> Vec<String> {
	let mut missing = Vec::new();
	for location in locations {
		let cleaned = clean_path(&location);
		if !path_exists(root, &cleaned).await && !path_exists(root, &format!("{}.gz", cleaned)).await
		{
			debug!("'{}' needs replication", cleaned);
			missing.push(location);
		}
	}
	missing
}

async fn path_exists(root: &Path, location: &str) -> bool {
	match tokio::fs::metadata(data_path(root, location)).await {
		Ok(meta) => meta.is_file(),
		Err(_) => false,
	}
}

/// Handle `PUT /_missing`
pub async fn serve_missing(server: &VermServer, req: Request) -> Result<Response, VermError> {
	let encoding = match req.headers().get(CONTENT_ENCODING) {
		Some(value) => ContentEncoding::parse(value.to_str().unwrap_or("unparseable"))?,
		None => ContentEncoding::Identity,
	};
	let compress_response = gzip_accepted(req.headers());

	let body = axum::body::to_bytes(req.into_body(), usize::MAX)
		.await
		.map_err(|e| VermError::ReadBodyFailure { message: e.to_string() })?;

	let locations = read_location_lines(encoding.decoder(body.as_ref()));
	let missing = list_missing_files(&server.root_data_dir, locations).await;

	let mut plain = Vec::new();
	for location in &missing {
		plain.extend_from_slice(location.as_bytes());
		plain.extend_from_slice(b"\r\n");
	}

	let mut builder = Response::builder()
		.status(StatusCode::OK)
		.header(CONTENT_TYPE, "text/plain");
	let payload = if compress_response {
		builder = builder.header(CONTENT_ENCODING, "gzip");
		let mut compressor = GzEncoder::new(Vec::new(), Compression::default());
		compressor.write_all(&plain).map_err(VermError::Filesystem)?;
		compressor.finish().map_err(VermError::Filesystem)?
	} else {
		plain
	};

	builder
		.body(Body::from(payload))
		.map_err(|e| VermError::ReadBodyFailure { message: e.to_string() })
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	#[test]
	fn test_read_location_lines() {
		let input = b"/a/BC/Done.txt\r\n/a/BC/Dtwo.txt\r\n\r\n/a/BC/Dthree\n";
		let lines = read_location_lines(&input[..]);
		assert_eq!(lines, vec!["/a/BC/Done.txt", "/a/BC/Dtwo.txt", "/a/BC/Dthree"]);
	}

	#[tokio::test]
	async fn test_list_missing_files() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("grp/AB")).unwrap();
		fs::write(dir.path().join("grp/AB/Cpresent.txt"), b"here").unwrap();
		fs::write(dir.path().join("grp/AB/Cpacked.txt.gz"), b"here gz").unwrap();

		let asked = vec![
			"/grp/AB/Cpresent.txt".to_string(),
			"/grp/AB/Cpacked.txt".to_string(),
			"/grp/AB/Cabsent.txt".to_string(),
		];
		let missing = list_missing_files(dir.path(), asked).await;
		assert_eq!(missing, vec!["/grp/AB/Cabsent.txt"]);
	}

	#[tokio::test]
	async fn test_directories_count_as_missing() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("grp/AB")).unwrap();

		let missing = list_missing_files(dir.path(), vec!["/grp/AB".to_string()]).await;
		assert_eq!(missing, vec!["/grp/AB"]);
	}

	#[tokio::test]
	async fn test_path_traversal_is_cleaned() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("inside.txt"), b"x").unwrap();

		// "/../inside.txt" cleans to "/inside.txt", which exists
		let missing =
			list_missing_files(dir.path(), vec!["/../inside.txt".to_string()]).await;
		assert!(missing.is_empty());
	}
}

// vim: ts=4
