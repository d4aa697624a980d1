//! The upload pipeline: stage, hash, place
//!
//! Request bodies are streamed once. The raw bytes are teed into a tempfile in
//! the target group directory while the decoded bytes feed a SHA-256 hasher;
//! the digest determines the canonical location and the tempfile is
//! hardlinked into place. Hardlink-then-compare is the placement primitive:
//! the filesystem rejects the second link of the same location, and comparing
//! decoded contents decides between an idempotent re-upload and a collision
//! variant. No in-process locks are involved.
//!
//! The decode, hash, and placement work runs on the blocking thread pool; the
//! request task only feeds it body chunks.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use axum::extract::multipart::{Field, Multipart};
use axum::extract::{FromRequest, Request};
use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::{
	DEFAULT_DIRECTORY_IF_NOT_GIVEN_BY_CLIENT, UPLOADED_FILE_FIELD, UPLOAD_TEMPFILE_PREFIX,
};
use crate::encoding::ContentEncoding;
use crate::error::VermError;
use crate::hash_path::encode_hash;
use crate::httputil::clean_path;
use crate::logging::*;
use crate::replication::PeerSet;
use crate::server::VermServer;
use crate::store::data_path;

const COMPARE_BUFFER_SIZE: usize = 65536;

/// Result of a completed upload
#[derive(Debug)]
pub struct UploadOutcome {
	/// Canonical location of the blob, suitable for the `Location` header
	pub location: String,

	/// Whether this upload placed a file that wasn't already stored
	pub new_file: bool,

	/// Whether a multipart form asked for a redirect response
	pub redirect: bool,
}

/// Stream an upload into the store.
///
/// When `replicating` is set the URL path is the full expected canonical
/// location (a peer pushing a blob it already placed); otherwise the path is
/// just the group prefix and the canonical location is derived from scratch.
pub async fn upload_file(
	server: &VermServer,
	req: Request,
	replicating: bool,
) -> Result<UploadOutcome, VermError> {
	// deal with '/..' etc.
	let mut path = clean_path(req.uri().path());

	let mut expected_location = None;
	if replicating {
		// the group is the path left after trimming the "/XY/Z..." segments
		let last_slash = path.rfind('/').unwrap_or(0);
		if last_slash < 3 {
			return Err(VermError::WrongLocation { location: path });
		}
		expected_location = Some(path.clone());
		path.truncate(last_slash - 3);
	}

	// don't allow uploads to the root directory itself, which would be unmanageable
	if path.len() <= 1 {
		path = DEFAULT_DIRECTORY_IF_NOT_GIVEN_BY_CLIENT.to_string();
	}

	let request_encoding = match req.headers().get(CONTENT_ENCODING) {
		Some(value) => ContentEncoding::parse(value.to_str().unwrap_or("unparseable"))?,
		None => ContentEncoding::Identity,
	};

	let content_type = media_type_or_default(
		req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
	);

	// make a tempfile in the requested (or default, as above) directory
	let directory = data_path(&server.root_data_dir, &path);
	tokio::fs::create_dir_all(&directory).await.map_err(VermError::Filesystem)?;
	let temp = tempfile::Builder::new()
		.prefix(UPLOAD_TEMPFILE_PREFIX)
		.tempfile_in(&directory)
		.map_err(VermError::Filesystem)?;

	// if the upload is a raw post, the input stream is the request body; if
	// it's a browser form, the file field supplies both the stream and the type
	if content_type == "multipart/form-data" {
		let mut multipart = Multipart::from_request(req, &())
			.await
			.map_err(|e| VermError::ReadBodyFailure { message: e.to_string() })?;

		let mut redirect = false;
		while let Some(field) = multipart.next_field().await? {
			if field.name() == Some(UPLOADED_FILE_FIELD) {
				let field_type = media_type_or_default(field.content_type());
				let mut outcome = drain_and_place(
					server,
					&path,
					expected_location,
					&field_type,
					request_encoding,
					ByteSource::Part(field),
					temp,
				)
				.await?;
				outcome.redirect = redirect;
				return Ok(outcome);
			} else if field.name() == Some("redirect") {
				redirect = field.text().await? == "1";
			}
		}

		Err(VermError::ReadBodyFailure {
			message: format!("multipart body has no {} field", UPLOADED_FILE_FIELD),
		})
	} else {
		drain_and_place(
			server,
			&path,
			expected_location,
			&content_type,
			request_encoding,
			ByteSource::Body(req.into_body().into_data_stream()),
			temp,
		)
		.await
	}
}

enum ByteSource<'a> {
	Body(axum::body::BodyDataStream),
	Part(Field<'a>),
}

impl ByteSource<'_> {
	async fn next_chunk(&mut self) -> Result<Option<Bytes>, VermError> {
		match self {
			ByteSource::Body(stream) => match stream.next().await {
				Some(Ok(bytes)) => Ok(Some(bytes)),
				Some(Err(e)) => Err(VermError::ReadBodyFailure { message: e.to_string() }),
				None => Ok(None),
			},
			ByteSource::Part(field) => field
				.chunk()
				.await
				.map_err(|e| VermError::ReadBodyFailure { message: e.to_string() }),
		}
	}
}

async fn drain_and_place(
	server: &VermServer,
	group: &str,
	expected_location: Option<String>,
	content_type: &str,
	request_encoding: ContentEncoding,
	mut source: ByteSource<'_>,
	temp: NamedTempFile,
) -> Result<UploadOutcome, VermError> {
	// determine the appropriate extension from the content type
	let extension = server.mime.extension_by_type(content_type).to_string();

	// if the file is both gzip-encoded and is actually a gzip file itself,
	// strip the redundant encoding; the decoded bytes go to disk and the file
	// is treated as a literal gzip archive
	let mut storage_encoding = request_encoding;
	let pre_decode = extension == ".gz" && !request_encoding.is_identity();
	if pre_decode {
		storage_encoding = ContentEncoding::Identity;
	}

	// the hasher sees the decoded stream: through the remaining content
	// encoding, and through the gzip archive framing for .gz files, so the
	// hash identifies the contained content no matter how it was transmitted
	// and peers with different on-disk encodings agree on the location
	let hash_decode = !storage_encoding.is_identity() || extension == ".gz";

	let tee_file = temp.reopen().map_err(VermError::Filesystem)?;

	// decompression, hashing, and placement are CPU- and disk-bound, so they
	// run on the blocking pool; this task only shuttles body chunks across a
	// small buffer. A read error is forwarded so the worker abandons the
	// upload instead of placing a truncated blob.
	let (chunk_tx, chunk_rx) = async_channel::bounded::<Result<Bytes, VermError>>(8);
	let root = server.root_data_dir.clone();
	let peers = server.peers.clone();
	let group = group.to_string();
	let worker = tokio::task::spawn_blocking(move || -> Result<UploadOutcome, VermError> {
		let tee = TeeWriter {
			file: tee_file,
			chain: if hash_decode {
				HashChain::Gunzip(GzDecoder::new(HashWriter::new()))
			} else {
				HashChain::Plain(HashWriter::new())
			},
		};
		let mut sink = if pre_decode {
			UploadSink::PreDecode(GzDecoder::new(tee))
		} else {
			UploadSink::Direct(tee)
		};

		while let Ok(item) = chunk_rx.recv_blocking() {
			sink.write_chunk(&item?)?;
		}
		let digest = sink.finish()?;

		temp.as_file().sync_all().map_err(VermError::Filesystem)?;

		place(&root, &peers, &group, expected_location, &extension, storage_encoding, &digest, temp)
	});

	loop {
		match source.next_chunk().await {
			// a send error means the sink already failed; its error surfaces below
			Ok(Some(chunk)) => {
				if chunk_tx.send(Ok(chunk)).await.is_err() {
					break;
				}
			}
			Ok(None) => break,
			Err(e) => {
				let _ = chunk_tx.send(Err(e)).await;
				break;
			}
		}
	}
	drop(chunk_tx);

	match worker.await {
		Ok(outcome) => outcome,
		Err(e) => Err(VermError::Filesystem(io::Error::new(io::ErrorKind::Other, e.to_string()))),
	}
}

/// The placement loop: hardlink the staged file at the canonical location,
/// falling back to content comparison and collision suffixes when the
/// location is already taken.
fn place(
	root: &Path,
	peers: &PeerSet,
	group: &str,
	expected_location: Option<String>,
	extension: &str,
	storage_encoding: ContentEncoding,
	digest: &[u8; 32],
	temp: NamedTempFile,
) -> Result<UploadOutcome, VermError> {
	let (dir, dst) = encode_hash(digest);
	let subpath = format!("{}{}", group, dir);

	std::fs::create_dir_all(data_path(root, &subpath)).map_err(VermError::Filesystem)?;

	let prefix = format!("{}{}", subpath, dst);
	let mut location = match expected_location {
		None => format!("{}{}", prefix, extension),
		Some(expected) => {
			// can't recreate the supplied path from the content; this is
			// effectively a checksum failure
			if !expected.starts_with(&prefix) || expected[prefix.len()..].contains('/') {
				return Err(VermError::WrongLocation { location: expected });
			}
			expected
		}
	};

	let mut new_file = true;
	let mut attempt = 1;
	loop {
		// if the upload was itself compressed, tack on the gzip suffix; this
		// changes only the filename and not the returned location
		let filename = data_path(root, &format!("{}{}", location, storage_encoding.suffix()));

		match std::fs::hard_link(temp.path(), &filename) {
			Ok(()) => break,
			Err(link_err) if link_err.kind() == io::ErrorKind::AlreadyExists => {
				// normal if it's the same file; check the contents match
				let existing = match File::open(&filename) {
					Ok(f) => f,
					// may not be a regular file, or not accessible to us
					Err(_) => return Err(VermError::Filesystem(link_err)),
				};
				let ours = temp.reopen().map_err(VermError::Filesystem)?;

				if same_decoded_contents(ours, existing, storage_encoding) {
					new_file = false;
					break;
				}

				// in practice a mismatch means corruption, since the chance
				// of finding a sha256 collision is low - but assume the best
				// and move to a suffixed filename
				attempt += 1;
				location = format!("{}_{}{}", prefix, attempt, extension);
			}
			Err(e) => return Err(VermError::Filesystem(e)),
		}
	}

	// the tempfile is moot at this point; drop unlinks it, then try to fsync
	// the directory so the new link survives a crash
	if let Err(e) = temp.close() {
		debug!("couldn't remove upload tempfile: {}", e);
	}
	if let Ok(dirnode) = File::open(data_path(root, &subpath)) {
		let _ = dirnode.sync_all();
	}

	if new_file {
		// replication jobs always name the location without the .gz
		// extension; that's how the filename is interpreted on resync too
		let job = location.strip_suffix(".gz").unwrap_or(&location);
		peers.enqueue_new_file(job);
	}

	Ok(UploadOutcome { location, new_file, redirect: false })
}

fn media_type_or_default(value: Option<&str>) -> String {
	match value.and_then(|s| s.parse::<mime::Mime>().ok()) {
		Some(m) => m.essence_str().to_string(),
		None => "application/octet-stream".to_string(),
	}
}

struct HashWriter {
	hasher: Sha256,
}

impl HashWriter {
	fn new() -> Self {
		HashWriter { hasher: Sha256::new() }
	}
}

impl Write for HashWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.hasher.update(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

enum HashChain {
	Plain(HashWriter),
	Gunzip(GzDecoder<HashWriter>),
}

impl HashChain {
	fn finish(self) -> io::Result<[u8; 32]> {
		let writer = match self {
			HashChain::Plain(w) => w,
			HashChain::Gunzip(decoder) => decoder.finish()?,
		};
		Ok(writer.hasher.finalize().into())
	}
}

impl Write for HashChain {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			HashChain::Plain(w) => w.write(buf),
			HashChain::Gunzip(d) => d.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			HashChain::Plain(w) => w.flush(),
			HashChain::Gunzip(d) => d.flush(),
		}
	}
}

/// Writes every byte to the staging file, then through the hash chain
struct TeeWriter {
	file: File,
	chain: HashChain,
}

impl Write for TeeWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.file.write_all(buf)?;
		self.chain.write_all(buf)?;
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.flush()?;
		self.chain.flush()
	}
}

enum UploadSink {
	Direct(TeeWriter),
	PreDecode(GzDecoder<TeeWriter>),
}

impl UploadSink {
	fn write_chunk(&mut self, buf: &[u8]) -> Result<(), VermError> {
		match self {
			UploadSink::Direct(tee) => tee.write_all(buf)?,
			UploadSink::PreDecode(decoder) => decoder.write_all(buf)?,
		}
		Ok(())
	}

	fn finish(self) -> Result<[u8; 32], VermError> {
		let tee = match self {
			UploadSink::Direct(tee) => tee,
			UploadSink::PreDecode(decoder) => decoder.finish()?,
		};
		Ok(tee.chain.finish()?)
	}
}

fn same_decoded_contents(ours: File, existing: File, encoding: ContentEncoding) -> bool {
	same_contents(encoding.decoder(ours), encoding.decoder(existing))
}

/// Block-by-block comparison; any read error counts as a mismatch
fn same_contents(mut stream1: impl Read, mut stream2: impl Read) -> bool {
	let mut contents1 = vec![0u8; COMPARE_BUFFER_SIZE];
	let mut contents2 = vec![0u8; COMPARE_BUFFER_SIZE];
	loop {
		let len1 = match read_full(&mut stream1, &mut contents1) {
			Ok(n) => n,
			Err(_) => return false,
		};
		let len2 = match read_full(&mut stream2, &mut contents2) {
			Ok(n) => n,
			Err(_) => return false,
		};

		if len1 == 0 && len2 == 0 {
			return true;
		}
		if len1 != len2 || contents1[..len1] != contents2[..len2] {
			return false;
		}
	}
}

/// Read until the buffer is full or the stream ends
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		match reader.read(&mut buf[filled..])? {
			0 => break,
			n => filled += n,
		}
	}
	Ok(filled)
}


// vim: ts=4
