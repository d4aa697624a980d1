//! Background reconciliation: enumerate local files, ask a peer what it's
//! missing, enqueue the answer
//!
//! One task scans the on-disk tree and pushes locations into a channel; a
//! second consumes that stream, batching locations into gzipped manifests and
//! PUTting each batch to the peer's `/_missing` endpoint. The peer answers
//! with the subset it doesn't have, which goes onto the regular replication
//! queue. The blocking enqueue there provides overall flow control: if
//! replication jobs aren't making it through, there's no point finding more
//! and more unreplicated files.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use walkdir::WalkDir;

use crate::config::{
	REPLICATION_MISSING_FILES_BATCH_SIZE, REPLICATION_MISSING_FILES_BATCH_TIME,
	REPLICATION_MISSING_FILES_PATH, UPLOAD_TEMPFILE_PREFIX,
};
use crate::encoding::ContentEncoding;
use crate::logging::*;
use crate::missing::read_location_lines;
use crate::peer::{backoff_duration, Peer};

// arbitrary buffer between the enumerator and the batcher, for some concurrency
const ENUMERATION_CHANNEL_SIZE: usize = 1000;

/// Drain this peer's resync flag forever, running one full round per request
pub async fn resync_from_queue(peer: Arc<Peer>) {
	loop {
		if peer.resync_rx.recv().await.is_err() {
			return;
		}

		info!("resyncing to {}", peer.address);
		let (tx, rx) = async_channel::bounded::<String>(ENUMERATION_CHANNEL_SIZE);
		let sender = tokio::spawn(send_file_lists(peer.clone(), rx));
		enumerate_files(peer.root.clone(), tx).await;
		let _ = sender.await;
		info!("resync to {} complete", peer.address);
	}
}

/// Walk the data tree depth-first, yielding each regular file's location with
/// any `.gz` suffix trimmed. Upload tempfiles are skipped; irregular entries
/// are logged and skipped.
pub async fn enumerate_files(root: PathBuf, locations: async_channel::Sender<String>) {
	let _ = tokio::task::spawn_blocking(move || {
		let walker = WalkDir::new(&root).min_depth(1).into_iter();
		for entry in walker
			.filter_entry(|e| !e.file_name().to_string_lossy().starts_with(UPLOAD_TEMPFILE_PREFIX))
		{
			let entry = match entry {
				Ok(e) => e,
				Err(e) => {
					warn!("error walking data directory: {}", e);
					continue;
				}
			};

			let file_type = entry.file_type();
			if file_type.is_dir() {
				continue;
			}
			if !file_type.is_file() {
				warn!("ignoring irregular directory entry {}", entry.path().display());
				continue;
			}

			let relative = match entry.path().strip_prefix(&root) {
				Ok(p) => p,
				Err(_) => continue,
			};
			let expanded = format!("/{}", relative.to_string_lossy());
			let location = expanded.strip_suffix(".gz").unwrap_or(&expanded).to_string();
			if locations.send_blocking(location).is_err() {
				return;
			}
		}
	})
	.await;
}

async fn send_file_lists(peer: Arc<Peer>, locations: async_channel::Receiver<String>) {
	// request bodies are simply a list of locations, one per line, gzipped. A
	// byte buffer backs the compressor rather than streaming straight into
	// the request, because a failed request has to retry the same list.
	let mut compressor = GzEncoder::new(Vec::new(), Compression::default());
	let mut something_to_send = false;

	loop {
		let location = tokio::select! {
			result = locations.recv() => match result {
				Ok(location) => location,
				Err(_) => break,
			},
			_ = tokio::time::sleep(REPLICATION_MISSING_FILES_BATCH_TIME), if something_to_send => {
				send_batch_until_successful(&peer, &mut compressor).await;
				something_to_send = false;
				continue;
			}
		};

		if let Err(e) = compressor
			.write_all(location.as_bytes())
			.and_then(|_| compressor.write_all(b"\r\n"))
		{
			error!("couldn't compress manifest line: {}", e);
			continue;
		}
		something_to_send = true;

		// the compressor flushes through to the backing buffer periodically;
		// once that reaches the batch size, send a request
		if compressor.get_ref().len() > REPLICATION_MISSING_FILES_BATCH_SIZE {
			send_batch_until_successful(&peer, &mut compressor).await;
			something_to_send = false;
		}
	}

	if something_to_send {
		send_batch_until_successful(&peer, &mut compressor).await;
	}
}

async fn send_batch_until_successful(peer: &Peer, compressor: &mut GzEncoder<Vec<u8>>) {
	if let Err(e) = compressor.flush() {
		error!("couldn't flush manifest compressor: {}", e);
	}

	let mut attempts: u32 = 0;
	loop {
		// the bytes are retained across attempts; only success resets them
		match send_file_list(peer, compressor.get_ref().clone()).await {
			Ok(()) => break,
			Err(message) => {
				warn!("couldn't check missing files on {}: {}", peer.address, message);
				attempts += 1;
				let wait = backoff_duration(attempts);
				debug!(
					"waiting {}s before resending file list to {}",
					wait.as_secs(),
					peer.address
				);
				tokio::time::sleep(wait).await;
			}
		}
	}

	*compressor = GzEncoder::new(Vec::new(), Compression::default());
}

async fn send_file_list(peer: &Peer, body: Vec<u8>) -> Result<(), String> {
	let url = format!("http://{}{}", peer.address, REPLICATION_MISSING_FILES_PATH);
	let resp = peer
		.client
		.put(&url)
		.header(CONTENT_TYPE, "text/plain")
		.header(CONTENT_ENCODING, "gzip")
		.body(body)
		.send()
		.await
		.map_err(|e| e.to_string())?;

	if resp.status().as_u16() != 200 {
		return Err(format!("HTTP {}", resp.status()));
	}

	queue_missing_files(peer, resp).await;
	Ok(())
}

/// The peer's response is the line-delimited subset of locations it lacks,
/// possibly gzip-encoded; every line becomes a replication job
async fn queue_missing_files(peer: &Peer, resp: reqwest::Response) {
	let encoding = resp
		.headers()
		.get(CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();

	let body = match resp.bytes().await {
		Ok(b) => b,
		Err(e) => {
			warn!("couldn't read missing-file list from {}: {}", peer.address, e);
			return;
		}
	};

	let decoder = match ContentEncoding::parse(&encoding) {
		Ok(enc) => enc.decoder(body.as_ref()),
		Err(e) => {
			warn!("couldn't decode missing-file list from {}: {}", peer.address, e);
			return;
		}
	};

	for location in read_location_lines(decoder) {
		peer.enqueue_resync_file(location).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	async fn collect_locations(root: PathBuf) -> Vec<String> {
		let (tx, rx) = async_channel::bounded(ENUMERATION_CHANNEL_SIZE);
		enumerate_files(root, tx).await;
		let mut found = Vec::new();
		while let Ok(location) = rx.try_recv() {
			found.push(location);
		}
		found.sort();
		found
	}

	#[tokio::test]
	async fn test_enumerate_trims_gz_and_skips_tempfiles() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("grp/AB")).unwrap();
		fs::write(dir.path().join("grp/AB/Cfile1.txt"), b"one").unwrap();
		fs::write(dir.path().join("grp/AB/Cfile2.txt.gz"), b"two").unwrap();
		fs::write(dir.path().join("grp/AB/_upload123456"), b"staging").unwrap();

		let found = collect_locations(dir.path().to_path_buf()).await;
		assert_eq!(found, vec!["/grp/AB/Cfile1.txt", "/grp/AB/Cfile2.txt"]);
	}

	#[tokio::test]
	async fn test_enumerate_keeps_collision_suffixes() {
		// collision variants replicate under their exact on-disk names; only
		// the .gz storage suffix is trimmed
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("grp/AB")).unwrap();
		fs::write(dir.path().join("grp/AB/Cfile_2.txt"), b"variant").unwrap();
		fs::write(dir.path().join("grp/AB/Cfile_3.txt.gz"), b"variant").unwrap();

		let found = collect_locations(dir.path().to_path_buf()).await;
		assert_eq!(found, vec!["/grp/AB/Cfile_2.txt", "/grp/AB/Cfile_3.txt"]);
	}

	#[tokio::test]
	async fn test_enumerate_descends_subdirectories() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
		fs::write(dir.path().join("a/b/c/deep.bin"), b"x").unwrap();

		let found = collect_locations(dir.path().to_path_buf()).await;
		assert_eq!(found, vec!["/a/b/c/deep.bin"]);
	}

	#[test]
	fn test_sync_flushed_batch_is_readable() {
		// batches are sync-flushed rather than finished, so the reader side
		// has to get all the lines out of a stream without a gzip trailer
		let mut compressor = GzEncoder::new(Vec::new(), Compression::default());
		compressor.write_all(b"/grp/AB/Cone.txt\r\n").unwrap();
		compressor.write_all(b"/grp/AB/Ctwo.txt\r\n").unwrap();
		compressor.flush().unwrap();

		let bytes = compressor.get_ref().clone();
		let lines = read_location_lines(ContentEncoding::Gzip.decoder(&bytes[..]));
		assert_eq!(lines, vec!["/grp/AB/Cone.txt", "/grp/AB/Ctwo.txt"]);
	}
}

// vim: ts=4
