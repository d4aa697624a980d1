//! A single replication peer: bounded job queues and the workers draining them
//!
//! Each peer owns two bounded queues. `new_files` takes fresh uploads with a
//! non-blocking send; when it overflows the file is dropped on the floor and a
//! resync is requested instead, which will find it again. `resync_files`
//! takes files a resync round reported missing, with a blocking send so the
//! manifest exchange is flow-controlled by replication progress. Workers pull
//! from whichever queue has work and retry each job until the peer accepts it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::config::{
	PeerAddress, REPLICATION_BACKLOG, REPLICATION_BACKOFF_BASE_DELAY,
	REPLICATION_BACKOFF_MAX_DELAY, REPLICATION_HTTP_TIMEOUT, REPLICATION_MISSING_QUEUE_SIZE,
};
use crate::logging::*;
use crate::statistics::Statistics;
use crate::store::data_path;

/// How long to wait after the given number of consecutive failures
pub fn backoff_duration(failures: u32) -> Duration {
	if failures <= 2 {
		return Duration::from_secs(REPLICATION_BACKOFF_BASE_DELAY);
	}
	let nominal = REPLICATION_BACKOFF_BASE_DELAY
		.saturating_mul(1u64.checked_shl(failures - 2).unwrap_or(u64::MAX));
	Duration::from_secs(nominal.min(REPLICATION_BACKOFF_MAX_DELAY))
}

enum PutOutcome {
	Replicated,
	SourceGone,
	Failed,
}

/// One configured replication target
pub struct Peer {
	pub address: PeerAddress,
	pub root: PathBuf,
	pub client: reqwest::Client,
	statistics: Arc<Statistics>,

	new_files_tx: async_channel::Sender<String>,
	new_files_rx: async_channel::Receiver<String>,
	resync_files_tx: async_channel::Sender<String>,
	resync_files_rx: async_channel::Receiver<String>,

	// capacity-1 flag channel: a failed send means a resync is already queued
	resync_tx: async_channel::Sender<()>,
	pub(crate) resync_rx: async_channel::Receiver<()>,

	// incremented when a job enters either queue, decremented when a worker
	// finishes it; exposed as the replication backlog gauge
	unfinished_jobs: AtomicI64,
}

impl Peer {
	pub fn new(
		address: PeerAddress,
		root: &Path,
		statistics: Arc<Statistics>,
		workers: usize,
	) -> Result<Arc<Peer>, reqwest::Error> {
		let client = reqwest::Client::builder()
			.timeout(REPLICATION_HTTP_TIMEOUT)
			.connect_timeout(REPLICATION_HTTP_TIMEOUT)
			.build()?;

		let new_capacity = REPLICATION_BACKLOG - REPLICATION_MISSING_QUEUE_SIZE - workers;
		let (new_files_tx, new_files_rx) = async_channel::bounded(new_capacity);
		let (resync_files_tx, resync_files_rx) =
			async_channel::bounded(REPLICATION_MISSING_QUEUE_SIZE);
		let (resync_tx, resync_rx) = async_channel::bounded(1);

		Ok(Arc::new(Peer {
			address,
			root: root.to_path_buf(),
			client,
			statistics,
			new_files_tx,
			new_files_rx,
			resync_files_tx,
			resync_files_rx,
			resync_tx,
			resync_rx,
			unfinished_jobs: AtomicI64::new(0),
		}))
	}

	/// Spawn this peer's replication workers and its resync driver
	pub fn start(self: &Arc<Self>, workers: usize) {
		for _ in 0..workers {
			let peer = self.clone();
			tokio::spawn(async move { peer.replicate_from_queues().await });
		}
		let peer = self.clone();
		tokio::spawn(async move { crate::resync::resync_from_queue(peer).await });
	}

	/// Non-blocking enqueue of a freshly stored file. A full queue converts
	/// into a resync request; the file will be caught by the next round.
	pub fn enqueue_new_file(&self, location: &str) {
		match self.new_files_tx.try_send(location.to_string()) {
			Ok(()) => {
				self.unfinished_jobs.fetch_add(1, Ordering::Relaxed);
			}
			Err(async_channel::TrySendError::Full(_)) => {
				warn!(
					"replication queue for {} is full, requesting resync instead",
					self.address
				);
				self.request_resync();
			}
			Err(async_channel::TrySendError::Closed(_)) => {}
		}
	}

	/// Blocking enqueue of a file a resync round reported missing; the
	/// backpressure here is what paces the manifest exchange
	pub async fn enqueue_resync_file(&self, location: String) {
		if self.resync_files_tx.send(location).await.is_ok() {
			self.unfinished_jobs.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Queue a resync; resyncs are idempotent, so if one is already queued
	/// the extra request is dropped
	pub fn request_resync(&self) {
		let _ = self.resync_tx.try_send(());
	}

	/// Current replication backlog for this peer
	pub fn unfinished_jobs(&self) -> i64 {
		self.unfinished_jobs.load(Ordering::Relaxed)
	}

	async fn replicate_from_queues(self: Arc<Self>) {
		loop {
			let location = tokio::select! {
				result = self.new_files_rx.recv() => match result {
					Ok(location) => location,
					Err(_) => return,
				},
				result = self.resync_files_rx.recv() => match result {
					Ok(location) => location,
					Err(_) => return,
				},
			};

			let mut failures: u32 = 0;
			loop {
				match self.put_blob(&location).await {
					PutOutcome::Replicated => {
						self.statistics.replication_push_attempts.inc();
						break;
					}
					PutOutcome::SourceGone => break,
					PutOutcome::Failed => {
						self.statistics.replication_push_attempts.inc();
						self.statistics.replication_push_attempts_failed.inc();
						failures += 1;
						let wait = backoff_duration(failures);
						debug!(
							"waiting {}s before retrying replication of {} to {}",
							wait.as_secs(),
							location,
							self.address
						);
						tokio::time::sleep(wait).await;
					}
				}
			}

			self.unfinished_jobs.fetch_sub(1, Ordering::Relaxed);
		}
	}

	/// PUT one blob to the peer, streaming the on-disk form as-is
	async fn put_blob(&self, location: &str) -> PutOutcome {
		let (file, compressed) =
			match File::open(data_path(&self.root, &format!("{}.gz", location))).await {
				Ok(f) => (f, true),
				Err(_) => match File::open(data_path(&self.root, location)).await {
					Ok(f) => (f, false),
					Err(_) => {
						// the file may have been renamed to a collision
						// suffix we don't track; the resync driver reconciles
						debug!(
							"couldn't open {} for replication to {}, skipping",
							location, self.address
						);
						return PutOutcome::SourceGone;
					}
				},
			};

		let url = format!("http://{}{}", self.address, location);
		let mut request = self
			.client
			.put(&url)
			// no need to know the original type, just replicate the filename
			.header(CONTENT_TYPE, "application/octet-stream")
			.body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
		if compressed {
			request = request.header(CONTENT_ENCODING, "gzip");
		}

		match request.send().await {
			Ok(resp) if resp.status().as_u16() == 201 => PutOutcome::Replicated,
			Ok(resp) => {
				warn!("HTTP error replicating {} to {}: {}", location, self.address, resp.status());
				PutOutcome::Failed
			}
			Err(e) => {
				warn!("error replicating {} to {}: {}", location, self.address, e);
				PutOutcome::Failed
			}
		}
	}
}


// vim: ts=4
