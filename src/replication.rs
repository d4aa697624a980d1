//! The set of configured replication peers
//!
//! Failures on one peer never block the others: every peer owns its queues,
//! workers, and resync driver, and fan-out operations just iterate.

use std::path::Path;
use std::sync::Arc;

use crate::config::{PeerAddress, REPLICA_PROXY_TIMEOUT};
use crate::peer::Peer;
use crate::statistics::Statistics;

pub struct PeerSet {
	peers: Vec<Arc<Peer>>,
	proxy_client: reqwest::Client,
	workers: usize,
}

impl PeerSet {
	pub fn new(
		addresses: &[PeerAddress],
		root: &Path,
		statistics: Arc<Statistics>,
		workers: usize,
	) -> Result<PeerSet, reqwest::Error> {
		let proxy_client = reqwest::Client::builder()
			.timeout(REPLICA_PROXY_TIMEOUT)
			.connect_timeout(REPLICA_PROXY_TIMEOUT)
			.build()?;

		let mut peers = Vec::with_capacity(addresses.len());
		for address in addresses {
			peers.push(Peer::new(address.clone(), root, statistics.clone(), workers)?);
		}

		Ok(PeerSet { peers, proxy_client, workers })
	}

	/// Spawn every peer's workers and resync driver
	pub fn start(&self) {
		for peer in &self.peers {
			peer.start(self.workers);
		}
	}

	pub fn peers(&self) -> &[Arc<Peer>] {
		&self.peers
	}

	pub fn proxy_client(&self) -> &reqwest::Client {
		&self.proxy_client
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	/// Enqueue a newly stored file for replication to every peer
	pub fn enqueue_new_file(&self, location: &str) {
		for peer in &self.peers {
			peer.enqueue_new_file(location);
		}
	}

	/// Request a resync round on every peer
	pub fn request_resync_all(&self) {
		for peer in &self.peers {
			peer.request_resync();
		}
	}

	/// Refresh the per-peer backlog gauges from the unfinished-jobs counters
	pub fn update_queue_gauges(&self, statistics: &Statistics) {
		for peer in &self.peers {
			statistics
				.replication_queue_length
				.with_label_values(&[&peer.address.to_string()])
				.set(peer.unfinished_jobs());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_enqueue_fans_out() {
		let statistics = Arc::new(Statistics::new().unwrap());
		let dir = tempfile::tempdir().unwrap();
		let addresses =
			[PeerAddress::parse("replica1:3404"), PeerAddress::parse("replica2:3404")];
		let peers = PeerSet::new(&addresses, dir.path(), statistics.clone(), 2).unwrap();

		peers.enqueue_new_file("/grp/AB/Cfile.txt");
		for peer in peers.peers() {
			assert_eq!(peer.unfinished_jobs(), 1);
		}

		peers.update_queue_gauges(&statistics);
		let rendered = statistics.render().unwrap();
		assert!(rendered.contains("verm_replication_queue_length{target=\"replica1:3404\"} 1"));
		assert!(rendered.contains("verm_replication_queue_length{target=\"replica2:3404\"} 1"));
	}

	#[tokio::test]
	async fn test_empty_peer_set() {
		let statistics = Arc::new(Statistics::new().unwrap());
		let dir = tempfile::tempdir().unwrap();
		let peers = PeerSet::new(&[], dir.path(), statistics, 2).unwrap();
		assert!(peers.is_empty());
		// harmless no-ops
		peers.enqueue_new_file("/grp/AB/Cfile.txt");
		peers.request_resync_all();
	}
}

// vim: ts=4
