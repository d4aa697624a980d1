//! Runtime configuration and built-in defaults
//!
//! Configuration follows a priority chain: built-in defaults, then `VERM_*`
//! environment variables, then CLI flags (highest priority). The env/flag
//! wiring lives in `main.rs`; this module holds the resolved values.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/var/lib/verm";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3404;
pub const DEFAULT_MIME_TYPES_FILE: &str = "/etc/mime.types";

/// Uploads posted to `/` land here; the root directory itself would be unmanageable.
pub const DEFAULT_DIRECTORY_IF_NOT_GIVEN_BY_CLIENT: &str = "/default";

/// Form field name browsers post files under.
pub const UPLOADED_FILE_FIELD: &str = "uploaded_file";

/// Tempfiles staged during upload carry this name prefix; the resync
/// enumerator skips anything starting with it.
pub const UPLOAD_TEMPFILE_PREFIX: &str = "_upload";

pub const REPLICATION_BACKLOG: usize = 1_000_000;
pub const REPLICATION_MISSING_QUEUE_SIZE: usize = 10_000;
pub const REPLICATION_BACKOFF_BASE_DELAY: u64 = 1;
pub const REPLICATION_BACKOFF_MAX_DELAY: u64 = 60;
pub const REPLICATION_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub const REPLICATION_MISSING_FILES_PATH: &str = "/_missing";
pub const REPLICATION_MISSING_FILES_BATCH_SIZE: usize = 256 * 1024; // bytes, but only approximate
pub const REPLICATION_MISSING_FILES_BATCH_TIME: Duration = Duration::from_secs(1);

pub const REPLICA_PROXY_TIMEOUT: Duration = Duration::from_secs(15);

pub const STATISTICS_PATH: &str = "/_statistics";

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
	/// Root data directory; blobs live under `<root>/<group>/<XY>/<Z...>`
	pub root_data_dir: PathBuf,

	/// IP address to listen on
	pub listen_address: String,

	/// Port to listen on
	pub port: u16,

	/// UNIX mime.types file used to augment the built-in MIME table
	pub mime_types_file: PathBuf,

	/// Peers to replicate new uploads to, as `host` or `host:port`
	pub replication_targets: Vec<PeerAddress>,

	/// Replication workers per peer
	pub replication_workers: usize,

	/// Path served as a load-balancer health check (empty = disabled)
	pub health_check_path: String,

	/// Respond healthy only if this file exists under the data root
	pub healthy_if_file: String,

	/// Respond unhealthy if this file exists under the data root
	pub healthy_unless_file: String,

	/// Suppress per-request log lines
	pub quiet: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			root_data_dir: PathBuf::from(DEFAULT_ROOT),
			listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
			port: DEFAULT_PORT,
			mime_types_file: PathBuf::from(DEFAULT_MIME_TYPES_FILE),
			replication_targets: Vec::new(),
			replication_workers: default_worker_count(),
			health_check_path: String::new(),
			healthy_if_file: String::new(),
			healthy_unless_file: String::new(),
			quiet: false,
		}
	}
}

/// A replication peer's address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
	pub hostname: String,
	pub port: u16,
}

impl PeerAddress {
	/// Parse `host` or `host:port`; a missing port falls back to the default
	pub fn parse(value: &str) -> Self {
		match value.split_once(':') {
			Some((host, port)) => PeerAddress {
				hostname: host.to_string(),
				port: port.parse().unwrap_or(DEFAULT_PORT),
			},
			None => PeerAddress { hostname: value.to_string(), port: DEFAULT_PORT },
		}
	}

	/// Parse a comma-separated list of peer addresses, skipping empty entries
	pub fn parse_list(value: &str) -> Vec<Self> {
		value.split(',').filter(|s| !s.trim().is_empty()).map(|s| Self::parse(s.trim())).collect()
	}
}

impl std::fmt::Display for PeerAddress {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.hostname, self.port)
	}
}

fn default_worker_count() -> usize {
	std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}


// vim: ts=4
