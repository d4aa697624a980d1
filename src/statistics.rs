//! Request and replication counters exposed at `/_statistics`
//!
//! Counters are plain atomics underneath; the register is built once at
//! startup and shared. Exposition uses the Prometheus text format.

use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// The full set of metrics tracked by a server instance
pub struct Statistics {
	registry: Registry,

	pub get_requests: IntCounter,
	pub get_requests_found_on_replica: IntCounter,
	pub get_requests_not_found: IntCounter,
	pub post_requests: IntCounter,
	pub post_requests_new_file_stored: IntCounter,
	pub post_requests_failed: IntCounter,
	pub put_requests: IntCounter,
	pub put_requests_new_file_stored: IntCounter,
	pub put_requests_missing_file_checks: IntCounter,
	pub put_requests_failed: IntCounter,
	pub replication_push_attempts: IntCounter,
	pub replication_push_attempts_failed: IntCounter,
	pub connections_current: IntGauge,

	/// Per-peer backlog gauge, labelled `target="host:port"`; refreshed from
	/// the peers' unfinished-jobs counters at scrape time
	pub replication_queue_length: IntGaugeVec,
}

impl Statistics {
	pub fn new() -> Result<Statistics, prometheus::Error> {
		let registry = Registry::new();

		let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
			let c = IntCounter::with_opts(Opts::new(name, help))?;
			registry.register(Box::new(c.clone()))?;
			Ok(c)
		};

		let get_requests = counter("verm_get_requests_total", "GET requests served")?;
		let get_requests_found_on_replica =
			counter("verm_get_requests_found_on_replica_total", "GET requests found on replica")?;
		let get_requests_not_found =
			counter("verm_get_requests_not_found_total", "GET requests not found")?;
		let post_requests = counter("verm_post_requests_total", "POST requests served")?;
		let post_requests_new_file_stored = counter(
			"verm_post_requests_new_file_stored_total",
			"POST requests resulting in a new file stored",
		)?;
		let post_requests_failed =
			counter("verm_post_requests_failed_total", "POST requests failed")?;
		let put_requests = counter("verm_put_requests_total", "PUT requests served")?;
		let put_requests_new_file_stored = counter(
			"verm_put_requests_new_file_stored_total",
			"PUT requests resulting in a new file stored",
		)?;
		let put_requests_missing_file_checks = counter(
			"verm_put_requests_missing_file_checks_total",
			"PUT requests checking for missing files",
		)?;
		let put_requests_failed = counter("verm_put_requests_failed_total", "PUT requests failed")?;
		let replication_push_attempts =
			counter("verm_replication_push_attempts_total", "Replication push attempts")?;
		let replication_push_attempts_failed = counter(
			"verm_replication_push_attempts_failed_total",
			"Replication push attempts failed",
		)?;

		let connections_current =
			IntGauge::with_opts(Opts::new("verm_connections_current", "HTTP connections"))?;
		registry.register(Box::new(connections_current.clone()))?;

		let replication_queue_length = IntGaugeVec::new(
			Opts::new(
				"verm_replication_queue_length",
				"Number of files in the queue to be replicated to each configured replica.",
			),
			&["target"],
		)?;
		registry.register(Box::new(replication_queue_length.clone()))?;

		Ok(Statistics {
			registry,
			get_requests,
			get_requests_found_on_replica,
			get_requests_not_found,
			post_requests,
			post_requests_new_file_stored,
			post_requests_failed,
			put_requests,
			put_requests_new_file_stored,
			put_requests_missing_file_checks,
			put_requests_failed,
			replication_push_attempts,
			replication_push_attempts_failed,
			connections_current,
			replication_queue_length,
		})
	}

	/// Render every registered metric in the text exposition format
	pub fn render(&self) -> Result<String, prometheus::Error> {
		let mut buffer = Vec::new();
		let encoder = TextEncoder::new();
		encoder.encode(&self.registry.gather(), &mut buffer)?;
		Ok(String::from_utf8_lossy(&buffer).into_owned())
	}
}


// vim: ts=4
