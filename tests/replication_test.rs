//! End-to-end tests running real server instances on ephemeral ports:
//! asynchronous replication of new uploads, resync reconciliation, and
//! transparent read forwarding.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use verm::config::Config;
use verm::server::{serve, VermServer};
use verm::PeerAddress;

#[allow(dead_code)]
struct TestInstance {
	root: TempDir,
	server: Arc<VermServer>,
	port: u16,
	shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestInstance {
	fn url(&self, path: &str) -> String {
		format!("http://127.0.0.1:{}{}", self.port, path)
	}
}

async fn start_instance(peers: &str) -> TestInstance {
	let root = TempDir::new().unwrap();
	let mut config = Config::default();
	config.root_data_dir = root.path().to_path_buf();
	config.mime_types_file = "/nonexistent/mime.types".into();
	config.replication_workers = 2;
	config.quiet = true;
	if !peers.is_empty() {
		config.replication_targets = PeerAddress::parse_list(peers);
	}

	let server = VermServer::new(&config).unwrap();
	server.start_replication();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
	let serving = server.clone();
	tokio::spawn(async move {
		serve(serving, listener, async {
			let _ = shutdown_rx.await;
		})
		.await;
	});

	TestInstance { root, server, port, shutdown_tx }
}

async fn wait_for_200(client: &reqwest::Client, url: &str) -> reqwest::Response {
	for _ in 0..100 {
		if let Ok(resp) = client.get(url).send().await {
			if resp.status() == reqwest::StatusCode::OK {
				return resp;
			}
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	panic!("timed out waiting for 200 from {}", url);
}

#[tokio::test]
async fn test_new_uploads_replicate_to_peer() {
	let replica = start_instance("").await;
	let origin = start_instance(&format!("127.0.0.1:{}", replica.port)).await;

	let client = reqwest::Client::new();
	let response = client
		.post(origin.url("/test"))
		.header("Content-Type", "text/plain")
		.body("hello")
		.send()
		.await
		.unwrap();
	assert_eq!(response.status().as_u16(), 201);
	let location = response.headers()["location"].to_str().unwrap().to_string();

	// the replication worker pushes the blob across in the background
	let served = wait_for_200(&client, &replica.url(&location)).await;
	assert_eq!(served.bytes().await.unwrap().as_ref(), b"hello");

	// and the replica's copy is byte-identical on disk
	let stored = replica.root.path().join(location.trim_start_matches('/'));
	assert_eq!(std::fs::read(&stored).unwrap(), b"hello");
}

#[tokio::test]
async fn test_resync_reconciles_missing_files() {
	let replica = start_instance("").await;
	let origin = start_instance(&format!("127.0.0.1:{}", replica.port)).await;

	// learn the canonical location without touching either instance
	let scratch = start_instance("").await;
	let client = reqwest::Client::new();
	let response = client
		.post(scratch.url("/files"))
		.header("Content-Type", "text/plain")
		.body("resync payload")
		.send()
		.await
		.unwrap();
	let location = response.headers()["location"].to_str().unwrap().to_string();

	// drop the blob straight into the origin's tree, bypassing the upload
	// path, so nothing was ever enqueued for it
	let on_disk = origin.root.path().join(location.trim_start_matches('/'));
	std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
	std::fs::write(&on_disk, b"resync payload").unwrap();

	origin.server.peers.request_resync_all();

	let served = wait_for_200(&client, &replica.url(&location)).await;
	assert_eq!(served.bytes().await.unwrap().as_ref(), b"resync payload");
}

#[tokio::test]
async fn test_reads_forward_to_peers() {
	let replica = start_instance("").await;
	let origin = start_instance(&format!("127.0.0.1:{}", replica.port)).await;

	// the blob exists only on the replica
	let client = reqwest::Client::new();
	let response = client
		.post(replica.url("/test"))
		.header("Content-Type", "text/plain")
		.body("hello")
		.send()
		.await
		.unwrap();
	let location = response.headers()["location"].to_str().unwrap().to_string();

	let forwarded = client.get(origin.url(&location)).send().await.unwrap();
	assert_eq!(forwarded.status().as_u16(), 200);
	assert_eq!(
		forwarded.headers()["content-type"].to_str().unwrap(),
		"text/plain; charset=utf-8"
	);
	assert_eq!(forwarded.bytes().await.unwrap().as_ref(), b"hello");

	// suppressing forwarding turns the same request into a local miss
	let suppressed =
		client.get(format!("{}?forward=0", origin.url(&location))).send().await.unwrap();
	assert_eq!(suppressed.status().as_u16(), 404);
}

#[tokio::test]
async fn test_graceful_shutdown_stops_accepting() {
	let instance = start_instance("").await;
	let client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build().unwrap();

	let response = client.get(instance.url("/_statistics")).send().await.unwrap();
	assert_eq!(response.status().as_u16(), 200);

	let TestInstance { root: _root, server: _server, port, shutdown_tx } = instance;
	shutdown_tx.send(()).unwrap();

	// once the accept loop winds down, new connections are refused
	for _ in 0..100 {
		let url = format!("http://127.0.0.1:{}/_statistics", port);
		if client.get(&url).send().await.is_err() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("server kept accepting connections after shutdown");
}

// vim: ts=4
