use std::io::{Read, Write};
use std::path::Path;

use axum::body::Body;
use axum::Router;
use http::header::{
	ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LOCATION,
	RANGE,
};
use http::{Method, Request, StatusCode};
use tempfile::TempDir;
use tower::ServiceExt;

use verm::config::Config;
use verm::server::{router, VermServer};
use verm::PeerAddress;

fn test_router(root: &Path, configure: impl FnOnce(&mut Config)) -> Router {
	let mut config = Config::default();
	config.root_data_dir = root.to_path_buf();
	config.mime_types_file = "/nonexistent/mime.types".into();
	config.replication_workers = 2;
	configure(&mut config);
	router(VermServer::new(&config).unwrap())
}

fn gzip(data: &[u8]) -> Vec<u8> {
	let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
	encoder.write_all(data).unwrap();
	encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
	let mut decoded = Vec::new();
	flate2::read::GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
	decoded
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
	axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn header<'a>(response: &'a axum::response::Response, name: http::HeaderName) -> Option<&'a str> {
	response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_upload_form_is_served_at_root() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response =
		app.oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let body = String::from_utf8(body_bytes(response).await).unwrap();
	assert!(body.contains("<form method='post' enctype='multipart/form-data'>"));
	assert!(body.contains("name='uploaded_file'"));
}

#[tokio::test]
async fn test_post_then_get_round_trip() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response = app
		.clone()
		.oneshot(
			Request::post("/test")
				.header(CONTENT_TYPE, "text/plain")
				.body(Body::from("hello"))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::CREATED);
	let location = header(&response, LOCATION).unwrap().to_string();
	assert!(location.starts_with("/test/"));
	assert!(location.ends_with(".txt"));

	let response = app
		.clone()
		.oneshot(Request::get(location.as_str()).body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, CONTENT_TYPE), Some("text/plain; charset=utf-8"));
	assert_eq!(header(&response, ETAG), Some(location.as_str()));
	assert_eq!(body_bytes(response).await, b"hello");

	// conditional request against the constant etag
	let response = app
		.clone()
		.oneshot(
			Request::get(location.as_str())
				.header(IF_NONE_MATCH, &location)
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

	// HEAD returns the same metadata and no body
	let response = app
		.clone()
		.oneshot(
			Request::builder()
				.method(Method::HEAD)
				.uri(location.as_str())
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, http::header::CONTENT_LENGTH), Some("5"));
	assert!(body_bytes(response).await.is_empty());

	// single byte ranges are honored
	let response = app
		.clone()
		.oneshot(
			Request::get(location.as_str())
				.header(RANGE, "bytes=1-3")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
	assert_eq!(header(&response, CONTENT_RANGE), Some("bytes 1-3/5"));
	assert_eq!(body_bytes(response).await, b"ell");
}

#[tokio::test]
async fn test_gzip_stored_blob_serving() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response = app
		.clone()
		.oneshot(
			Request::post("/test")
				.header(CONTENT_TYPE, "text/plain")
				.header(CONTENT_ENCODING, "gzip")
				.body(Body::from(gzip(b"hello")))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::CREATED);
	let location = header(&response, LOCATION).unwrap().to_string();

	// a client that accepts gzip gets the stored bytes as-is
	let response = app
		.clone()
		.oneshot(Request::get(location.as_str()).body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, CONTENT_ENCODING), Some("gzip"));
	assert_eq!(gunzip(&body_bytes(response).await), b"hello");

	// a client that doesn't gets the decoded stream
	let response = app
		.clone()
		.oneshot(
			Request::get(location.as_str())
				.header(ACCEPT_ENCODING, "identity")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, CONTENT_ENCODING), None);
	assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn test_post_redirect_parameter() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response = app
		.oneshot(
			Request::post("/test?redirect=1")
				.header(CONTENT_TYPE, "text/plain")
				.body(Body::from("hello"))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::SEE_OTHER);
	assert!(header(&response, LOCATION).unwrap().starts_with("/test/"));
}

#[tokio::test]
async fn test_unknown_paths_are_404() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response = app
		.oneshot(Request::get("/test/absent.txt").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsupported_method_is_405() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let response = app
		.oneshot(Request::delete("/test/file.txt").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_put_with_wrong_location_is_422() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |_| {});

	let bogus = format!("/foo/AB/C{}", "x".repeat(40));
	let response = app
		.oneshot(
			Request::put(bogus.as_str())
				.header(CONTENT_TYPE, "application/octet-stream")
				.body(Body::from("hello"))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_missing_file_exchange() {
	let root = TempDir::new().unwrap();
	std::fs::create_dir_all(root.path().join("grp/AB")).unwrap();
	std::fs::write(root.path().join("grp/AB/Cpresent.txt"), b"here").unwrap();
	std::fs::write(root.path().join("grp/AB/Cpacked.txt.gz"), b"here gz").unwrap();
	let app = test_router(root.path(), |_| {});

	let manifest = "/grp/AB/Cpresent.txt\r\n/grp/AB/Cpacked.txt\r\n/grp/AB/Cabsent.txt\r\n";

	// gzip in, gzip out by default
	let response = app
		.clone()
		.oneshot(
			Request::put("/_missing")
				.header(CONTENT_TYPE, "text/plain")
				.header(CONTENT_ENCODING, "gzip")
				.body(Body::from(gzip(manifest.as_bytes())))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, CONTENT_ENCODING), Some("gzip"));
	assert_eq!(gunzip(&body_bytes(response).await), b"/grp/AB/Cabsent.txt\r\n");

	// identity in, identity out when the client asks for it
	let response = app
		.clone()
		.oneshot(
			Request::put("/_missing")
				.header(CONTENT_TYPE, "text/plain")
				.header(ACCEPT_ENCODING, "identity")
				.body(Body::from(manifest))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(header(&response, CONTENT_ENCODING), None);
	assert_eq!(body_bytes(response).await, b"/grp/AB/Cabsent.txt\r\n");

	// unsupported manifest encodings are rejected
	let response = app
		.oneshot(
			Request::put("/_missing")
				.header(CONTENT_TYPE, "text/plain")
				.header(CONTENT_ENCODING, "br")
				.body(Body::from(manifest))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_statistics_endpoint() {
	let root = TempDir::new().unwrap();
	let app = test_router(root.path(), |config| {
		config.replication_targets = PeerAddress::parse_list("replica1:3404");
	});

	// drive a request through so a counter moves
	let response = app
		.clone()
		.oneshot(Request::get("/test/absent.txt").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_FOUND);

	let response = app
		.oneshot(Request::get("/_statistics").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let body = String::from_utf8(body_bytes(response).await).unwrap();
	assert!(body.contains("# TYPE verm_get_requests_total counter"));
	assert!(body.contains("verm_get_requests_total 1"));
	assert!(body.contains("verm_get_requests_not_found_total 1"));
	assert!(body.contains("verm_replication_queue_length{target=\"replica1:3404\"} 0"));
}

#[tokio::test]
async fn test_health_check_files() {
	let root = TempDir::new().unwrap();
	let gate = root.path().join("up");
	let gate_str = gate.to_string_lossy().to_string();
	let app = test_router(root.path(), |config| {
		config.health_check_path = "healthz".to_string();
		config.healthy_if_file = gate_str.clone();
	});

	let response = app
		.clone()
		.oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

	std::fs::write(&gate, b"").unwrap();
	let response = app
		.oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_bytes(response).await, b"Online\n");
}

// vim: ts=4
