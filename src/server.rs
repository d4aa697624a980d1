//! Request dispatch and the accept loop
//!
//! All paths funnel through one dispatcher that routes on the HTTP method,
//! mirroring the storage layout: GET/HEAD resolves files (falling back to the
//! peers), POST uploads into a group, PUT takes replicated blobs and the
//! resync manifest exchange. The accept loop is hand-rolled so each
//! connection's socket can be registered with the connection tracker for
//! graceful shutdown.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tower::Service;

use crate::config::{Config, SHUTDOWN_TIMEOUT, STATISTICS_PATH};
use crate::error::VermError;
use crate::forwarding::{forward_read, should_forward_read};
use crate::httputil::{clean_path, last_query_value};
use crate::logging::*;
use crate::mime_types::MimeTable;
use crate::missing::serve_missing;
use crate::replication::PeerSet;
use crate::statistics::Statistics;
use crate::store::serve_file;
use crate::tracker::ConnectionTracker;
use crate::uploader::upload_file;

// this form is for manual testing; API clients should use raw posts against
// an application-specific directory name
const UPLOAD_FORM: &str = "<!DOCTYPE html><html><head><title>Verm - Upload</title></head><body>\
	<form method='post' enctype='multipart/form-data'>\
	<input type='hidden' name='redirect' value='1'/>\
	<input type='file' name='uploaded_file'/>\
	<input type='submit' value='Upload'/>\
	</form>\
	</body></html>\n";

/// Shared state behind every request handler
pub struct VermServer {
	pub root_data_dir: PathBuf,
	pub mime: MimeTable,
	pub peers: Arc<PeerSet>,
	pub statistics: Arc<Statistics>,
	pub quiet: bool,

	health_check_path: String,
	healthy_if_file: String,
	healthy_unless_file: String,
}

impl VermServer {
	pub fn new(config: &Config) -> Result<Arc<VermServer>, Box<dyn std::error::Error>> {
		let mut mime = MimeTable::new();
		mime.load_mime_file(&config.mime_types_file);

		let statistics = Arc::new(Statistics::new()?);
		let peers = Arc::new(PeerSet::new(
			&config.replication_targets,
			&config.root_data_dir,
			statistics.clone(),
			config.replication_workers,
		)?);

		Ok(Arc::new(VermServer {
			root_data_dir: config.root_data_dir.clone(),
			mime,
			peers,
			statistics,
			quiet: config.quiet,
			health_check_path: add_leading_slash(&config.health_check_path),
			healthy_if_file: add_leading_slash(&config.healthy_if_file),
			healthy_unless_file: add_leading_slash(&config.healthy_unless_file),
		}))
	}

	/// Spawn the replication workers and queue the startup resync round
	pub fn start_replication(&self) {
		self.peers.start();
		self.peers.request_resync_all();
	}
}

fn add_leading_slash(path: &str) -> String {
	if !path.is_empty() && !path.starts_with('/') {
		format!("/{}", path)
	} else {
		path.to_string()
	}
}

/// Build the router; a single fallback handler does all the dispatching
pub fn router(server: Arc<VermServer>) -> Router {
	Router::new().fallback(dispatch).with_state(server)
}

async fn dispatch(State(server): State<Arc<VermServer>>, req: Request) -> Response {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let remote = req
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|info| info.0.to_string())
		.unwrap_or_else(|| "-".to_string());

	let response = if method == Method::GET || method == Method::HEAD {
		serve_get_or_head(&server, req).await
	} else if method == Method::POST {
		serve_post(&server, req).await
	} else if method == Method::PUT {
		serve_put(&server, req).await
	} else {
		error_response(&VermError::MethodNotSupported)
	};

	if !server.quiet {
		info!("{} \"{} {}\" {}", remote, method, path, response.status().as_u16());
	}
	response
}

async fn serve_get_or_head(server: &VermServer, req: Request) -> Response {
	let head = *req.method() == Method::HEAD;
	let path = req.uri().path();

	if path == "/" {
		return html_response(UPLOAD_FORM, head);
	}
	if path == STATISTICS_PATH {
		return serve_statistics(server, head);
	}
	if !server.health_check_path.is_empty() && path == server.health_check_path {
		return serve_health_check(server);
	}

	server.statistics.get_requests.inc();

	let cleaned = clean_path(path);
	if let Some(response) =
		serve_file(&server.root_data_dir, &server.mime, req.method(), req.headers(), &cleaned)
			.await
	{
		return response;
	}

	if !server.peers.is_empty() && should_forward_read(path, req.uri().query()) {
		let accept = req.headers().get(http::header::ACCEPT_ENCODING);
		if let Some(response) = forward_read(&server.peers, path, accept).await {
			server.statistics.get_requests_found_on_replica.inc();
			return response;
		}
	}

	server.statistics.get_requests_not_found.inc();
	error_response(&VermError::NotFound)
}

async fn serve_post(server: &VermServer, req: Request) -> Response {
	server.statistics.post_requests.inc();

	let query_redirect =
		req.uri().query().and_then(|q| last_query_value(q, "redirect")) == Some("1");

	match upload_file(server, req, false).await {
		Ok(outcome) => {
			if outcome.new_file {
				server.statistics.post_requests_new_file_stored.inc();
			}
			let status = if query_redirect || outcome.redirect {
				StatusCode::SEE_OTHER
			} else {
				StatusCode::CREATED
			};
			created_response(status, &outcome.location)
		}
		Err(e) => {
			server.statistics.post_requests_failed.inc();
			error_response(&e)
		}
	}
}

async fn serve_put(server: &VermServer, req: Request) -> Response {
	server.statistics.put_requests.inc();

	if req.uri().path() == crate::config::REPLICATION_MISSING_FILES_PATH {
		server.statistics.put_requests_missing_file_checks.inc();
		return match serve_missing(server, req).await {
			Ok(response) => response,
			Err(e) => error_response(&e),
		};
	}

	match upload_file(server, req, true).await {
		Ok(outcome) => {
			if outcome.new_file {
				server.statistics.put_requests_new_file_stored.inc();
			}
			created_response(StatusCode::CREATED, &outcome.location)
		}
		Err(e) => {
			server.statistics.put_requests_failed.inc();
			error_response(&e)
		}
	}
}

fn serve_statistics(server: &VermServer, head: bool) -> Response {
	server.peers.update_queue_gauges(&server.statistics);
	match server.statistics.render() {
		Ok(rendered) => {
			let body = if head { Body::empty() } else { Body::from(rendered) };
			Response::builder()
				.status(StatusCode::OK)
				.header(CONTENT_TYPE, "text/plain; version=0.0.4")
				.body(body)
				.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
		}
		Err(e) => {
			error!("couldn't render statistics: {}", e);
			plain_response(StatusCode::INTERNAL_SERVER_ERROR, "couldn't render statistics\n")
		}
	}
}

fn serve_health_check(server: &VermServer) -> Response {
	if !server.healthy_if_file.is_empty()
		&& std::fs::metadata(&server.healthy_if_file).is_err()
	{
		return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Offline\n");
	}
	if !server.healthy_unless_file.is_empty()
		&& std::fs::metadata(&server.healthy_unless_file).is_ok()
	{
		return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Offline\n");
	}
	plain_response(StatusCode::OK, "Online\n")
}

fn html_response(content: &'static str, head: bool) -> Response {
	let body = if head { Body::empty() } else { Body::from(content) };
	Response::builder()
		.status(StatusCode::OK)
		.header(CONTENT_TYPE, "text/html; charset=utf-8")
		.body(body)
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn plain_response(status: StatusCode, message: &str) -> Response {
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(message.to_string()))
		.unwrap_or_else(|_| status.into_response())
}

fn created_response(status: StatusCode, location: &str) -> Response {
	Response::builder()
		.status(status)
		.header(LOCATION, location)
		.body(Body::empty())
		.unwrap_or_else(|_| status.into_response())
}

fn error_response(error: &VermError) -> Response {
	let status = StatusCode::from_u16(error.status_code())
		.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	plain_response(status, &format!("{}\n", error))
}

/// Accept connections until `shutdown` resolves, then drain gracefully
pub async fn serve<F>(server: Arc<VermServer>, listener: TcpListener, shutdown: F)
where
	F: std::future::Future<Output = ()>,
{
	let tracker = Arc::new(ConnectionTracker::new());
	let mut make_service =
		router(server.clone()).into_make_service_with_connect_info::<SocketAddr>();

	tokio::pin!(shutdown);
	loop {
		let (stream, remote_addr) = tokio::select! {
			_ = &mut shutdown => break,
			accepted = listener.accept() => match accepted {
				Ok(connection) => connection,
				Err(e) => {
					warn!("couldn't accept connection: {}", e);
					continue;
				}
			},
		};

		let fd = stream.as_raw_fd();
		set_tcp_keepalive(fd);

		let tower_service = match make_service.call(remote_addr).await {
			Ok(service) => service,
			Err(never) => match never {},
		};

		server.statistics.connections_current.inc();
		let connection_id = tracker.opened(fd);
		let tracker = tracker.clone();
		let statistics = server.statistics.clone();
		tokio::spawn(async move {
			let socket = TokioIo::new(stream);
			let hyper_service = TowerToHyperService::new(tower_service);
			if let Err(e) = auto::Builder::new(TokioExecutor::new())
				.serve_connection_with_upgrades(socket, hyper_service)
				.await
			{
				debug!("connection from {} ended: {}", remote_addr, e);
			}
			statistics.connections_current.dec();
			tracker.closed(connection_id);
		});
	}

	info!("waiting for open connections to finish");
	tracker.shutdown(SHUTDOWN_TIMEOUT).await;
}

/// Keep-alive so dead TCP connections (e.g. closing a laptop mid-download)
/// eventually go away
#[allow(unsafe_code)] // safe wrapper around system calls
fn set_tcp_keepalive(fd: RawFd) {
	let enable: libc::c_int = 1;
	let idle_secs: libc::c_int = 180;
	// SAFETY: setsockopt only reads the option values passed by pointer and
	// adjusts socket options; the descriptor stays valid and owned elsewhere.
	unsafe {
		libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_KEEPALIVE,
			&enable as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		);
		libc::setsockopt(
			fd,
			libc::IPPROTO_TCP,
			libc::TCP_KEEPIDLE,
			&idle_secs as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		);
	}
}


// vim: ts=4
