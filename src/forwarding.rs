//! Transparent reads from peers when a file is absent locally
//!
//! GETs fan out to every peer in parallel with `?forward=0` appended so the
//! peers don't forward in turn; the first 200 wins and streams back to the
//! client. Everything else - 404s, transport errors, unexpected statuses - is
//! a miss.

use std::sync::LazyLock;

use axum::body::Body;
use axum::response::Response;
use futures::stream::{FuturesUnordered, StreamExt};
use http::header::{HeaderValue, ACCEPT_ENCODING};
use http::StatusCode;
use regex::Regex;

use crate::config::PeerAddress;
use crate::httputil::{copy_header_fields, replica_response_fields};
use crate::logging::*;
use crate::replication::PeerSet;

static HASHLIKE_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"/[A-Za-g][A-Za-z0-9_-]/[A-Za-g][A-Za-z0-9_-]{40}(\.[A-Za-z0-9]+|$)").unwrap()
});

/// Whether a local miss on this request should be retried on the peers
pub fn should_forward_read(path: &str, query: Option<&str>) -> bool {
	if let Some(query) = query {
		if crate::httputil::last_query_value(query, "forward") == Some("0") {
			return false;
		}
	}
	HASHLIKE_EXPRESSION.is_match(path)
}

/// Race GETs to every peer; return the winning response, or `None` when all
/// peers failed or didn't have the file
pub async fn forward_read(
	peers: &PeerSet,
	path: &str,
	accept_encoding: Option<&HeaderValue>,
) -> Option<Response> {
	let mut in_flight: FuturesUnordered<_> = peers
		.peers()
		.iter()
		.map(|peer| {
			fetch_from_replica(
				peers.proxy_client(),
				peer.address.clone(),
				path.to_string(),
				accept_encoding.cloned(),
			)
		})
		.collect();

	while let Some(result) = in_flight.next().await {
		if let Some(winner) = result {
			// dropping `in_flight` closes any slower in-flight responses
			return proxy_response(winner);
		}
	}
	None
}

async fn fetch_from_replica(
	client: &reqwest::Client,
	address: PeerAddress,
	path: String,
	accept_encoding: Option<HeaderValue>,
) -> Option<reqwest::Response> {
	let url = format!("http://{}{}?forward=0", address, path);
	let mut request = client.get(&url);
	if let Some(accept) = accept_encoding {
		request = request.header(ACCEPT_ENCODING, accept);
	}

	match request.send().await {
		Ok(resp) if resp.status() == reqwest::StatusCode::OK => Some(resp),
		Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => None,
		Ok(resp) => {
			warn!("HTTP error requesting {} from {}: {}", path, address, resp.status());
			None
		}
		Err(e) => {
			warn!("error requesting {} from {}: {}", path, address, e);
			None
		}
	}
}

fn proxy_response(upstream: reqwest::Response) -> Option<Response> {
	let mut builder = Response::builder().status(StatusCode::OK);
	if let Some(headers) = builder.headers_mut() {
		copy_header_fields(upstream.headers(), headers, &replica_response_fields());
	}
	builder.body(Body::from_stream(upstream.bytes_stream())).ok()
}


// vim: ts=4
