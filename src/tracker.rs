//! Live-connection tracking and two-phase graceful shutdown
//!
//! A single task owns the set of open connections; opens, closes, and the
//! shutdown request all arrive as messages. Shutdown first half-closes the
//! read side of every connection, so no new requests arrive but in-flight
//! responses finish; connections still alive at the deadline are closed hard.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::logging::*;

enum Event {
	Opened(u64, RawFd),
	Closed(u64),
	Shutdown(Duration, oneshot::Sender<()>),
}

/// Handle to the tracking task; cheap to share
pub struct ConnectionTracker {
	events: mpsc::UnboundedSender<Event>,
	next_id: AtomicU64,
}

impl ConnectionTracker {
	pub fn new() -> ConnectionTracker {
		let (events, rx) = mpsc::unbounded_channel();
		tokio::spawn(track(rx));
		ConnectionTracker { events, next_id: AtomicU64::new(1) }
	}

	/// Register a newly accepted connection; returns the id to close it with
	pub fn opened(&self, fd: RawFd) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let _ = self.events.send(Event::Opened(id, fd));
		id
	}

	pub fn closed(&self, id: u64) {
		let _ = self.events.send(Event::Closed(id));
	}

	/// Stop accepting request bytes on every connection, wait for in-flight
	/// responses up to `timeout`, then force-close the stragglers. Returns
	/// once every tracked connection is gone.
	pub async fn shutdown(&self, timeout: Duration) {
		let (done, finished) = oneshot::channel();
		if self.events.send(Event::Shutdown(timeout, done)).is_ok() {
			let _ = finished.await;
		}
	}

	/// True once the tracking task has exited
	pub fn is_closed(&self) -> bool {
		self.events.is_closed()
	}
}

impl Default for ConnectionTracker {
	fn default() -> Self {
		Self::new()
	}
}

async fn track(mut events: mpsc::UnboundedReceiver<Event>) {
	let mut connections: HashMap<u64, RawFd> = HashMap::new();
	let mut finished: Option<oneshot::Sender<()>> = None;
	let mut deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

	loop {
		tokio::select! {
			event = events.recv() => match event {
				Some(Event::Opened(id, fd)) => {
					connections.insert(id, fd);
				}
				Some(Event::Closed(id)) => {
					connections.remove(&id);
				}
				Some(Event::Shutdown(timeout, done)) => {
					debug!("shutting down {} open connections", connections.len());
					finished = Some(done);
					deadline = Some(Box::pin(tokio::time::sleep(timeout)));
					for fd in connections.values() {
						shutdown_read(*fd);
					}
				}
				None => return,
			},
			_ = async { deadline.as_mut().unwrap().await }, if deadline.is_some() => {
				warn!("forcing {} connections closed at shutdown deadline", connections.len());
				for fd in connections.values() {
					shutdown_both(*fd);
				}
				deadline = None;
			}
		}

		if finished.is_some() && connections.is_empty() {
			if let Some(done) = finished.take() {
				let _ = done.send(());
			}
			return;
		}
	}
}

/// Half-close the read side of a socket so the client can't start another
/// request, while the response in flight still goes out.
#[allow(unsafe_code)] // safe wrapper around system call
fn shutdown_read(fd: RawFd) {
	// SAFETY: shutdown() only changes the socket's state; it never closes or
	// reuses the descriptor, so a stale fd is at worst a no-op error.
	unsafe {
		libc::shutdown(fd, libc::SHUT_RD);
	}
}

/// Tear a socket down in both directions, failing any in-flight IO.
#[allow(unsafe_code)] // safe wrapper around system call
fn shutdown_both(fd: RawFd) {
	// SAFETY: as above, shutdown() does not invalidate the descriptor.
	unsafe {
		libc::shutdown(fd, libc::SHUT_RDWR);
	}
}


// vim: ts=4
