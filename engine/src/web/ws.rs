//! WebSocket fan-out. Store listeners feed one broadcast queue; a single
//! broadcaster task drains it and writes to every connected socket through
//! per-socket channels, so one slow or dead peer never blocks the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use warp::ws::{Message, WebSocket};

use crate::store::{MemoryStore, StoreEventKind};

/// Close code sent to every client on shutdown ("going away").
const CLOSE_GOING_AWAY: u16 = 1001;

/// Store change kinds forwarded to WebSocket clients.
pub const BROADCAST_KINDS: &[StoreEventKind] = &[
	StoreEventKind::RoundUpdate,
	StoreEventKind::ParticipantsUpdate,
	StoreEventKind::HistoryUpdate,
	StoreEventKind::LiveFeed,
	StoreEventKind::ConfigUpdate,
	StoreEventKind::OperatorStatus,
];

#[derive(Default)]
pub struct WsHub {
	clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
	next_id: AtomicU64,
}

impl WsHub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn client_count(&self) -> usize {
		self.clients.lock().len()
	}

	fn register(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.clients.lock().insert(id, tx);
		id
	}

	fn unregister(&self, id: u64) {
		self.clients.lock().remove(&id);
	}

	/// Sends to every client; a socket whose channel is gone is dropped,
	/// the rest are unaffected.
	pub fn broadcast(&self, message: Message) {
		self.clients
			.lock()
			.retain(|_, tx| tx.send(message.clone()).is_ok());
	}

	/// Tells every client the server is going away and forgets them.
	pub fn close_all(&self) {
		let mut clients = self.clients.lock();
		for (_, tx) in clients.drain() {
			let _ = tx.send(Message::close_with(CLOSE_GOING_AWAY, "server shutdown"));
		}
	}
}

/// Drains store notifications into every connected socket. Stops (and
/// closes all sockets with 1001) when `shutdown` fires.
pub fn spawn_broadcaster(
	store: &MemoryStore,
	hub: Arc<WsHub>,
	mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
	let mut queue = store.subscribe(BROADCAST_KINDS);

	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				event = queue.recv() => match event {
					Some(event) => {
						let message = json!({
							"type": event.kind.as_str(),
							"payload": event.payload,
							"timestamp": chrono::Utc::now().to_rfc3339(),
						});
						hub.broadcast(Message::text(message.to_string()));
					},
					None => break,
				},
			}
		}
		hub.close_all();
		info!("websocket broadcaster stopped");
	})
}

/// Runs one accepted socket: sends the initial snapshot, then only consumes
/// keep-alives until the peer goes away.
pub async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>, snapshot: Value) {
	let (mut sink, mut stream) = socket.split();
	let (tx, rx) = mpsc::unbounded_channel::<Message>();

	let writer = tokio::spawn(async move {
		let mut rx = UnboundedReceiverStream::new(rx);
		while let Some(message) = rx.next().await {
			if sink.send(message).await.is_err() {
				break;
			}
		}
		let _ = sink.close().await;
	});

	let id = hub.register(tx.clone());
	info!(client_id = id, total = hub.client_count(), "websocket client connected");

	let _ = tx.send(Message::text(
		json!({ "type": "snapshot", "payload": snapshot }).to_string(),
	));

	while let Some(result) = stream.next().await {
		match result {
			Ok(message) if message.is_close() => break,
			// Pings are answered by warp; anything else is a keep-alive.
			Ok(_) => {},
			Err(e) => {
				debug!(client_id = id, error = %e, "websocket receive error");
				break;
			},
		}
	}

	hub.unregister(id);
	drop(tx);
	let _ = writer.await;
	info!(client_id = id, remaining = hub.client_count(), "websocket client disconnected");
}
