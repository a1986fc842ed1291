//! TCP connection management.
//!
//! Every accepted or dialed stream gets a pair of framed reader/writer
//! tasks and an entry in the connection table. All inbound traffic and all
//! lifecycle changes are delivered on a single FIFO [`NetworkEvent`] queue,
//! so the consumer never gets a message for a connection before its
//! `Established` event, and teardown never re-enters the transport.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::NetMessage;
use crate::shutdown::Controller;
use crate::utils::spawn_in_span;

/// Per-connection send queue capacity. Relay traffic is dropped when the
/// queue is full; control traffic waits for room.
const SEND_QUEUE_SIZE: usize = 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies one transport connection for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

#[derive(Debug)]
pub enum NetworkEvent {
	Established(Arc<ConnectionHandle>),
	Closed(ConnectionId),
	Message(ConnectionId, NetMessage),
}

/// Shared sending side of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
	id: ConnectionId,
	remote: SocketAddr,
	inbound: bool,
	sender: mpsc::Sender<Bytes>,
	closer: CancellationToken,
}

impl ConnectionHandle {
	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	pub fn is_inbound(&self) -> bool {
		self.inbound
	}

	/// Queues a control message (handshake, ping, sync), waiting when the
	/// send queue is full.
	pub async fn send(&self, message: &NetMessage) -> Result<()> {
		let bytes = message.encode()?;
		self.sender
			.send(bytes)
			.await
			.map_err(|_| eyre!("connection {} is closed", self.id))
	}

	/// Queues pre-encoded relay traffic; newest data is dropped when the
	/// queue is full.
	pub fn send_or_drop(&self, bytes: Bytes) {
		if let Err(TrySendError::Full(_)) = self.sender.try_send(bytes) {
			debug!(connection = %self.id, "send queue full, dropping relay message");
		}
	}

	pub fn close(&self) {
		self.closer.cancel();
	}

	pub fn is_closed(&self) -> bool {
		self.closer.is_cancelled()
	}
}

struct Table {
	connections: Mutex<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
	events: UnboundedSender<NetworkEvent>,
	next_id: AtomicU64,
}

impl Table {
	/// Removes the table entry and posts `Closed` exactly once.
	fn finalize(&self, id: ConnectionId) {
		let removed = self
			.connections
			.lock()
			.expect("connection table poisoned")
			.remove(&id)
			.is_some();
		if removed {
			let _ = self.events.send(NetworkEvent::Closed(id));
		}
	}
}

pub struct ConnectionManager {
	table: Arc<Table>,
	shutdown: Controller<String>,
}

impl ConnectionManager {
	/// Returns the manager and the single consumer end of its event queue.
	pub fn new(shutdown: Controller<String>) -> (Arc<Self>, UnboundedReceiver<NetworkEvent>) {
		let (events, receiver) = mpsc::unbounded_channel();
		let manager = Arc::new(ConnectionManager {
			table: Arc::new(Table {
				connections: Mutex::new(HashMap::new()),
				events,
				next_id: AtomicU64::new(1),
			}),
			shutdown,
		});
		(manager, receiver)
	}

	/// Binds `bind` and accepts inbound connections until shutdown.
	/// Returns the actually bound address.
	pub async fn listen(&self, bind: SocketAddr) -> Result<SocketAddr> {
		let listener = TcpListener::bind(bind)
			.await
			.wrap_err_with(|| format!("Unable to bind {bind}"))?;
		let local = listener.local_addr()?;
		info!(address = %local, "listening for inbound connections");

		let table = self.table.clone();
		let shutdown = self.shutdown.clone();
		spawn_in_span(self.shutdown.with_cancel(async move {
			loop {
				match listener.accept().await {
					Ok((stream, remote)) => register(&table, &shutdown, stream, remote, true),
					Err(error) => {
						warn!("accept failed: {error:#}");
						tokio::time::sleep(Duration::from_millis(100)).await;
					},
				}
			}
		}));
		Ok(local)
	}

	/// Dials `remote` in the background; the outcome surfaces as an
	/// `Established` event or not at all.
	pub fn connect(&self, remote: SocketAddr) {
		let table = self.table.clone();
		let shutdown = self.shutdown.clone();
		spawn_in_span(self.shutdown.with_cancel(async move {
			match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(remote)).await {
				Ok(Ok(stream)) => register(&table, &shutdown, stream, remote, false),
				Ok(Err(error)) => debug!(%remote, "dial failed: {error:#}"),
				Err(_) => debug!(%remote, "dial timed out"),
			}
		}));
	}

	/// Asks the connection to close; the `Closed` event follows once the
	/// reader task winds down.
	pub fn disconnect(&self, id: ConnectionId) {
		if let Some(handle) = self
			.table
			.connections
			.lock()
			.expect("connection table poisoned")
			.get(&id)
		{
			handle.close();
		}
	}

	pub fn outbound_count(&self) -> usize {
		self.table
			.connections
			.lock()
			.expect("connection table poisoned")
			.values()
			.filter(|handle| !handle.inbound)
			.count()
	}

	pub fn connection_count(&self) -> usize {
		self.table
			.connections
			.lock()
			.expect("connection table poisoned")
			.len()
	}

	/// Closes every connection. The event queue drains and then yields
	/// `None` once the consumer is the only side left.
	pub fn stop(&self) {
		let handles: Vec<_> = self
			.table
			.connections
			.lock()
			.expect("connection table poisoned")
			.values()
			.cloned()
			.collect();
		for handle in handles {
			handle.close();
		}
	}
}

fn register(
	table: &Arc<Table>,
	shutdown: &Controller<String>,
	stream: TcpStream,
	remote: SocketAddr,
	inbound: bool,
) {
	let _ = stream.set_nodelay(true);
	let id = ConnectionId(table.next_id.fetch_add(1, Ordering::Relaxed));
	let (read_half, write_half) = stream.into_split();
	let (sender, outbox) = mpsc::channel(SEND_QUEUE_SIZE);
	let closer = CancellationToken::new();

	let handle = Arc::new(ConnectionHandle {
		id,
		remote,
		inbound,
		sender,
		closer: closer.clone(),
	});
	table
		.connections
		.lock()
		.expect("connection table poisoned")
		.insert(id, handle.clone());
	// delivered before the reader task starts, so the consumer sees
	// Established strictly before any Message of this connection
	let _ = table.events.send(NetworkEvent::Established(handle));

	spawn_in_span(shutdown.with_cancel(write_loop(write_half, outbox, closer.clone())));
	spawn_in_span(shutdown.with_cancel(read_loop(table.clone(), id, read_half, closer)));
}

async fn read_loop(
	table: Arc<Table>,
	id: ConnectionId,
	read_half: OwnedReadHalf,
	closer: CancellationToken,
) {
	let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
	loop {
		tokio::select! {
			_ = closer.cancelled() => break,
			frame = frames.next() => match frame {
				Some(Ok(bytes)) => match NetMessage::decode(&bytes) {
					Ok(message) => {
						let _ = table.events.send(NetworkEvent::Message(id, message));
					},
					// malformed frames are dropped, the peer stays
					Err(error) => {
						debug!(connection = %id, "undecodable message: {error:#}")
					},
				},
				Some(Err(error)) => {
					debug!(connection = %id, "transport error: {error:#}");
					break;
				},
				None => break,
			},
		}
	}
	closer.cancel();
	table.finalize(id);
}

async fn write_loop(
	write_half: OwnedWriteHalf,
	mut outbox: mpsc::Receiver<Bytes>,
	closer: CancellationToken,
) {
	let mut frames = FramedWrite::new(write_half, LengthDelimitedCodec::new());
	loop {
		tokio::select! {
			_ = closer.cancelled() => break,
			maybe = outbox.recv() => match maybe {
				Some(bytes) => {
					if let Err(error) = frames.send(bytes).await {
						debug!("write failed: {error:#}");
						closer.cancel();
						break;
					}
				},
				None => break,
			},
		}
	}
	let _ = frames.close().await;
}

#[cfg(test)]
pub(crate) fn test_handle(
	id: u64,
	remote: SocketAddr,
	inbound: bool,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<Bytes>) {
	let (sender, receiver) = mpsc::channel(SEND_QUEUE_SIZE);
	let handle = Arc::new(ConnectionHandle {
		id: ConnectionId(id),
		remote,
		inbound,
		sender,
		closer: CancellationToken::new(),
	});
	(handle, receiver)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::network::message::AddressMessage;
	use std::time::Duration;
	use tokio::time::timeout;

	async fn recv(events: &mut UnboundedReceiver<NetworkEvent>) -> NetworkEvent {
		timeout(Duration::from_secs(5), events.recv())
			.await
			.expect("timed out waiting for network event")
			.expect("event queue closed")
	}

	#[tokio::test]
	async fn establish_exchange_and_close() {
		let shutdown = Controller::new();
		let (server, mut server_events) = ConnectionManager::new(shutdown.clone());
		let (client, mut client_events) = ConnectionManager::new(shutdown.clone());

		let bound = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
		client.connect(bound);

		let client_handle = match recv(&mut client_events).await {
			NetworkEvent::Established(handle) => handle,
			other => panic!("expected Established, got {other:?}"),
		};
		assert!(!client_handle.is_inbound());
		assert_eq!(client.outbound_count(), 1);

		let server_handle = match recv(&mut server_events).await {
			NetworkEvent::Established(handle) => handle,
			other => panic!("expected Established, got {other:?}"),
		};
		assert!(server_handle.is_inbound());
		assert_eq!(server.outbound_count(), 0);

		// a message travels client -> server, in order, after Established
		client_handle.send(&NetMessage::Ping { nonce: 99 }).await.unwrap();
		match recv(&mut server_events).await {
			NetworkEvent::Message(id, NetMessage::Ping { nonce }) => {
				assert_eq!(id, server_handle.id());
				assert_eq!(nonce, 99);
			},
			other => panic!("expected Ping, got {other:?}"),
		}

		// closing one side surfaces as Closed on both
		server.disconnect(server_handle.id());
		match recv(&mut server_events).await {
			NetworkEvent::Closed(id) => assert_eq!(id, server_handle.id()),
			other => panic!("expected Closed, got {other:?}"),
		}
		match recv(&mut client_events).await {
			NetworkEvent::Closed(id) => assert_eq!(id, client_handle.id()),
			other => panic!("expected Closed, got {other:?}"),
		}
		assert_eq!(client.connection_count(), 0);
		assert_eq!(server.connection_count(), 0);

		let _ = shutdown.trigger_shutdown("test over".to_string());
	}

	#[tokio::test]
	async fn undecodable_frames_do_not_kill_the_connection() {
		let shutdown = Controller::new();
		let (server, mut server_events) = ConnectionManager::new(shutdown.clone());
		let (client, mut client_events) = ConnectionManager::new(shutdown.clone());

		let bound = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
		client.connect(bound);
		let client_handle = match recv(&mut client_events).await {
			NetworkEvent::Established(handle) => handle,
			other => panic!("expected Established, got {other:?}"),
		};
		let _ = recv(&mut server_events).await;

		client_handle.send_or_drop(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]));
		client_handle
			.send(&NetMessage::Addr(AddressMessage::default()))
			.await
			.unwrap();

		// the garbage frame is skipped, the valid one still arrives
		match recv(&mut server_events).await {
			NetworkEvent::Message(_, NetMessage::Addr(_)) => {},
			other => panic!("expected Addr, got {other:?}"),
		}

		let _ = shutdown.trigger_shutdown("test over".to_string());
	}
}
