//! Peer orchestration.
//!
//! The manager runs four long-lived tasks over one shared peer table:
//! the message loop draining the transport's event queue, the outbound
//! dialer, the initial-sync driver and the periodic scheduler (liveness
//! sweeps, pings, address gossip). Everything observes the shutdown
//! controller, so `Stop` is a trigger away.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::address_book::AddressBook;
use crate::ledger::{DagService, MempoolService};
use crate::network::connection::{ConnectionHandle, ConnectionId, ConnectionManager};
use crate::network::message::{AddressMessage, NetMessage, MAX_ADDRESS_SIZE};
use crate::network::NetworkEvent;
use crate::params::Params;
use crate::peer::{Peer, PeerFeedback};
use crate::types::{Block, NetAddress, Transaction};
use crate::utils::{spawn_in_span, unix_now};
use crate::shutdown::Controller;

/// Suggested coefficient for the probabilistic block-relay filter. Not
/// applied unless [`PeerManagerConfig::block_relay_alpha`] opts in.
pub const SUGGESTED_RELAY_ALPHA: f64 = 0.5;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerManagerConfig {
	/// Outbound connection target; the dialer goes idle at this count.
	pub max_outbound: usize,
	/// Seconds a connection may sit without completing the version
	/// handshake.
	pub connection_setup_timeout: u64,
	/// Seconds without a sent ping being refreshed before a peer counts
	/// as dead.
	pub ping_wait_timeout: u64,
	pub max_ping_failures: u32,
	pub ping_send_interval: u64,
	pub send_address_interval: u64,
	pub broadcast_local_address_interval: u64,
	pub check_timeout_interval: u64,
	/// Seconds between sync-progress checks during initial sync.
	pub check_sync_interval: u64,
	/// Seconds a started sync may go without a bundle before the liveness
	/// sweep cuts the peer.
	pub sync_wait_timeout: u64,
	pub max_peers_to_relay_addr: usize,
	/// Seconds before the dialer retries a known address.
	pub dial_cooldown: u64,
	/// `Some(p)` relays each block to each peer with probability `p`;
	/// `None` broadcasts unconditionally.
	pub block_relay_alpha: Option<f64>,
	/// Drop unsolicited BLOCK messages while initial sync runs and
	/// bundles are authoritative.
	pub drop_blocks_during_sync: bool,
	/// Externally reachable address broadcast to peers, when known.
	pub local_address: Option<NetAddress>,
}

impl Default for PeerManagerConfig {
	fn default() -> Self {
		PeerManagerConfig {
			max_outbound: 8,
			connection_setup_timeout: 3 * 60,
			ping_wait_timeout: 3 * 60,
			max_ping_failures: 3,
			ping_send_interval: 10,
			send_address_interval: 60,
			broadcast_local_address_interval: 24 * 60 * 60,
			check_timeout_interval: 10,
			check_sync_interval: 10,
			sync_wait_timeout: 2 * 60,
			max_peers_to_relay_addr: 8,
			dial_cooldown: 2 * 60,
			block_relay_alpha: None,
			drop_blocks_during_sync: true,
			local_address: None,
		}
	}
}

#[derive(Clone, Copy)]
enum Periodic {
	CheckTimeout,
	BroadcastLocalAddress,
	SendAddresses,
	SendPings,
}

pub struct PeerManager {
	params: Params,
	cfg: PeerManagerConfig,
	/// Random identity of this node, echoed back by self-connects.
	local_id: u64,
	conn_mgr: Arc<ConnectionManager>,
	address_book: Arc<AddressBook>,
	dag: Arc<dyn DagService>,
	mempool: Arc<dyn MempoolService>,
	peers: RwLock<HashMap<ConnectionId, Arc<Peer>>>,
	connected_addresses: Mutex<HashSet<IpAddr>>,
	/// Peers created but not yet fully connected: ip → connect time.
	pending_peers: Mutex<HashMap<IpAddr, u64>>,
	initial_sync: AtomicBool,
	sync_peer: Mutex<Weak<Peer>>,
	shutdown: Controller<String>,
}

impl PeerManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		params: Params,
		cfg: PeerManagerConfig,
		conn_mgr: Arc<ConnectionManager>,
		address_book: Arc<AddressBook>,
		dag: Arc<dyn DagService>,
		mempool: Arc<dyn MempoolService>,
		shutdown: Controller<String>,
	) -> Arc<Self> {
		Arc::new(PeerManager {
			params,
			cfg,
			local_id: rand::thread_rng().gen(),
			conn_mgr,
			address_book,
			dag,
			mempool,
			peers: RwLock::new(HashMap::new()),
			connected_addresses: Mutex::new(HashSet::new()),
			pending_peers: Mutex::new(HashMap::new()),
			initial_sync: AtomicBool::new(true),
			sync_peer: Mutex::new(Weak::new()),
			shutdown,
		})
	}

	pub fn local_id(&self) -> u64 {
		self.local_id
	}

	pub fn is_initial_sync(&self) -> bool {
		self.initial_sync.load(Ordering::Acquire)
	}

	/// Spawns the four worker loops.
	pub fn start(self: Arc<Self>, events: tokio::sync::mpsc::UnboundedReceiver<NetworkEvent>) {
		info!("Starting the peer manager");
		self.address_book.init();
		spawn_in_span(self.shutdown.with_cancel(self.clone().handle_messages(events)));
		spawn_in_span(self.shutdown.with_cancel(self.clone().open_connections()));
		spawn_in_span(self.shutdown.with_cancel(self.clone().initial_sync_loop()));
		spawn_in_span(self.shutdown.with_cancel(self.clone().schedule_loop()));
	}

	/// Final teardown, run after the worker loops have been cancelled.
	pub fn stop(&self) {
		info!("Stopping the peer manager");
		for peer in self.snapshot_peers() {
			peer.disconnect();
		}
		self.peers.write().expect("peer map poisoned").clear();
		self.connected_addresses.lock().expect("address set poisoned").clear();
		self.pending_peers.lock().expect("pending set poisoned").clear();
		self.conn_mgr.stop();
	}

	/// Binds the listening socket; returns the bound address.
	pub async fn listen(
		&self,
		bind: std::net::SocketAddr,
	) -> color_eyre::Result<std::net::SocketAddr> {
		self.conn_mgr.listen(bind).await
	}

	pub fn connect_to(&self, address: NetAddress) {
		self.conn_mgr.connect(address.0);
	}

	pub fn peer_count(&self) -> usize {
		self.peers.read().expect("peer map poisoned").len()
	}

	pub fn fully_connected_count(&self) -> usize {
		self.peers
			.read()
			.expect("peer map poisoned")
			.values()
			.filter(|peer| peer.is_fully_connected())
			.count()
	}

	fn get_peer(&self, id: ConnectionId) -> Option<Arc<Peer>> {
		self.peers.read().expect("peer map poisoned").get(&id).cloned()
	}

	/// Peer references are snapshotted before any fanout so a send never
	/// happens under the map lock. Peers joining mid-call are missed.
	fn snapshot_peers(&self) -> Vec<Arc<Peer>> {
		self.peers
			.read()
			.expect("peer map poisoned")
			.values()
			.cloned()
			.collect()
	}

	/// True when some peer's remote address, or the address it reports for
	/// itself (advisory, it is self-reported), matches `address`.
	pub fn has_connected_to(&self, address: &NetAddress) -> bool {
		self.peers.read().expect("peer map poisoned").values().any(|peer| {
			peer.address.ip() == address.ip()
				|| peer
					.reported_address()
					.map_or(false, |reported| reported.ip() == address.ip())
		})
	}

	// ---- message loop ----------------------------------------------------

	async fn handle_messages(
		self: Arc<Self>,
		mut events: tokio::sync::mpsc::UnboundedReceiver<NetworkEvent>,
	) {
		info!("Running the peer message loop");
		while let Some(event) = events.recv().await {
			match event {
				NetworkEvent::Established(conn) => self.on_connection_created(conn).await,
				NetworkEvent::Closed(id) => self.on_connection_closed(id),
				NetworkEvent::Message(id, message) => self.dispatch_message(id, message).await,
			}
		}
		info!("Peer message loop finished");
	}

	async fn on_connection_created(&self, conn: Arc<ConnectionHandle>) {
		let address = NetAddress::from(conn.remote());
		let inbound = conn.is_inbound();
		let peer = Arc::new(Peer::new(
			conn,
			address,
			self.address_book.is_seed_address(&address),
			self.params.clone(),
			self.local_id,
			self.cfg.local_address,
			self.dag.clone(),
		));

		self.peers
			.write()
			.expect("peer map poisoned")
			.insert(peer.connection_id(), peer.clone());
		self.connected_addresses
			.lock()
			.expect("address set poisoned")
			.insert(address.ip());
		self.pending_peers
			.lock()
			.expect("pending set poisoned")
			.insert(address.ip(), peer.connected_time);
		info!(
			"{} {}   ({} connected)",
			if inbound { "Accepted" } else { "Connected to" },
			address,
			self.peer_count()
		);

		if !inbound {
			if let Err(error) = peer.send_version(self.dag.best_milestone_height()).await {
				debug!(%address, "version send failed: {error:#}");
			}
		}
	}

	fn on_connection_closed(&self, id: ConnectionId) {
		let removed = self.peers.write().expect("peer map poisoned").remove(&id);
		if let Some(peer) = removed {
			self.forget_peer_address(&peer);
			info!(address = %peer.address, "connection closed");
		}
	}

	fn forget_peer_address(&self, peer: &Peer) {
		self.connected_addresses
			.lock()
			.expect("address set poisoned")
			.remove(&peer.address.ip());
		self.pending_peers
			.lock()
			.expect("pending set poisoned")
			.remove(&peer.address.ip());
	}

	/// Removes the peer and tears its transport down.
	fn disconnect_peer(&self, peer: &Arc<Peer>) {
		peer.disconnect();
		self.peers
			.write()
			.expect("peer map poisoned")
			.remove(&peer.connection_id());
		self.forget_peer_address(peer);
	}

	async fn dispatch_message(&self, id: ConnectionId, message: NetMessage) {
		if matches!(message, NetMessage::Block(_))
			&& self.is_initial_sync()
			&& self.cfg.drop_blocks_during_sync
		{
			// bundles are authoritative while catching up
			debug!(connection = %id, "dropping unsolicited block during initial sync");
			return;
		}
		let Some(peer) = self.get_peer(id) else {
			return;
		};
		if !peer.is_valid() {
			return;
		}
		match message {
			NetMessage::Block(block) => {
				self.dag.add_new_block(Arc::new(block), Some(id));
			},
			NetMessage::Tx(tx) => self.process_transaction(tx, &peer),
			NetMessage::Addr(message) => self.process_address_message(message, &peer),
			other => match peer.process_message(other).await {
				Ok(PeerFeedback::HandshakeCompleted) => {
					self.pending_peers
						.lock()
						.expect("pending set poisoned")
						.remove(&peer.address.ip());
					info!(address = %peer.address, "peer fully connected");
				},
				Ok(PeerFeedback::Misbehaved(reason)) => {
					warn!(address = %peer.address, reason, "disconnecting misbehaving peer");
					self.disconnect_peer(&peer);
				},
				Ok(PeerFeedback::None) => {},
				Err(error) => debug!(address = %peer.address, "peer handler failed: {error:#}"),
			},
		}
	}

	fn process_transaction(&self, tx: Transaction, peer: &Arc<Peer>) {
		if let Err(error) = tx.verify(&self.params) {
			debug!(address = %peer.address, "dropping invalid transaction: {error:#}");
			return;
		}
		let tx = Arc::new(tx);
		if self.mempool.receive_tx(tx.clone()) {
			self.relay_transaction(&tx, Some(peer.connection_id()));
		}
	}

	fn process_address_message(&self, message: AddressMessage, peer: &Arc<Peer>) {
		if message.addresses.len() > MAX_ADDRESS_SIZE {
			warn!(address = %peer.address, "received too many addresses, dropping them all");
		} else {
			info!(
				address = %peer.address,
				size = message.addresses.len(),
				"received addresses"
			);
			let mut relay = Vec::new();
			for addr in message.addresses {
				if addr.is_routable() {
					self.address_book.add_new_address(addr);
					relay.push(addr);
				} else {
					debug!(%addr, "ignoring local or invalid address");
				}
			}
			if !relay.is_empty() {
				self.relay_address_msg(&relay, peer.connection_id());
			}
		}

		// seeds only exist to hand out addresses
		if peer.is_seed {
			warn!(address = %peer.address, "disconnecting seed after address transfer");
			self.disconnect_peer(peer);
		}
	}

	// ---- relay -----------------------------------------------------------

	pub fn relay_block(&self, block: &Block, from: Option<ConnectionId>) {
		let Ok(bytes) = NetMessage::Block(block.clone()).encode() else {
			return;
		};
		let mut rng = rand::thread_rng();
		for peer in self.snapshot_peers() {
			if Some(peer.connection_id()) == from {
				continue;
			}
			if let Some(alpha) = self.cfg.block_relay_alpha {
				if rng.gen::<f64>() >= alpha {
					continue;
				}
			}
			peer.connection().send_or_drop(bytes.clone());
		}
	}

	pub fn relay_transaction(&self, tx: &Transaction, from: Option<ConnectionId>) {
		let Ok(bytes) = NetMessage::Tx(tx.clone()).encode() else {
			return;
		};
		for peer in self.snapshot_peers() {
			if Some(peer.connection_id()) == from {
				continue;
			}
			peer.connection().send_or_drop(bytes.clone());
		}
	}

	/// Queues the address list on up to `max_peers_to_relay_addr` distinct
	/// peers picked by uniform index sampling; collisions are skipped, not
	/// retried.
	pub fn relay_address_msg(&self, addresses: &[NetAddress], from: ConnectionId) {
		let peers = self.snapshot_peers();
		if peers.is_empty() {
			return;
		}
		let mut rng = rand::thread_rng();
		let mut selected = HashSet::new();
		for _ in 0..self.cfg.max_peers_to_relay_addr {
			let offset = rng.gen_range(0..peers.len());
			if !selected.insert(offset) {
				continue;
			}
			let peer = &peers[offset];
			if peer.connection_id() == from {
				continue;
			}
			peer.queue_addresses(addresses);
		}
	}

	// ---- outbound dialer -------------------------------------------------

	async fn open_connections(self: Arc<Self>) {
		let mut tick = interval(Duration::from_secs(1));
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			if self.conn_mgr.outbound_count() >= self.cfg.max_outbound {
				continue;
			}

			if let Some(seed) = self.address_book.get_one_seed() {
				if !self.has_connected_to(&seed) {
					debug!(%seed, "dialing seed");
					self.conn_mgr.connect(seed.0);
				}
			}

			let now = unix_now();
			for _ in 0..100 {
				let Some(candidate) = self.address_book.get_one_address(false) else {
					// not enough known addresses yet
					break;
				};
				if self.has_connected_to(&candidate) {
					continue;
				}
				if now.saturating_sub(self.address_book.get_last_try(&candidate))
					< self.cfg.dial_cooldown
				{
					continue;
				}
				info!(%candidate, "dialing known address");
				self.conn_mgr.connect(candidate.0);
				self.address_book.set_last_try(&candidate, now);
				break;
			}
		}
	}

	// ---- initial sync ----------------------------------------------------

	fn pick_sync_peer(&self) -> Option<Arc<Peer>> {
		self.peers
			.read()
			.expect("peer map poisoned")
			.values()
			.find(|peer| peer.is_valid() && peer.is_fully_connected() && peer.is_sync_available())
			.cloned()
	}

	async fn initial_sync_loop(self: Arc<Self>) {
		let mut tick = interval(Duration::from_millis(100));
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let check_interval = Duration::from_secs(self.cfg.check_sync_interval);
		let mut next_check = Instant::now() + check_interval;
		let mut last_seen_bundle_time = 0u64;

		loop {
			tick.tick().await;
			let now = unix_now();
			if self.dag.best_milestone_time() + self.params.sync_time_threshold >= now {
				self.initial_sync.store(false, Ordering::Release);
				*self.sync_peer.lock().expect("sync peer poisoned") = Weak::new();
				info!("Initial sync finished");
				break;
			}

			let peer = {
				let mut guard = self.sync_peer.lock().expect("sync peer poisoned");
				let current = guard.upgrade().filter(|peer| {
					peer.is_valid() && peer.is_fully_connected() && peer.is_sync_available()
				});
				match current {
					Some(peer) => Some(peer),
					None => {
						let next = self.pick_sync_peer();
						*guard = next.as_ref().map(Arc::downgrade).unwrap_or_default();
						if let Some(peer) = &next {
							info!(address = %peer.address, "selected sync peer");
							// a fresh peer gets a full interval before the
							// stall check can cut it
							next_check = Instant::now() + check_interval;
							last_seen_bundle_time = 0;
						}
						next
					},
				}
			};
			let Some(peer) = peer else {
				continue;
			};

			if Instant::now() >= next_check {
				next_check = Instant::now() + check_interval;
				if peer.last_bundle_ms_time() == last_seen_bundle_time {
					warn!(address = %peer.address, "sync peer stalled, disconnecting");
					self.disconnect_peer(&peer);
					continue;
				}
				last_seen_bundle_time = peer.last_bundle_ms_time();
			}

			if self.dag.is_downloading_empty() {
				peer.start_sync().await;
			}
		}
	}

	// ---- periodic scheduler ----------------------------------------------

	async fn schedule_loop(self: Arc<Self>) {
		struct Entry {
			every: Duration,
			next: Instant,
			task: Periodic,
		}
		let entry = |secs: u64, task| Entry {
			every: Duration::from_secs(secs),
			next: Instant::now() + Duration::from_secs(secs),
			task,
		};
		let mut entries = vec![
			entry(self.cfg.check_timeout_interval, Periodic::CheckTimeout),
			entry(
				self.cfg.broadcast_local_address_interval,
				Periodic::BroadcastLocalAddress,
			),
			entry(self.cfg.send_address_interval, Periodic::SendAddresses),
			entry(self.cfg.ping_send_interval, Periodic::SendPings),
		];

		let mut tick = interval(Duration::from_secs(1));
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			let now = Instant::now();
			for entry in &mut entries {
				if now >= entry.next {
					entry.next = now + entry.every;
					self.run_periodic(entry.task).await;
				}
			}
		}
	}

	async fn run_periodic(&self, task: Periodic) {
		match task {
			Periodic::CheckTimeout => self.check_timeout(unix_now()),
			Periodic::BroadcastLocalAddress => {
				if let Some(address) = self.cfg.local_address {
					for peer in self.snapshot_peers() {
						peer.send_local_address(address).await;
					}
				}
			},
			Periodic::SendAddresses => {
				for peer in self.snapshot_peers() {
					peer.send_addresses().await;
				}
			},
			Periodic::SendPings => {
				for peer in self.snapshot_peers() {
					peer.send_ping().await;
				}
			},
		}
	}

	/// Sweeps the peer table: fully connected peers are cut on ping or
	/// sync timeout, the rest on handshake-setup timeout. Invalid peers
	/// are dropped without a disconnect.
	pub fn check_timeout(&self, now: u64) {
		let mut cut = Vec::new();
		let mut forgotten = Vec::new();
		{
			let mut peers = self.peers.write().expect("peer map poisoned");
			peers.retain(|_, peer| {
				if !peer.is_valid() {
					forgotten.push(peer.clone());
					return false;
				}
				if peer.is_fully_connected() {
					if peer.last_ping_time() + self.cfg.ping_wait_timeout < now
						|| peer.n_ping_failed() > self.cfg.max_ping_failures
					{
						info!(address = %peer.address, "disconnect: ping timeout");
						cut.push(peer.clone());
						return false;
					}
					if peer.is_sync_timeout(now, self.cfg.sync_wait_timeout) {
						info!(address = %peer.address, "disconnect: sync timeout");
						cut.push(peer.clone());
						return false;
					}
					true
				} else if peer.connected_time + self.cfg.connection_setup_timeout < now {
					info!(address = %peer.address, "disconnect: version handshake timeout");
					cut.push(peer.clone());
					false
				} else {
					true
				}
			});
		}
		// transports are torn down outside the map lock
		for peer in &cut {
			peer.disconnect();
		}
		for peer in cut.iter().chain(forgotten.iter()) {
			self.forget_peer_address(peer);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::network::connection::test_handle;
	use crate::network::message::VersionInfo;
	use crate::test_utils::{StubDag, StubMempool};
	use crate::types::Hash256;
	use bytes::Bytes;
	use std::net::SocketAddr;
	use tokio::sync::mpsc::Receiver;

	struct Harness {
		manager: Arc<PeerManager>,
		dag: Arc<StubDag>,
		mempool: Arc<StubMempool>,
		address_book: Arc<AddressBook>,
		shutdown: Controller<String>,
	}

	fn harness_with(cfg: PeerManagerConfig, seeds: Vec<NetAddress>) -> Harness {
		let shutdown = Controller::new();
		let (conn_mgr, _events) = ConnectionManager::new(shutdown.clone());
		let dag = Arc::new(StubDag::default());
		let mempool = Arc::new(StubMempool::default());
		let address_book = Arc::new(AddressBook::new(seeds));
		let manager = PeerManager::new(
			Params::testnet(),
			cfg,
			conn_mgr,
			address_book.clone(),
			dag.clone(),
			mempool.clone(),
			shutdown.clone(),
		);
		Harness {
			manager,
			dag,
			mempool,
			address_book,
			shutdown,
		}
	}

	fn harness() -> Harness {
		harness_with(PeerManagerConfig::default(), vec![])
	}

	async fn add_peer(
		harness: &Harness,
		id: u64,
		remote: &str,
		inbound: bool,
	) -> (Arc<Peer>, Receiver<Bytes>) {
		let remote: SocketAddr = remote.parse().unwrap();
		let (conn, outbox) = test_handle(id, remote, inbound);
		let conn_id = conn.id();
		harness.manager.on_connection_created(conn).await;
		(harness.manager.get_peer(conn_id).unwrap(), outbox)
	}

	fn sent(outbox: &mut Receiver<Bytes>) -> Option<NetMessage> {
		outbox.try_recv().ok().map(|bytes| NetMessage::decode(&bytes).unwrap())
	}

	fn remote_version(node_id: u64) -> VersionInfo {
		let params = Params::testnet();
		VersionInfo {
			magic: params.magic,
			protocol_version: params.protocol_version,
			node_id,
			best_milestone_height: 50,
			address_you: "7.7.7.7:17877".parse().unwrap(),
			address_me: "77.77.77.77:17877".parse().unwrap(),
		}
	}

	async fn complete_handshake(
		harness: &Harness,
		peer: &Arc<Peer>,
		outbox: &mut Receiver<Bytes>,
		node_id: u64,
	) {
		let id = peer.connection_id();
		harness
			.manager
			.dispatch_message(id, NetMessage::Version(remote_version(node_id)))
			.await;
		harness.manager.dispatch_message(id, NetMessage::VerAck).await;
		assert!(peer.is_fully_connected());
		while outbox.try_recv().is_ok() {}
	}

	#[tokio::test]
	async fn outbound_connection_sends_version_immediately() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", false).await;

		assert_eq!(harness.manager.peer_count(), 1);
		assert_eq!(harness.manager.fully_connected_count(), 0);
		assert!(!peer.is_fully_connected());
		match sent(&mut outbox) {
			Some(NetMessage::Version(info)) => {
				assert_eq!(info.node_id, harness.manager.local_id());
			},
			other => panic!("expected Version, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn inbound_connection_stays_quiet_until_version_arrives() {
		let harness = harness();
		let (_peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		assert!(sent(&mut outbox).is_none());
	}

	#[tokio::test]
	async fn handshake_timeout_removes_pending_peer() {
		let harness = harness();
		let (peer, _outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;

		// within the window nothing happens
		harness.manager.check_timeout(peer.connected_time + 10);
		assert_eq!(harness.manager.peer_count(), 1);

		let deadline = peer.connected_time
			+ harness.manager.cfg.connection_setup_timeout
			+ harness.manager.cfg.check_timeout_interval;
		harness.manager.check_timeout(deadline);
		assert_eq!(harness.manager.peer_count(), 0);
		assert!(peer.connection().is_closed());
		assert!(!harness
			.manager
			.has_connected_to(&"9.9.9.9:17877".parse().unwrap()));
	}

	#[tokio::test]
	async fn repeated_ping_failures_disconnect_the_peer() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		// all pongs withheld: the failure counter passes the limit
		for _ in 0..5 {
			peer.send_ping().await;
		}
		assert!(peer.n_ping_failed() > harness.manager.cfg.max_ping_failures);

		harness.manager.check_timeout(unix_now());
		assert_eq!(harness.manager.peer_count(), 0);
		assert!(peer.connection().is_closed());
	}

	#[tokio::test]
	async fn stale_ping_time_disconnects_the_peer() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		let deadline = peer.last_ping_time() + harness.manager.cfg.ping_wait_timeout + 1;
		harness.manager.check_timeout(deadline);
		assert_eq!(harness.manager.peer_count(), 0);
	}

	#[tokio::test]
	async fn seed_is_dropped_after_address_transfer() {
		let seed_addr: NetAddress = "9.9.9.9:17877".parse().unwrap();
		// enough relay draws to make the second peer's selection certain
		let mut cfg = PeerManagerConfig::default();
		cfg.max_peers_to_relay_addr = 64;
		let harness = harness_with(cfg, vec![seed_addr]);

		let (seed_peer, mut seed_outbox) = add_peer(&harness, 1, "9.9.9.9:17877", false).await;
		assert!(seed_peer.is_seed);
		let (other_peer, mut other_outbox) = add_peer(&harness, 2, "8.8.8.8:17877", true).await;
		while seed_outbox.try_recv().is_ok() {}

		let gossip: NetAddress = "5.5.5.5:17877".parse().unwrap();
		harness
			.manager
			.dispatch_message(
				seed_peer.connection_id(),
				NetMessage::Addr(AddressMessage {
					addresses: vec![gossip],
				}),
			)
			.await;

		// the address is stored and the seed is gone
		assert_eq!(harness.address_book.get_one_address(true), Some(gossip));
		assert!(seed_peer.connection().is_closed());
		assert_eq!(harness.manager.peer_count(), 1);

		// the other peer received the relay on the next address flush
		other_peer.send_addresses().await;
		match sent(&mut other_outbox) {
			Some(NetMessage::Addr(message)) => assert_eq!(message.addresses, vec![gossip]),
			other => panic!("expected Addr, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn oversized_address_message_is_dropped_whole() {
		let harness = harness();
		let (peer, _outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;

		let addresses = (0..=MAX_ADDRESS_SIZE)
			.map(|i| {
				NetAddress::new(
					[5, 5, (i / 256) as u8, (i % 256) as u8].into(),
					17877,
				)
			})
			.collect();
		harness
			.manager
			.dispatch_message(peer.connection_id(), NetMessage::Addr(AddressMessage { addresses }))
			.await;

		assert!(harness.address_book.is_empty());
		// not a protocol violation, the peer stays
		assert_eq!(harness.manager.peer_count(), 1);
	}

	#[tokio::test]
	async fn address_relay_reaches_a_bounded_subset() {
		let mut cfg = PeerManagerConfig::default();
		cfg.max_peers_to_relay_addr = 3;
		let harness = harness_with(cfg, vec![]);

		let mut peers = Vec::new();
		for i in 0..10u64 {
			peers.push(add_peer(&harness, i + 1, &format!("9.9.9.{}:17877", i + 1), true).await);
		}

		let sender_id = peers[0].0.connection_id();
		let gossip: NetAddress = "5.5.5.5:17877".parse().unwrap();
		harness.manager.relay_address_msg(&[gossip], sender_id);

		let mut reached = 0;
		for (peer, outbox) in &mut peers {
			peer.send_addresses().await;
			if let Some(NetMessage::Addr(_)) = sent(outbox) {
				reached += 1;
				assert_ne!(peer.connection_id(), sender_id);
			}
		}
		assert!(reached <= 3, "reached {reached} peers");
	}

	#[tokio::test]
	async fn address_relay_never_returns_to_the_sender() {
		// with far more draws than peers every other peer is selected,
		// but the sender stays excluded
		let mut cfg = PeerManagerConfig::default();
		cfg.max_peers_to_relay_addr = 64;
		let harness = harness_with(cfg, vec![]);

		let (sender, mut sender_outbox) = add_peer(&harness, 1, "9.9.9.1:17877", true).await;
		let (other, mut other_outbox) = add_peer(&harness, 2, "9.9.9.2:17877", true).await;

		let gossip: NetAddress = "5.5.5.5:17877".parse().unwrap();
		harness.manager.relay_address_msg(&[gossip], sender.connection_id());

		sender.send_addresses().await;
		other.send_addresses().await;
		assert!(sent(&mut sender_outbox).is_none());
		assert!(matches!(sent(&mut other_outbox), Some(NetMessage::Addr(_))));
	}

	#[tokio::test]
	async fn invalid_transaction_is_dropped_and_peer_kept() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		let invalid = Transaction::new(vec![], vec![]);
		harness
			.manager
			.dispatch_message(peer.connection_id(), NetMessage::Tx(invalid))
			.await;
		assert!(harness.mempool.received.lock().unwrap().is_empty());
		assert_eq!(harness.manager.peer_count(), 1);
	}

	#[tokio::test]
	async fn accepted_transaction_is_relayed_to_everyone_but_the_sender() {
		let harness = harness();
		let (sender, mut sender_outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &sender, &mut sender_outbox, 99).await;
		let (_other, mut other_outbox) = add_peer(&harness, 2, "8.8.8.8:17877", true).await;

		let tx = Transaction::new(
			vec![crate::types::TxInput {
				outpoint: crate::types::TxOutPoint::unconnected(),
				unlock_script: vec![0x51],
			}],
			vec![crate::types::TxOutput {
				value: 5,
				lock_script: vec![0xac],
			}],
		);
		harness
			.manager
			.dispatch_message(sender.connection_id(), NetMessage::Tx(tx.clone()))
			.await;

		assert_eq!(
			harness.mempool.received.lock().unwrap().as_slice(),
			&[tx.hash()]
		);
		assert!(matches!(sent(&mut other_outbox), Some(NetMessage::Tx(_))));
		assert!(sent(&mut sender_outbox).is_none());
	}

	#[tokio::test]
	async fn blocks_are_dropped_during_initial_sync() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		let block = Block::new(
			1,
			Hash256::ZERO,
			Hash256::ZERO,
			Hash256::ZERO,
			1,
			0,
			0,
			vec![],
		);
		assert!(harness.manager.is_initial_sync());
		harness
			.manager
			.dispatch_message(peer.connection_id(), NetMessage::Block(block.clone()))
			.await;
		assert!(harness.dag.received.lock().unwrap().is_empty());

		// once synced the same block reaches the validation engine
		harness.manager.initial_sync.store(false, Ordering::Release);
		harness
			.manager
			.dispatch_message(peer.connection_id(), NetMessage::Block(block.clone()))
			.await;
		assert_eq!(
			harness.dag.received.lock().unwrap().as_slice(),
			&[block.hash()]
		);
	}

	#[tokio::test]
	async fn misbehaving_peer_is_disconnected() {
		let harness = harness();
		let (peer, _outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;

		let mut info = remote_version(99);
		info.magic ^= 1;
		harness
			.manager
			.dispatch_message(peer.connection_id(), NetMessage::Version(info))
			.await;
		assert_eq!(harness.manager.peer_count(), 0);
		assert!(peer.connection().is_closed());
	}

	#[tokio::test]
	async fn has_connected_to_also_matches_reported_address() {
		let harness = harness();
		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		assert!(harness
			.manager
			.has_connected_to(&"9.9.9.9:1".parse().unwrap()));
		// the advisory self-reported address from the version message
		assert!(harness
			.manager
			.has_connected_to(&"77.77.77.77:17877".parse().unwrap()));
		assert!(!harness
			.manager
			.has_connected_to(&"66.66.66.66:17877".parse().unwrap()));
	}

	#[tokio::test]
	async fn stalled_sync_peer_is_disconnected() {
		let mut cfg = PeerManagerConfig::default();
		cfg.check_sync_interval = 0;
		let harness = harness_with(cfg, vec![]);
		// far in the past: the node is not synced
		harness.dag.best_time.store(1, Ordering::Relaxed);
		harness.dag.downloading_empty.store(true, Ordering::Relaxed);

		let (peer, mut outbox) = add_peer(&harness, 1, "9.9.9.9:17877", true).await;
		complete_handshake(&harness, &peer, &mut outbox, 99).await;

		let manager = harness.manager.clone();
		let loop_handle = tokio::spawn(harness.shutdown.with_cancel(async move {
			manager.initial_sync_loop().await;
		}));

		// with a zero check interval the very first check sees no bundle
		// progress and cuts the peer
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if harness.manager.peer_count() == 0 {
					break;
				}
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		})
		.await
		.expect("sync peer was not disconnected");
		assert!(peer.connection().is_closed());

		let _ = harness.shutdown.trigger_shutdown("test over".to_string());
		let _ = loop_handle.await;
	}

	#[tokio::test]
	async fn initial_sync_finishes_when_the_dag_catches_up() {
		let harness = harness();
		harness.dag.best_time.store(unix_now(), Ordering::Relaxed);

		let manager = harness.manager.clone();
		let loop_handle = tokio::spawn(async move { manager.initial_sync_loop().await });
		tokio::time::timeout(Duration::from_secs(5), loop_handle)
			.await
			.expect("initial sync loop did not finish")
			.unwrap();
		assert!(!harness.manager.is_initial_sync());
	}
}
