//! A single remote node.
//!
//! The peer owns the handshake state machine and everything the manager
//! delegates to it: version exchange, ping/pong, sync bundles. BLOCK, TX
//! and ADDR stay with the manager because they touch node-wide state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::ledger::DagService;
use crate::network::connection::{ConnectionHandle, ConnectionId};
use crate::network::message::{AddressMessage, NetMessage, VersionInfo, MAX_ADDRESS_SIZE};
use crate::params::Params;
use crate::types::NetAddress;
use crate::utils::unix_now;

/// What the manager must act on after delegated message handling.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerFeedback {
	None,
	/// Version exchange completed in both directions.
	HandshakeCompleted,
	/// Protocol violation; disconnect the peer.
	Misbehaved(&'static str),
}

pub struct Peer {
	conn: Arc<ConnectionHandle>,
	pub address: NetAddress,
	pub is_seed: bool,
	pub connected_time: u64,
	params: Params,
	local_id: u64,
	local_address: Option<NetAddress>,
	dag: Arc<dyn DagService>,

	valid: AtomicBool,
	fully_connected: AtomicBool,
	sync_available: AtomicBool,
	sent_version: AtomicBool,
	got_verack: AtomicBool,
	version: Mutex<Option<VersionInfo>>,

	/// Unix time the last ping was sent; stamped on handshake completion
	/// so the liveness sweep has a starting point.
	last_ping_time: AtomicU64,
	/// Outstanding ping nonce; zero when the last ping was answered.
	ping_nonce: AtomicU64,
	n_ping_failed: AtomicU32,

	/// Advances whenever a milestone bundle arrives.
	last_bundle_ms_time: AtomicU64,
	sync_started: AtomicU64,
	sync_inflight: AtomicBool,

	addr_relay_queue: Mutex<Vec<NetAddress>>,
}

impl Peer {
	pub fn new(
		conn: Arc<ConnectionHandle>,
		address: NetAddress,
		is_seed: bool,
		params: Params,
		local_id: u64,
		local_address: Option<NetAddress>,
		dag: Arc<dyn DagService>,
	) -> Self {
		Peer {
			conn,
			address,
			is_seed,
			connected_time: unix_now(),
			params,
			local_id,
			local_address,
			dag,
			valid: AtomicBool::new(true),
			fully_connected: AtomicBool::new(false),
			sync_available: AtomicBool::new(false),
			sent_version: AtomicBool::new(false),
			got_verack: AtomicBool::new(false),
			version: Mutex::new(None),
			last_ping_time: AtomicU64::new(0),
			ping_nonce: AtomicU64::new(0),
			n_ping_failed: AtomicU32::new(0),
			last_bundle_ms_time: AtomicU64::new(0),
			sync_started: AtomicU64::new(0),
			sync_inflight: AtomicBool::new(false),
			addr_relay_queue: Mutex::new(Vec::new()),
		}
	}

	pub fn connection(&self) -> &Arc<ConnectionHandle> {
		&self.conn
	}

	pub fn connection_id(&self) -> ConnectionId {
		self.conn.id()
	}

	pub fn is_inbound(&self) -> bool {
		self.conn.is_inbound()
	}

	pub fn is_valid(&self) -> bool {
		self.valid.load(Ordering::Acquire) && !self.conn.is_closed()
	}

	pub fn is_fully_connected(&self) -> bool {
		self.fully_connected.load(Ordering::Acquire)
	}

	pub fn is_sync_available(&self) -> bool {
		self.sync_available.load(Ordering::Acquire)
	}

	/// The address the peer claims to be reachable on. Self-reported.
	pub fn reported_address(&self) -> Option<NetAddress> {
		self.version
			.lock()
			.expect("version lock poisoned")
			.as_ref()
			.map(|info| info.address_me)
	}

	pub fn last_ping_time(&self) -> u64 {
		self.last_ping_time.load(Ordering::Acquire)
	}

	pub fn n_ping_failed(&self) -> u32 {
		self.n_ping_failed.load(Ordering::Acquire)
	}

	pub fn last_bundle_ms_time(&self) -> u64 {
		self.last_bundle_ms_time.load(Ordering::Acquire)
	}

	/// Marks the peer dead and closes the transport. The connection table
	/// entry goes away when the `Closed` event is processed.
	pub fn disconnect(&self) {
		self.valid.store(false, Ordering::Release);
		self.conn.close();
	}

	pub async fn send_version(&self, best_milestone_height: u64) -> Result<()> {
		let info = VersionInfo {
			magic: self.params.magic,
			protocol_version: self.params.protocol_version,
			node_id: self.local_id,
			best_milestone_height,
			address_you: self.address,
			address_me: self
				.local_address
				.unwrap_or_else(|| NetAddress::new([0, 0, 0, 0].into(), self.params.default_port)),
		};
		self.sent_version.store(true, Ordering::Release);
		self.conn.send(&NetMessage::Version(info)).await
	}

	/// Delegated handler for everything that is not BLOCK/TX/ADDR.
	pub async fn process_message(&self, message: NetMessage) -> Result<PeerFeedback> {
		match message {
			NetMessage::Version(info) => self.on_version(info).await,
			NetMessage::VerAck => Ok(self.on_verack()),
			NetMessage::Ping { nonce } => {
				self.conn.send(&NetMessage::Pong { nonce }).await?;
				Ok(PeerFeedback::None)
			},
			NetMessage::Pong { nonce } => {
				if self
					.ping_nonce
					.compare_exchange(nonce, 0, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					self.n_ping_failed.store(0, Ordering::Release);
					trace!(address = %self.address, "pong received");
				}
				Ok(PeerFeedback::None)
			},
			NetMessage::GetBundle { from_height } => {
				match self.dag.milestone_bundle(from_height) {
					Some(bundle) => self.conn.send(&NetMessage::Bundle(bundle)).await?,
					None => debug!(
						address = %self.address,
						from_height, "no bundle to serve"
					),
				}
				Ok(PeerFeedback::None)
			},
			NetMessage::Bundle(bundle) => {
				self.last_bundle_ms_time.store(unix_now(), Ordering::Release);
				self.sync_started.store(0, Ordering::Release);
				self.sync_inflight.store(false, Ordering::Release);
				debug!(
					address = %self.address,
					milestone_height = bundle.milestone_height,
					blocks = bundle.blocks.len(),
					"milestone bundle received"
				);
				for block in bundle.blocks {
					self.dag.add_new_block(Arc::new(block), Some(self.connection_id()));
				}
				Ok(PeerFeedback::None)
			},
			other => {
				debug!(address = %self.address, kind = other.kind(), "unexpected message");
				Ok(PeerFeedback::None)
			},
		}
	}

	async fn on_version(&self, info: VersionInfo) -> Result<PeerFeedback> {
		if info.magic != self.params.magic {
			return Ok(PeerFeedback::Misbehaved("wrong network magic"));
		}
		if info.protocol_version < self.params.protocol_version {
			return Ok(PeerFeedback::Misbehaved("obsolete protocol version"));
		}
		if info.node_id == self.local_id {
			return Ok(PeerFeedback::Misbehaved("connected to self"));
		}
		{
			let mut version = self.version.lock().expect("version lock poisoned");
			if version.is_some() {
				return Ok(PeerFeedback::Misbehaved("duplicate version message"));
			}
			*version = Some(info);
		}

		// an inbound peer learns our version in response to theirs
		if !self.sent_version.load(Ordering::Acquire) {
			self.send_version(self.dag.best_milestone_height()).await?;
		}
		self.conn.send(&NetMessage::VerAck).await?;
		Ok(self.try_complete_handshake())
	}

	fn on_verack(&self) -> PeerFeedback {
		self.got_verack.store(true, Ordering::Release);
		self.try_complete_handshake()
	}

	fn try_complete_handshake(&self) -> PeerFeedback {
		let done = self.sent_version.load(Ordering::Acquire)
			&& self.got_verack.load(Ordering::Acquire)
			&& self.version.lock().expect("version lock poisoned").is_some();
		if !done || self.fully_connected.swap(true, Ordering::AcqRel) {
			return PeerFeedback::None;
		}
		self.sync_available.store(true, Ordering::Release);
		self.last_ping_time.store(unix_now(), Ordering::Release);
		PeerFeedback::HandshakeCompleted
	}

	/// Periodic liveness probe. An unanswered previous ping counts as one
	/// failure.
	pub async fn send_ping(&self) {
		if !self.is_fully_connected() || !self.is_valid() {
			return;
		}
		if self.ping_nonce.load(Ordering::Acquire) != 0 {
			self.n_ping_failed.fetch_add(1, Ordering::AcqRel);
		}
		let nonce = rand::thread_rng().gen_range(1..u64::MAX);
		self.ping_nonce.store(nonce, Ordering::Release);
		self.last_ping_time.store(unix_now(), Ordering::Release);
		if let Err(error) = self.conn.send(&NetMessage::Ping { nonce }).await {
			debug!(address = %self.address, "ping failed: {error:#}");
		}
	}

	/// Appends addresses for the next periodic ADDR flush.
	pub fn queue_addresses(&self, addresses: &[NetAddress]) {
		let mut queue = self.addr_relay_queue.lock().expect("relay queue poisoned");
		let room = MAX_ADDRESS_SIZE.saturating_sub(queue.len());
		queue.extend(addresses.iter().take(room).copied());
	}

	/// Flushes the address-relay queue.
	pub async fn send_addresses(&self) {
		let addresses = {
			let mut queue = self.addr_relay_queue.lock().expect("relay queue poisoned");
			std::mem::take(&mut *queue)
		};
		if addresses.is_empty() {
			return;
		}
		let message = NetMessage::Addr(AddressMessage { addresses });
		match message.encode() {
			Ok(bytes) => self.conn.send_or_drop(bytes),
			Err(error) => warn!("unable to encode address message: {error:#}"),
		}
	}

	pub async fn send_local_address(&self, address: NetAddress) {
		let message = NetMessage::Addr(AddressMessage {
			addresses: vec![address],
		});
		match message.encode() {
			Ok(bytes) => self.conn.send_or_drop(bytes),
			Err(error) => warn!("unable to encode local address: {error:#}"),
		}
	}

	/// Requests the next milestone bundle, once per outstanding request.
	pub async fn start_sync(&self) {
		if self.sync_inflight.swap(true, Ordering::AcqRel) {
			return;
		}
		self.sync_started.store(unix_now(), Ordering::Release);
		let from_height = self.dag.best_milestone_height() + 1;
		debug!(address = %self.address, from_height, "requesting milestone bundle");
		if let Err(error) = self.conn.send(&NetMessage::GetBundle { from_height }).await {
			debug!(address = %self.address, "sync request failed: {error:#}");
			self.sync_inflight.store(false, Ordering::Release);
		}
	}

	/// True when a bundle request is in flight and nothing has come back
	/// for `timeout` seconds. The window closes when the bundle arrives.
	pub fn is_sync_timeout(&self, now: u64, timeout: u64) -> bool {
		let started = self.sync_started.load(Ordering::Acquire);
		started != 0 && started + timeout < now
	}
}
