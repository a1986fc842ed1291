//! Two nodes over loopback TCP: connect, complete the version handshake
//! and relay a block end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use trefoil_core::address_book::AddressBook;
use trefoil_core::ledger::{DagService, MempoolService};
use trefoil_core::network::connection::{ConnectionId, ConnectionManager};
use trefoil_core::network::message::Bundle;
use trefoil_core::network::NetworkEvent;
use trefoil_core::params::Params;
use trefoil_core::peer_manager::{PeerManager, PeerManagerConfig};
use trefoil_core::shutdown::Controller;
use trefoil_core::types::{Block, Hash256, Transaction};
use trefoil_core::utils::unix_now;

struct RecordingDag {
	best_time: AtomicU64,
	received: Mutex<Vec<Hash256>>,
}

impl RecordingDag {
	fn synced() -> Arc<Self> {
		Arc::new(RecordingDag {
			best_time: AtomicU64::new(unix_now()),
			received: Mutex::new(Vec::new()),
		})
	}
}

impl DagService for RecordingDag {
	fn add_new_block(&self, block: Arc<Block>, _from: Option<ConnectionId>) {
		self.received.lock().unwrap().push(block.hash());
	}

	fn best_milestone_height(&self) -> u64 {
		1
	}

	fn best_milestone_time(&self) -> u64 {
		self.best_time.load(Ordering::Relaxed)
	}

	fn is_downloading_empty(&self) -> bool {
		true
	}

	fn milestone_bundle(&self, _from_height: u64) -> Option<Bundle> {
		None
	}
}

struct NullMempool;

impl MempoolService for NullMempool {
	fn receive_tx(&self, _tx: Arc<Transaction>) -> bool {
		false
	}
}

struct Node {
	manager: Arc<PeerManager>,
	dag: Arc<RecordingDag>,
}

fn make_node(shutdown: &Controller<String>) -> (Node, UnboundedReceiver<NetworkEvent>) {
	let (conn_mgr, events) = ConnectionManager::new(shutdown.clone());
	let dag = RecordingDag::synced();
	let manager = PeerManager::new(
		Params::testnet(),
		PeerManagerConfig::default(),
		conn_mgr,
		Arc::new(AddressBook::new(vec![])),
		dag.clone(),
		Arc::new(NullMempool),
		shutdown.clone(),
	);
	(Node { manager, dag }, events)
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
	timeout(Duration::from_secs(10), async {
		while !condition() {
			sleep(Duration::from_millis(20)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn nodes_handshake_and_relay_blocks() {
	let shutdown = Controller::new();

	let (alice, alice_events) = make_node(&shutdown);
	let (bob, bob_events) = make_node(&shutdown);

	let alice_addr = alice
		.manager
		.listen("127.0.0.1:0".parse().unwrap())
		.await
		.unwrap();

	alice.manager.clone().start(alice_events);
	bob.manager.clone().start(bob_events);

	bob.manager.connect_to(alice_addr.into());

	wait_for("both sides fully connected", || {
		alice.manager.fully_connected_count() == 1 && bob.manager.fully_connected_count() == 1
	})
	.await;
	assert_eq!(alice.manager.peer_count(), 1);
	assert_eq!(bob.manager.peer_count(), 1);

	// both dags start at wall-clock best-milestone time, so the sync
	// loops settle quickly and blocks pass the initial-sync gate
	wait_for("initial sync to finish", || {
		!alice.manager.is_initial_sync() && !bob.manager.is_initial_sync()
	})
	.await;

	let block = Block::new(
		1,
		Hash256::digest(b"genesis"),
		Hash256::digest(b"genesis"),
		Hash256::digest(b"genesis"),
		unix_now(),
		0x2100ffff,
		0,
		vec![],
	);
	let expected = block.hash();
	bob.manager.relay_block(&block, None);

	wait_for("the block to reach the other node", || {
		alice.dag.received.lock().unwrap().contains(&expected)
	})
	.await;
	assert!(bob.dag.received.lock().unwrap().is_empty());

	shutdown
		.trigger_shutdown("test over".to_string())
		.expect("first trigger");
	let reason = shutdown.completed_shutdown().await;
	assert_eq!(reason, "test over");

	alice.manager.stop();
	bob.manager.stop();
	assert_eq!(alice.manager.peer_count(), 0);
	assert_eq!(bob.manager.peer_count(), 0);
}
