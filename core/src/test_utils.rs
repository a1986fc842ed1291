//! Stub collaborators shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::ledger::{DagService, MempoolService};
use crate::network::connection::ConnectionId;
use crate::network::message::Bundle;
use crate::types::{Block, Hash256, Transaction};

#[derive(Default)]
pub(crate) struct StubDag {
	pub best_height: AtomicU64,
	pub best_time: AtomicU64,
	pub downloading_empty: AtomicBool,
	pub received: Mutex<Vec<Hash256>>,
	pub served_bundles: AtomicUsize,
}

impl DagService for StubDag {
	fn add_new_block(&self, block: Arc<Block>, _from: Option<ConnectionId>) {
		self.received.lock().unwrap().push(block.hash());
	}

	fn best_milestone_height(&self) -> u64 {
		self.best_height.load(Ordering::Relaxed)
	}

	fn best_milestone_time(&self) -> u64 {
		self.best_time.load(Ordering::Relaxed)
	}

	fn is_downloading_empty(&self) -> bool {
		self.downloading_empty.load(Ordering::Relaxed)
	}

	fn milestone_bundle(&self, from_height: u64) -> Option<Bundle> {
		self.served_bundles.fetch_add(1, Ordering::Relaxed);
		Some(Bundle {
			milestone_height: from_height,
			blocks: vec![],
		})
	}
}

pub(crate) struct StubMempool {
	pub accept: AtomicBool,
	pub received: Mutex<Vec<Hash256>>,
}

impl Default for StubMempool {
	fn default() -> Self {
		StubMempool {
			accept: AtomicBool::new(true),
			received: Mutex::new(Vec::new()),
		}
	}
}

impl MempoolService for StubMempool {
	fn receive_tx(&self, tx: Arc<Transaction>) -> bool {
		self.received.lock().unwrap().push(tx.hash());
		self.accept.load(Ordering::Relaxed)
	}
}
