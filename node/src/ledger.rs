//! In-memory reference ledger.
//!
//! This is the smallest DAG that exercises the admission path: blocks with
//! all three predecessors known are accepted immediately, the rest are
//! parked in the orphan container with their precise missing mask and
//! released transitively as predecessors arrive. There is no validation
//! beyond structure; a real deployment plugs a consensus engine into the
//! same traits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use trefoil_core::ledger::{DagService, MempoolService};
use trefoil_core::network::connection::ConnectionId;
use trefoil_core::network::message::Bundle;
use trefoil_core::obc::OrphanBlocksContainer;
use trefoil_core::params::Params;
use trefoil_core::peer_manager::PeerManager;
use trefoil_core::types::{Block, Hash256, MissingParents, Transaction};

/// Blocks per served sync bundle.
const BUNDLE_SIZE: usize = 512;

/// Deterministic genesis for the selected chain; all three parent fields
/// point at the zero hash.
pub fn genesis(params: &Params) -> Block {
	Block::new(
		params.protocol_version,
		Hash256::ZERO,
		Hash256::ZERO,
		Hash256::ZERO,
		1_561_000_000,
		0x2100ffff,
		0,
		vec![],
	)
}

struct DagInner {
	blocks: HashMap<Hash256, Arc<Block>>,
	/// Acceptance order, used to serve sync bundles.
	log: Vec<Arc<Block>>,
	/// The milestone chain; a block extends it when its milestone parent
	/// is the current head.
	milestones: Vec<Hash256>,
}

pub struct InMemoryDag {
	params: Params,
	obc: OrphanBlocksContainer,
	inner: Mutex<DagInner>,
	/// Set after construction; relaying needs the manager, the manager
	/// needs the dag.
	relay: Mutex<Weak<PeerManager>>,
}

impl InMemoryDag {
	pub fn new(params: Params, genesis: Block) -> Arc<Self> {
		let genesis = Arc::new(genesis);
		let genesis_hash = genesis.hash();
		info!(genesis = %genesis_hash, "ledger initialized");
		Arc::new(InMemoryDag {
			params,
			obc: OrphanBlocksContainer::new(),
			inner: Mutex::new(DagInner {
				blocks: HashMap::from([(genesis_hash, genesis.clone())]),
				log: vec![genesis],
				milestones: vec![genesis_hash],
			}),
			relay: Mutex::new(Weak::new()),
		})
	}

	pub fn set_relay(&self, manager: &Arc<PeerManager>) {
		*self.relay.lock().expect("relay hook poisoned") = Arc::downgrade(manager);
	}

	pub fn block_count(&self) -> usize {
		self.inner.lock().expect("ledger lock poisoned").blocks.len()
	}

	pub fn orphan_count(&self) -> usize {
		self.obc.size()
	}

	/// Inserts a block whose predecessors are all present. Returns false
	/// when the block fails the structural checks.
	fn accept(&self, block: &Arc<Block>) -> bool {
		if block.transactions.len() > self.params.block_capacity {
			warn!(block = %block.hash(), "rejecting block over transaction capacity");
			return false;
		}
		let mut inner = self.inner.lock().expect("ledger lock poisoned");
		let hash = block.hash();
		inner.blocks.insert(hash, block.clone());
		inner.log.push(block.clone());
		if inner.milestones.last() == Some(&block.milestone_hash) {
			inner.milestones.push(hash);
			debug!(block = %hash, height = inner.milestones.len() - 1, "new milestone");
		}
		true
	}
}

impl DagService for InMemoryDag {
	fn add_new_block(&self, block: Arc<Block>, from: Option<ConnectionId>) {
		let hash = block.hash();
		// dedup before touching the orphan container, which trusts its
		// caller on this
		let missing = {
			let inner = self.inner.lock().expect("ledger lock poisoned");
			if inner.blocks.contains_key(&hash) || self.obc.contains(&hash) {
				debug!(block = %hash, "ignoring duplicate block");
				return;
			}
			let mut missing = MissingParents::NONE;
			for (parent, bit) in block.parents().into_iter().zip([
				MissingParents::MILESTONE,
				MissingParents::TIP,
				MissingParents::PREV,
			]) {
				if !inner.blocks.contains_key(&parent) {
					missing |= bit;
				}
			}
			missing
		};

		if !missing.is_empty() {
			debug!(block = %hash, ?missing, "parking block with missing predecessors");
			self.obc.add_block(block, missing);
			return;
		}

		let mut ready = vec![block];
		while let Some(next) = ready.pop() {
			let next_hash = next.hash();
			if !self.accept(&next) {
				continue;
			}
			info!(block = %next_hash, "block accepted");
			if let Some(manager) = self.relay.lock().expect("relay hook poisoned").upgrade() {
				manager.relay_block(&next, from);
			}
			ready.extend(self.obc.submit_hash(&next_hash));
		}
	}

	fn best_milestone_height(&self) -> u64 {
		let inner = self.inner.lock().expect("ledger lock poisoned");
		(inner.milestones.len() - 1) as u64
	}

	fn best_milestone_time(&self) -> u64 {
		let inner = self.inner.lock().expect("ledger lock poisoned");
		let head = inner.milestones.last().expect("milestone chain never empty");
		inner.blocks[head].time
	}

	fn is_downloading_empty(&self) -> bool {
		// the reference ledger applies bundles synchronously
		true
	}

	fn milestone_bundle(&self, from_height: u64) -> Option<Bundle> {
		let inner = self.inner.lock().expect("ledger lock poisoned");
		let best = (inner.milestones.len() - 1) as u64;
		if from_height > best {
			return None;
		}
		// blocks in acceptance order always satisfy the admission check
		// on the receiving side
		let blocks = inner
			.log
			.iter()
			.skip(from_height as usize)
			.take(BUNDLE_SIZE)
			.map(|block| block.as_ref().clone())
			.collect();
		Some(Bundle {
			milestone_height: best,
			blocks,
		})
	}
}

#[derive(Default)]
pub struct InMemoryMempool {
	transactions: Mutex<HashSet<Hash256>>,
}

impl MempoolService for InMemoryMempool {
	fn receive_tx(&self, tx: Arc<Transaction>) -> bool {
		let fresh = self
			.transactions
			.lock()
			.expect("mempool lock poisoned")
			.insert(tx.hash());
		if fresh {
			info!(tx = %tx.hash(), "transaction accepted into mempool");
		}
		fresh
	}
}
