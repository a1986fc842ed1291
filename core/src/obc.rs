//! Orphan block container.
//!
//! Blocks reach this container when at least one of their three
//! predecessors is not yet known locally. Every orphan is tracked as an
//! [`OrphanDep`] node in a dependency graph: `block_dep_map` indexes the
//! orphans themselves, `lose_ends` indexes the predecessor hashes that are
//! unknown to the container and can only be satisfied from the outside.
//! Submitting a hash ties its lose ends and releases, transitively, every
//! orphan whose last missing predecessor just became available.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::types::{Block, Hash256, MissingParents};

type DepPtr = Arc<OrphanDep>;

/// One orphaned block and its remaining dependency count. The node is
/// shared between `block_dep_map` and the `deps` lists of the orphans it
/// waits on, exactly once per missing predecessor.
struct OrphanDep {
	block: Arc<Block>,
	/// Distinct predecessor hashes still missing; strictly positive while
	/// the orphan is in the container.
	ndeps: AtomicUsize,
	/// Orphans that wait for this block's hash.
	deps: Mutex<Vec<DepPtr>>,
	/// Set when a re-added block replaces this node. A superseded node may
	/// still sit in lose-end slots; it must never release its block.
	superseded: AtomicBool,
}

#[derive(Default)]
struct Maps {
	block_dep_map: HashMap<Hash256, DepPtr>,
	/// Predecessor hash → orphans waiting on it. A hash lives here iff it
	/// is not itself a key of `block_dep_map`.
	lose_ends: HashMap<Hash256, Vec<DepPtr>>,
}

#[derive(Default)]
pub struct OrphanBlocksContainer {
	inner: RwLock<Maps>,
}

impl OrphanBlocksContainer {
	pub fn new() -> Self {
		Self::default()
	}

	/// Parks `block` until the predecessors marked in `missing` arrive.
	/// A zero mask is a no-op. If the block is already tracked, the prior
	/// entry is replaced and its waiters carry over.
	pub fn add_block(&self, block: Arc<Block>, missing: MissingParents) {
		if missing.is_empty() {
			return;
		}
		let hash = block.hash();
		let dep = Arc::new(OrphanDep {
			block,
			ndeps: AtomicUsize::new(0),
			deps: Mutex::new(Vec::new()),
			superseded: AtomicBool::new(false),
		});

		let mut maps = self.inner.write().expect("obc lock poisoned");

		let mut unique = HashSet::new();
		for parent in dep.block.parents_matching(missing) {
			// two parent fields may carry the same hash; it counts once
			if !unique.insert(parent) {
				continue;
			}
			match maps.block_dep_map.get(&parent) {
				Some(entry) => entry.deps.lock().expect("deps lock poisoned").push(dep.clone()),
				None => maps.lose_ends.entry(parent).or_default().push(dep.clone()),
			}
		}
		dep.ndeps.store(unique.len(), Ordering::Release);

		// orphans that were already waiting for this block move from the
		// lose ends onto the new node, keeping one slot per dependency
		let mut waiting = maps.lose_ends.remove(&hash).unwrap_or_default();
		if let Some(prior) = maps.block_dep_map.insert(hash, dep.clone()) {
			prior.superseded.store(true, Ordering::Release);
			waiting.append(&mut prior.deps.lock().expect("deps lock poisoned"));
		}
		if !waiting.is_empty() {
			dep.deps.lock().expect("deps lock poisoned").append(&mut waiting);
		}
		trace!(block = %hash, ndeps = unique.len(), "parked orphan block");
	}

	/// Announces that the block identified by `hash` is now available and
	/// returns every orphan this makes whole, cascading through the
	/// dependency graph. Returns an empty list when `hash` ties no lose
	/// ends.
	pub fn submit_hash(&self, hash: &Hash256) -> Vec<Arc<Block>> {
		let mut stack = {
			let mut maps = self.inner.write().expect("obc lock poisoned");
			match maps.lose_ends.remove(hash) {
				Some(deps) => deps,
				None => return Vec::new(),
			}
		};

		// The traversal runs without the map lock: every node on the stack
		// is reachable only through this stack once its slot has been
		// consumed, so the field updates below cannot race.
		let mut released = Vec::new();
		while let Some(dep) = stack.pop() {
			let remaining = dep.ndeps.fetch_sub(1, Ordering::AcqRel);
			debug_assert!(remaining > 0, "orphan decremented past zero");
			if remaining > 1 {
				continue;
			}
			if dep.superseded.load(Ordering::Acquire) {
				continue;
			}
			released.push(dep.block.clone());
			self.inner
				.write()
				.expect("obc lock poisoned")
				.block_dep_map
				.remove(&dep.block.hash());
			// the map entry is gone, so late arrivals wait on a lose end
			// and cannot append to this list any more
			stack.append(&mut dep.deps.lock().expect("deps lock poisoned"));
		}
		if !released.is_empty() {
			trace!(submitted = %hash, released = released.len(), "orphans released");
		}
		released
	}

	pub fn contains(&self, hash: &Hash256) -> bool {
		self.inner
			.read()
			.expect("obc lock poisoned")
			.block_dep_map
			.contains_key(hash)
	}

	/// Number of orphaned blocks currently held.
	pub fn size(&self) -> usize {
		self.inner.read().expect("obc lock poisoned").block_dep_map.len()
	}

	/// Number of distinct missing hashes only an external submit can tie.
	pub fn dependency_size(&self) -> usize {
		self.inner.read().expect("obc lock poisoned").lose_ends.len()
	}

	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}
}
