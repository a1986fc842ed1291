//! Seams towards the validation engine and the mempool.
//!
//! The core never validates block contents or manages UTXO state; it hands
//! admissible data across these traits and asks a handful of questions
//! back. Both collaborators must be callable from any task.

use std::sync::Arc;

use crate::network::connection::ConnectionId;
use crate::network::message::Bundle;
use crate::types::{Block, Transaction};

pub trait DagService: Send + Sync {
	/// Hands a received block to the validation engine. `from` names the
	/// connection the block arrived on, when it arrived over the network.
	fn add_new_block(&self, block: Arc<Block>, from: Option<ConnectionId>);

	fn best_milestone_height(&self) -> u64;

	/// Timestamp of the best milestone block.
	fn best_milestone_time(&self) -> u64;

	/// True when the sync download queue has no outstanding bundles.
	fn is_downloading_empty(&self) -> bool;

	/// Bundle of blocks confirmed by the milestones starting at
	/// `from_height`, served to syncing peers. `None` when this node has
	/// nothing newer.
	fn milestone_bundle(&self, from_height: u64) -> Option<Bundle>;
}

pub trait MempoolService: Send + Sync {
	/// Returns true when the transaction was accepted and is worth
	/// relaying.
	fn receive_tx(&self, tx: Arc<Transaction>) -> bool;
}
