//! Shared ledger types: hashes, blocks, transactions and network addresses.

use std::fmt::{self, Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;

use color_eyre::{eyre::eyre, Report, Result};
use serde::{Deserialize, Serialize};

use crate::params::Params;

/// Outpoint index of an input that is not connected to any output.
pub const UNCONNECTED: u32 = u32::MAX;

/// 256-bit content hash identifying blocks, transactions and sync targets.
#[derive(
	Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
	pub const ZERO: Hash256 = Hash256([0u8; 32]);

	/// Hashes arbitrary bytes with 32-byte blake2b.
	pub fn digest(data: &[u8]) -> Self {
		let hash = blake2b_simd::Params::new().hash_length(32).hash(data);
		let mut out = [0u8; 32];
		out.copy_from_slice(hash.as_bytes());
		Hash256(out)
	}

	pub fn is_zero(&self) -> bool {
		*self == Self::ZERO
	}
}

impl Display for Hash256 {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl Debug for Hash256 {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		// full hashes drown the logs, eight bytes identify a block well enough
		write!(f, "{}…", hex::encode(&self.0[..8]))
	}
}

impl FromStr for Hash256 {
	type Err = Report;

	fn from_str(s: &str) -> Result<Self> {
		let bytes = hex::decode(s)?;
		let array: [u8; 32] = bytes
			.try_into()
			.map_err(|_| eyre!("expected 32 hex-encoded bytes"))?;
		Ok(Hash256(array))
	}
}

/// Bitmask over a block's three predecessors, marking the ones a node is
/// still missing. An empty mask means the block is ready for validation.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct MissingParents(u8);

impl MissingParents {
	pub const NONE: MissingParents = MissingParents(0);
	pub const MILESTONE: MissingParents = MissingParents(0b001);
	pub const TIP: MissingParents = MissingParents(0b010);
	pub const PREV: MissingParents = MissingParents(0b100);
	pub const ALL: MissingParents = MissingParents(0b111);

	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}

	pub fn contains(&self, other: MissingParents) -> bool {
		self.0 & other.0 != 0
	}
}

impl std::ops::BitOr for MissingParents {
	type Output = MissingParents;

	fn bitor(self, rhs: Self) -> Self {
		MissingParents(self.0 | rhs.0)
	}
}

impl std::ops::BitOrAssign for MissingParents {
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

/// Reference to the output at `index` of the transaction carried by the
/// block identified by `block_hash`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct TxOutPoint {
	pub block_hash: Hash256,
	pub index: u32,
}

impl TxOutPoint {
	pub fn new(block_hash: Hash256, index: u32) -> Self {
		TxOutPoint { block_hash, index }
	}

	pub fn unconnected() -> Self {
		TxOutPoint {
			block_hash: Hash256::ZERO,
			index: UNCONNECTED,
		}
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxInput {
	pub outpoint: TxOutPoint,
	pub unlock_script: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOutput {
	pub value: u64,
	pub lock_script: Vec<u8>,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Transaction {
	pub inputs: Vec<TxInput>,
	pub outputs: Vec<TxOutput>,
	#[serde(skip)]
	hash: OnceLock<Hash256>,
}

impl Transaction {
	pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
		Transaction {
			inputs,
			outputs,
			hash: OnceLock::new(),
		}
	}

	/// Content hash over inputs and outputs, computed once.
	pub fn hash(&self) -> Hash256 {
		*self.hash.get_or_init(|| {
			let encoded =
				bincode::serde::encode_to_vec((&self.inputs, &self.outputs), wire_config())
					.expect("in-memory encoding is infallible");
			Hash256::digest(&encoded)
		})
	}

	/// Structural sanity checks. Script evaluation happens in the
	/// transaction-verification engine, not here.
	pub fn verify(&self, params: &Params) -> Result<()> {
		if self.inputs.is_empty() || self.outputs.is_empty() {
			return Err(eyre!("transaction with an empty input or output side"));
		}
		let mut total: u64 = 0;
		for output in &self.outputs {
			if output.value > params.max_money {
				return Err(eyre!("output value {} above max money", output.value));
			}
			total = total
				.checked_add(output.value)
				.ok_or_else(|| eyre!("output total overflows"))?;
		}
		if total > params.max_money {
			return Err(eyre!("output total {total} above max money"));
		}
		for (i, input) in self.inputs.iter().enumerate() {
			if self.inputs[..i].iter().any(|o| o.outpoint == input.outpoint) {
				return Err(eyre!("duplicate outpoint {:?}", input.outpoint));
			}
		}
		Ok(())
	}
}

impl PartialEq for Transaction {
	fn eq(&self, other: &Self) -> bool {
		self.hash() == other.hash()
	}
}

impl Eq for Transaction {}

/// A block of the DAG ledger. Every block points at three predecessors:
/// the milestone it confirms, a tip and a free previous block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
	pub version: u32,
	pub milestone_hash: Hash256,
	pub tip_hash: Hash256,
	pub prev_hash: Hash256,
	pub time: u64,
	pub difficulty_target: u32,
	pub nonce: u32,
	pub transactions: Vec<Transaction>,
	#[serde(skip)]
	hash: OnceLock<Hash256>,
}

impl Block {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		version: u32,
		milestone_hash: Hash256,
		tip_hash: Hash256,
		prev_hash: Hash256,
		time: u64,
		difficulty_target: u32,
		nonce: u32,
		transactions: Vec<Transaction>,
	) -> Self {
		Block {
			version,
			milestone_hash,
			tip_hash,
			prev_hash,
			time,
			difficulty_target,
			nonce,
			transactions,
			hash: OnceLock::new(),
		}
	}

	pub fn hash(&self) -> Hash256 {
		*self.hash.get_or_init(|| {
			let encoded = bincode::serde::encode_to_vec(
				(
					self.version,
					&self.milestone_hash,
					&self.tip_hash,
					&self.prev_hash,
					self.time,
					self.difficulty_target,
					self.nonce,
					self.transactions.iter().map(Transaction::hash).collect::<Vec<_>>(),
				),
				wire_config(),
			)
			.expect("in-memory encoding is infallible");
			Hash256::digest(&encoded)
		})
	}

	/// Milestone, tip and previous parent, in that order.
	pub fn parents(&self) -> [Hash256; 3] {
		[self.milestone_hash, self.tip_hash, self.prev_hash]
	}

	/// Parent hashes selected by `mask`. Duplicates are kept; the orphan
	/// container deduplicates when counting dependencies.
	pub fn parents_matching(&self, mask: MissingParents) -> Vec<Hash256> {
		let mut out = Vec::with_capacity(3);
		if mask.contains(MissingParents::MILESTONE) {
			out.push(self.milestone_hash);
		}
		if mask.contains(MissingParents::TIP) {
			out.push(self.tip_hash);
		}
		if mask.contains(MissingParents::PREV) {
			out.push(self.prev_hash);
		}
		out
	}
}

impl PartialEq for Block {
	fn eq(&self, other: &Self) -> bool {
		self.hash() == other.hash()
	}
}

impl Eq for Block {}

/// Routable endpoint of a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NetAddress(pub SocketAddr);

impl NetAddress {
	pub fn new(ip: IpAddr, port: u16) -> Self {
		NetAddress(SocketAddr::new(ip, port))
	}

	pub fn ip(&self) -> IpAddr {
		self.0.ip()
	}

	pub fn port(&self) -> u16 {
		self.0.port()
	}

	/// Addresses we are willing to store and relay. Loopback, link-local
	/// and unspecified addresses never leave the machine they name.
	pub fn is_routable(&self) -> bool {
		match self.0.ip() {
			IpAddr::V4(ip) => !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified(),
			IpAddr::V6(ip) => {
				!ip.is_loopback() && !ip.is_unspecified() && (ip.segments()[0] & 0xffc0) != 0xfe80
			},
		}
	}
}

impl Display for NetAddress {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<SocketAddr> for NetAddress {
	fn from(addr: SocketAddr) -> Self {
		NetAddress(addr)
	}
}

impl FromStr for NetAddress {
	type Err = Report;

	fn from_str(s: &str) -> Result<Self> {
		Ok(NetAddress(s.parse::<SocketAddr>()?))
	}
}

/// Bincode configuration shared by hashing and the wire codec.
pub(crate) fn wire_config() -> bincode::config::Configuration {
	bincode::config::standard()
}
