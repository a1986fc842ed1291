//! Known-address bookkeeping for the outbound dialer.
//!
//! The book is internally synchronized; callers never see its lock.
//! Persistence is delegated to the embedding node, the book itself only
//! keeps the in-memory view.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use rand::seq::IteratorRandom;
use tracing::debug;

use crate::types::NetAddress;

#[derive(Clone, Debug)]
struct KnownAddress {
	port: u16,
	/// Unix time of the last outbound attempt; 0 for a fresh address.
	last_try: u64,
	/// Cleared once the address has been dialed at least once.
	is_new: bool,
}

#[derive(Default)]
struct Book {
	known: HashMap<IpAddr, KnownAddress>,
	/// Rotating cursor over the seed list.
	seed_cursor: usize,
}

pub struct AddressBook {
	seeds: Vec<NetAddress>,
	book: Mutex<Book>,
}

impl AddressBook {
	pub fn new(seeds: Vec<NetAddress>) -> Self {
		AddressBook {
			seeds,
			book: Mutex::new(Book::default()),
		}
	}

	pub fn init(&self) {
		debug!(seeds = self.seeds.len(), "address book initialized");
	}

	/// Records a routable address. Non-routable and seed addresses are
	/// ignored; a known address keeps its last-try bookkeeping.
	pub fn add_new_address(&self, addr: NetAddress) {
		if !addr.is_routable() || self.is_seed_address(&addr) {
			return;
		}
		let mut book = self.book.lock().expect("address book lock poisoned");
		book.known.entry(addr.ip()).or_insert(KnownAddress {
			port: addr.port(),
			last_try: 0,
			is_new: true,
		});
	}

	pub fn is_seed_address(&self, addr: &NetAddress) -> bool {
		self.seeds.iter().any(|seed| seed.ip() == addr.ip())
	}

	/// Next seed in rotation, if any are configured.
	pub fn get_one_seed(&self) -> Option<NetAddress> {
		if self.seeds.is_empty() {
			return None;
		}
		let mut book = self.book.lock().expect("address book lock poisoned");
		let seed = self.seeds[book.seed_cursor % self.seeds.len()];
		book.seed_cursor = book.seed_cursor.wrapping_add(1);
		Some(seed)
	}

	/// A uniformly random known address, optionally restricted to ones
	/// that have never been dialed.
	pub fn get_one_address(&self, only_new: bool) -> Option<NetAddress> {
		let book = self.book.lock().expect("address book lock poisoned");
		book.known
			.iter()
			.filter(|(_, known)| !only_new || known.is_new)
			.choose(&mut rand::thread_rng())
			.map(|(ip, known)| NetAddress::new(*ip, known.port))
	}

	pub fn get_last_try(&self, addr: &NetAddress) -> u64 {
		let book = self.book.lock().expect("address book lock poisoned");
		book.known.get(&addr.ip()).map(|known| known.last_try).unwrap_or(0)
	}

	pub fn set_last_try(&self, addr: &NetAddress, time: u64) {
		let mut book = self.book.lock().expect("address book lock poisoned");
		if let Some(known) = book.known.get_mut(&addr.ip()) {
			known.last_try = time;
			known.is_new = false;
		}
	}

	pub fn len(&self) -> usize {
		self.book.lock().expect("address book lock poisoned").known.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
