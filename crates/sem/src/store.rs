//! Concurrent node → chunk storage.
//!
//! # Mental model
//!
//! * A [`Chunk`] maps keys to cached element lists for one node. Its map is an
//!   immutable snapshot behind an [`ArcSwap`]; writers publish a copy with one
//!   more entry, so readers never lock and concurrent writes of different keys
//!   never lose each other.
//! * The [`CacheStore`] holds the current generation of the node → chunk map,
//!   together with the nodes detached during that generation.
//!   [`CacheStore::clear_all`] swaps in a fresh, empty generation. Anyone who
//!   pinned the previous generation through a [`StoreView`] keeps a complete,
//!   consistent (stale) view; writes into it are simply never observed again.
//!
//! # Invariants
//!
//! * At most one chunk per node per generation ([`StoreView::get_or_create`] is
//!   atomic on the underlying map entry).
//! * An absent entry means "not computed"; an empty list means "computed,
//!   produced nothing".
//! * A detached node has no chunk once every publish that raced the detach
//!   has run its [`StoreView::is_detached`] check.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use rustc_hash::{FxBuildHasher, FxHashMap};
use sema_tree::NodeId;

use crate::element::SemElement;
use crate::key::SemKey;

/// Cached elements for one key.
pub type CachedList = Arc<[SemElement]>;

/// Per-node cache record.
#[derive(Default)]
pub struct Chunk {
	entries: ArcSwap<FxHashMap<SemKey, CachedList>>,
}

impl Chunk {
	/// Returns the cached list for exactly `key`, or `None` if never computed.
	#[inline]
	pub fn read(&self, key: SemKey) -> Option<CachedList> {
		self.entries.load().get(&key).cloned()
	}

	/// Inserts or replaces the entry for `key`.
	pub fn write(&self, key: SemKey, elements: CachedList) {
		self.entries.rcu(|cur| {
			let mut next = FxHashMap::clone(cur);
			next.insert(key, elements.clone());
			next
		});
	}

	/// Number of keys with an entry.
	pub fn len(&self) -> usize {
		self.entries.load().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

type ChunkMap = DashMap<NodeId, Arc<Chunk>, FxBuildHasher>;

#[derive(Default)]
struct Generation {
	chunks: ChunkMap,
	/// Handles never come back once detached, so this only grows until the
	/// generation is swapped out.
	detached: DashSet<NodeId, FxBuildHasher>,
}

/// One pinned generation of the store.
#[derive(Clone)]
pub struct StoreView {
	generation: Arc<Generation>,
}

impl StoreView {
	/// Lookup only; never creates a chunk.
	pub fn get(&self, node: NodeId) -> Option<Arc<Chunk>> {
		self.generation.chunks.get(&node).map(|c| c.value().clone())
	}

	/// Returns the node's chunk, installing an empty one if none exists.
	///
	/// Racing first writers all receive the single installed chunk.
	pub fn get_or_create(&self, node: NodeId) -> Arc<Chunk> {
		self.generation
			.chunks
			.entry(node)
			.or_insert_with(|| Arc::new(Chunk::default()))
			.value()
			.clone()
	}

	/// Reads `key` for `node`, treating a missing chunk as "not computed".
	pub fn read(&self, node: NodeId, key: SemKey) -> Option<CachedList> {
		self.get(node)?.read(key)
	}

	/// True if `node` was detached during this generation.
	pub fn is_detached(&self, node: NodeId) -> bool {
		self.generation.detached.contains(&node)
	}

	/// Removes `node`'s chunk from this generation.
	pub fn evict(&self, node: NodeId) -> bool {
		self.generation.chunks.remove(&node).is_some()
	}
}

/// Weakly scoped, concurrently accessed cache of semantic elements.
pub struct CacheStore {
	current: ArcSwap<Generation>,
}

impl Default for CacheStore {
	fn default() -> Self {
		Self {
			current: ArcSwap::from_pointee(Generation::default()),
		}
	}
}

impl CacheStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pins the current generation.
	pub fn view(&self) -> StoreView {
		StoreView {
			generation: self.current.load_full(),
		}
	}

	pub fn get(&self, node: NodeId) -> Option<Arc<Chunk>> {
		self.view().get(node)
	}

	pub fn get_or_create(&self, node: NodeId) -> Arc<Chunk> {
		self.view().get_or_create(node)
	}

	/// Drops every chunk by swapping in an empty generation.
	pub fn clear_all(&self) {
		self.current.store(Arc::new(Generation::default()));
	}

	/// Removes one node's chunk. Returns true if it existed.
	pub fn evict_one(&self, node: NodeId) -> bool {
		self.current.load().chunks.remove(&node).is_some()
	}

	/// Records `node` as dead, then evicts its chunk.
	///
	/// Publishers that pinned this generation and created the chunk before the
	/// eviction see the record in [`StoreView::is_detached`] afterwards.
	pub fn detach(&self, node: NodeId) -> bool {
		let generation = self.current.load();
		generation.detached.insert(node);
		generation.chunks.remove(&node).is_some()
	}

	/// Drops chunks whose node `is_live` rejects. Returns how many were dropped.
	pub fn retain(&self, mut is_live: impl FnMut(NodeId) -> bool) -> usize {
		let generation = self.current.load();
		let before = generation.chunks.len();
		generation.chunks.retain(|node, _| is_live(*node));
		before.saturating_sub(generation.chunks.len())
	}

	/// Number of nodes with a chunk.
	pub fn len(&self) -> usize {
		self.current.load().chunks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
