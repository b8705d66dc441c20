//! The semantic element service.
//!
//! # Purpose
//!
//! Answer "which semantic elements of kind K are attached to node N", computing
//! them on demand and caching them until the tree changes.
//!
//! # Query protocol
//!
//! 1. Cache check: read every inheritor of K from the node's chunk. If all are
//!    present (possibly empty), return their union.
//! 2. Compute: for the missing inheritors, mark the recursion stack and run
//!    each inheritor's applicable producers under a frame for that one key.
//!    Inheritors whose producers are already running for this node on this
//!    thread are cyclic and contribute a provisional empty list.
//! 3. Publish: only if the stamp reports no reentrancy, write each computed
//!    list (even empty) into the chunk of the store generation pinned at step 1.
//! 4. Return the union of cached and computed lists, in inheritor order,
//!    de-duplicated by element identity.
//!
//! # Invalidation
//!
//! * Tree modified → full invalidation, deferred while an atomic change is open.
//! * Node detached → that node's chunk is evicted, and publishes racing the
//!   eviction in the same store generation are taken back.
//! * Low memory → full invalidation, dropped if any computation is in flight.
//!
//! # Failure modes
//!
//! * A failing producer contributes nothing; the failure is reported in the
//!   [`Answer`] and the remaining results are still returned and cached.
//! * Cancellation propagates as [`SemError::Cancelled`] and publishes nothing,
//!   here or in any enclosing computation on the same thread.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use rustc_hash::FxHashSet;
use sema_tree::{NodeId, Subscription, Tree, TreeEvent, TreeListener};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchController, Flush};
use crate::config::SemConfig;
use crate::element::{SemElement, extend_unique};
use crate::error::{Cancelled, ProducerError, ProducerFailure, Result};
use crate::key::{KeyHierarchy, SemKey};
use crate::memory::{LowMemoryListener, LowMemoryNotifier};
use crate::producer::{ProducerRegistry, ProducerSet, ProducerSource};
use crate::recursion::{self, Frame};
use crate::stats::{Counters, SemStats};
use crate::store::{CacheStore, CachedList};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a query: the elements plus any producer failures met on the way.
#[derive(Debug, Default)]
pub struct Answer {
	elements: Vec<SemElement>,
	failures: Vec<ProducerFailure>,
}

impl Answer {
	pub fn elements(&self) -> &[SemElement] {
		&self.elements
	}

	pub fn failures(&self) -> &[ProducerFailure] {
		&self.failures
	}

	pub fn into_elements(self) -> Vec<SemElement> {
		self.elements
	}

	pub fn into_parts(self) -> (Vec<SemElement>, Vec<ProducerFailure>) {
		(self.elements, self.failures)
	}

	pub fn len(&self) -> usize {
		self.elements.len()
	}

	pub fn is_empty(&self) -> bool {
		self.elements.is_empty()
	}
}

/// Context handed to producers.
///
/// Nested queries made through it inherit the caller's cancellation token.
pub struct QueryCx<'a> {
	service: &'a SemService,
	cancel: Option<&'a CancellationToken>,
}

impl<'a> QueryCx<'a> {
	pub fn service(&self) -> &'a SemService {
		self.service
	}

	pub fn keys(&self) -> &'a KeyHierarchy {
		&self.service.keys
	}

	/// Queries the cache on behalf of the running producer.
	pub fn query(&self, key: SemKey, node: NodeId) -> Result<Answer> {
		self.service.query_with(key, node, self.cancel)
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_some_and(CancellationToken::is_cancelled)
	}

	/// Returns `Err(Cancelled)` once cancellation was requested.
	pub fn check_cancelled(&self) -> std::result::Result<(), Cancelled> {
		if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
	}
}

/// Holds the in-flight counter up for the duration of a computation.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
	fn enter(counter: &'a AtomicUsize) -> Self {
		counter.fetch_add(1, Ordering::SeqCst);
		Self(counter)
	}
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		let prev = self.0.fetch_sub(1, Ordering::SeqCst);
		debug_assert!(prev > 0, "in-flight computation counter underflow");
	}
}

/// Lazily computing, inheritance-aware cache of semantic elements.
pub struct SemService {
	id: u64,
	keys: Arc<KeyHierarchy>,
	registry: ProducerRegistry,
	store: CacheStore,
	batch: BatchController,
	in_flight: AtomicUsize,
	config: SemConfig,
	counters: Counters,
}

impl SemService {
	pub fn new(
		keys: Arc<KeyHierarchy>,
		source: Arc<dyn ProducerSource>,
		config: SemConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
			keys,
			registry: ProducerRegistry::new(source),
			store: CacheStore::new(),
			batch: BatchController::new(),
			in_flight: AtomicUsize::new(0),
			config,
			counters: Counters::default(),
		})
	}

	/// Builds a service over an explicit producer set with default config.
	pub fn with_producers(keys: Arc<KeyHierarchy>, producers: ProducerSet) -> Arc<Self> {
		Self::new(keys, Arc::new(producers), SemConfig::default())
	}

	/// Subscribes to `tree`'s change notifications. The tree holds the service
	/// weakly.
	pub fn attach<T>(self: &Arc<Self>, tree: &Tree<T>) -> Subscription {
		let listener: Weak<dyn TreeListener> = Arc::downgrade(self) as Weak<dyn TreeListener>;
		tree.subscribe(listener)
	}

	/// Subscribes to low-memory signals.
	pub fn watch_memory(self: &Arc<Self>, notifier: &LowMemoryNotifier) {
		let listener: Weak<dyn LowMemoryListener> =
			Arc::downgrade(self) as Weak<dyn LowMemoryListener>;
		notifier.subscribe(listener);
	}

	pub fn keys(&self) -> &KeyHierarchy {
		&self.keys
	}

	pub fn config(&self) -> &SemConfig {
		&self.config
	}

	/// Returns the elements of kind `key` (or any subtype) attached to `node`.
	///
	/// A key this service's hierarchy never issued has no producers and yields
	/// an empty answer. Keys from another hierarchy with fewer keys alias
	/// silently.
	pub fn query(&self, key: SemKey, node: NodeId) -> Result<Answer> {
		self.query_with(key, node, None)
	}

	/// Like [`Self::query`], checking `cancel` before every producer runs.
	pub fn query_cancellable(
		&self,
		key: SemKey,
		node: NodeId,
		cancel: &CancellationToken,
	) -> Result<Answer> {
		self.query_with(key, node, Some(cancel))
	}

	/// First element of [`Self::query`], if any.
	pub fn first(&self, key: SemKey, node: NodeId) -> Result<Option<SemElement>> {
		Ok(self.query(key, node)?.into_elements().into_iter().next())
	}

	/// Cache check only. `None` unless every inheritor of `key` is cached.
	pub fn cached_only(&self, key: SemKey, node: NodeId) -> Option<Vec<SemElement>> {
		if !self.keys.contains(key) {
			return None;
		}
		let chunk = self.store.get(node)?;
		let mut out = Vec::new();
		let mut seen = FxHashSet::default();
		for k in self.keys.inheritors(key).iter() {
			extend_unique(&mut out, &mut seen, &chunk.read(*k)?);
		}
		Some(out)
	}

	/// Seeds the cache for exactly `key` with an out-of-band result.
	pub fn set_cached_sem_element(&self, key: SemKey, node: NodeId, element: Option<SemElement>) {
		let list: CachedList = element.into_iter().collect();
		self.store.get_or_create(node).write(key, list);
	}

	/// Evicts one node's chunk. Returns true if one existed.
	pub fn clear_cached_sem_elements(&self, node: NodeId) -> bool {
		self.store.evict_one(node)
	}

	/// Drops every cached result.
	pub fn clear_cache(&self) {
		self.invalidate("explicit");
	}

	/// Runs `work` with invalidation deferred until the outermost atomic change
	/// ends. The batch closes even if `work` panics.
	pub fn perform_atomic_change<R>(&self, work: impl FnOnce() -> R) -> R {
		let _batch = self.batch.scope(|| self.invalidate("atomic change"));
		work()
	}

	pub fn is_inside_atomic_change(&self) -> bool {
		self.batch.is_inside_atomic_change()
	}

	/// Drops chunks of nodes `is_live` rejects.
	pub fn sweep(&self, is_live: impl FnMut(NodeId) -> bool) -> usize {
		let dropped = self.store.retain(is_live);
		tracing::debug!(dropped, "sem.sweep");
		dropped
	}

	/// Forces the producer registry to be rebuilt, dropping all cached results.
	pub fn invalidate_registry(&self) {
		self.registry.invalidate();
		self.invalidate("registry changed");
	}

	/// Number of computations currently running producers, process-wide.
	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::SeqCst)
	}

	/// Number of nodes with cached results.
	pub fn cached_nodes(&self) -> usize {
		self.store.len()
	}

	pub fn stats(&self) -> SemStats {
		self.counters.snapshot()
	}

	fn invalidate(&self, reason: &'static str) {
		self.store.clear_all();
		Counters::bump(&self.counters.invalidations);
		tracing::debug!(reason, "sem.invalidate");
	}

	fn on_modified(&self) {
		match self.batch.request_invalidate() {
			Flush::Invalidate => self.invalidate("tree modified"),
			Flush::None => tracing::trace!("sem.invalidate.deferred"),
		}
	}

	fn low_memory(&self) {
		if !self.config.low_memory_eviction {
			return;
		}
		let in_flight = self.in_flight();
		if in_flight > 0 {
			Counters::bump(&self.counters.dropped_low_memory);
			tracing::debug!(in_flight, "sem.low_memory.dropped");
			return;
		}
		self.invalidate("low memory");
	}

	pub(crate) fn query_with(
		&self,
		key: SemKey,
		node: NodeId,
		cancel: Option<&CancellationToken>,
	) -> Result<Answer> {
		if !self.keys.contains(key) {
			tracing::debug!(key = %key, "sem.query.foreign_key");
			return Ok(Answer::default());
		}
		let view = self.store.view();
		let inheritors = self.keys.inheritors(key);
		let chunk = view.get(node);

		let cached: SmallVec<[Option<CachedList>; 4]> = inheritors
			.iter()
			.map(|k| {
				chunk
					.as_ref()
					.filter(|_| self.config.caching)
					.and_then(|c| c.read(*k))
			})
			.collect();

		if cached.iter().all(Option::is_some) {
			Counters::bump(&self.counters.hits);
			tracing::trace!(key = self.keys.name(key), %node, "sem.query.hit");
			let mut answer = Answer::default();
			let mut seen = FxHashSet::default();
			for list in cached.iter().flatten() {
				extend_unique(&mut answer.elements, &mut seen, list);
			}
			return Ok(answer);
		}
		Counters::bump(&self.counters.misses);

		let mut computable: SmallVec<[SemKey; 4]> = SmallVec::new();
		for (k, c) in inheritors.iter().zip(&cached) {
			if c.is_some() {
				continue;
			}
			if recursion::in_progress(self.id, node, *k) {
				tracing::trace!(key = self.keys.name(*k), %node, "sem.query.cycle");
				recursion::prohibit_caching();
			} else {
				computable.push(*k);
			}
		}

		if !computable.is_empty() && recursion::depth() >= self.config.max_recursion_depth {
			tracing::warn!(
				key = self.keys.name(key),
				%node,
				depth = recursion::depth(),
				"sem.query.too_deep"
			);
			recursion::prohibit_caching();
			computable.clear();
		}

		let mut failures = Vec::new();
		let mut computed: SmallVec<[(SemKey, Vec<SemElement>); 4]> = SmallVec::new();
		let stamp = recursion::mark_stack();
		if !computable.is_empty() {
			let _in_flight = InFlight::enter(&self.in_flight);
			let cx = QueryCx {
				service: self,
				cancel,
			};

			for &k in &computable {
				// A nested query of an earlier producer may have published `k` already.
				if let Some(list) = view.read(node, k).filter(|_| self.config.caching) {
					computed.push((k, list.to_vec()));
					continue;
				}
				let producers = self.registry.producers_for(&self.keys, k)?;
				// Only `k` is in progress; siblings not yet started are fair game.
				let _frame = Frame::push(self.id, node, k);
				let mut out = Vec::new();
				for p in producers.iter() {
					if cx.is_cancelled() {
						recursion::prohibit_caching();
						return Err(Cancelled.into());
					}
					match p.apply(&cx, node) {
						Ok(Some(e)) => out.push(e),
						Ok(None) => {}
						Err(ProducerError::Cancelled(c)) => {
							recursion::prohibit_caching();
							return Err(c.into());
						}
						Err(ProducerError::Failed(error)) => {
							Counters::bump(&self.counters.producer_failures);
							tracing::warn!(
								producer = p.name(),
								key = self.keys.name(k),
								%node,
								error = %error,
								"sem.producer.failed"
							);
							failures.push(ProducerFailure {
								producer: p.name(),
								key: k,
								error,
							});
						}
					}
				}
				computed.push((k, out));
			}
		}

		if self.config.caching && stamp.may_cache_now() {
			if !computed.is_empty() {
				let chunk = view.get_or_create(node);
				for (k, list) in &computed {
					chunk.write(*k, list.iter().cloned().collect());
				}
				// Detached while computing: take back what was just written.
				if view.is_detached(node) {
					view.evict(node);
					tracing::trace!(%node, "sem.query.publish.detached");
				} else {
					tracing::trace!(
						key = self.keys.name(key),
						%node,
						keys = computed.len(),
						"sem.query.publish"
					);
				}
			}
		} else {
			Counters::bump(&self.counters.uncacheable);
			tracing::trace!(key = self.keys.name(key), %node, "sem.query.uncacheable");
		}

		let mut answer = Answer {
			elements: Vec::new(),
			failures,
		};
		let mut seen = FxHashSet::default();
		for (k, c) in inheritors.iter().zip(&cached) {
			if let Some(list) = c {
				extend_unique(&mut answer.elements, &mut seen, list);
			} else if let Some((_, list)) = computed.iter().find(|(ck, _)| ck == k) {
				extend_unique(&mut answer.elements, &mut seen, list);
			}
		}
		Ok(answer)
	}
}

impl TreeListener for SemService {
	fn on_tree_event(&self, event: TreeEvent) {
		match event {
			TreeEvent::Modified => self.on_modified(),
			TreeEvent::Detached(node) => {
				if self.store.detach(node) {
					tracing::trace!(%node, "sem.evict.detached");
				}
			}
		}
	}
}

impl LowMemoryListener for SemService {
	fn on_low_memory(&self) {
		self.low_memory();
	}
}
