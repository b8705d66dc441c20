use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemStats {
	/// Queries answered entirely from the cache.
	pub hits: u64,
	/// Queries that had to run producers.
	pub misses: u64,
	/// Computations whose result was not published because of reentrancy.
	pub uncacheable: u64,
	/// Full invalidations performed.
	pub invalidations: u64,
	/// Low-memory signals dropped because a computation was in flight.
	pub dropped_low_memory: u64,
	/// Producer invocations that returned an error.
	pub producer_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
	pub(crate) hits: AtomicU64,
	pub(crate) misses: AtomicU64,
	pub(crate) uncacheable: AtomicU64,
	pub(crate) invalidations: AtomicU64,
	pub(crate) dropped_low_memory: AtomicU64,
	pub(crate) producer_failures: AtomicU64,
}

impl Counters {
	#[inline]
	pub(crate) fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn snapshot(&self) -> SemStats {
		SemStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			uncacheable: self.uncacheable.load(Ordering::Relaxed),
			invalidations: self.invalidations.load(Ordering::Relaxed),
			dropped_low_memory: self.dropped_low_memory.load(Ordering::Relaxed),
			producer_failures: self.producer_failures.load(Ordering::Relaxed),
		}
	}
}
