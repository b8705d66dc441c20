//! Reentrant atomic-change scopes that defer invalidation.
//!
//! While at least one batch is open, invalidation requests only raise a
//! pending flag. When the outermost batch closes, a pending invalidation runs
//! exactly once. Outside a batch, requests invalidate immediately.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
	Idle,
	InBatch { depth: usize, pending: bool },
}

/// What the caller must do after a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Flush {
	/// Nothing to do.
	None,
	/// Run the invalidation now.
	Invalidate,
}

/// Batch state machine.
///
/// Never runs the invalidation itself; transitions return a [`Flush`] so the
/// owner invalidates after the lock has been released.
#[derive(Debug)]
pub struct BatchController {
	state: Mutex<BatchState>,
}

impl Default for BatchController {
	fn default() -> Self {
		Self {
			state: Mutex::new(BatchState::Idle),
		}
	}
}

impl BatchController {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn state(&self) -> BatchState {
		*self.state.lock()
	}

	pub fn is_inside_atomic_change(&self) -> bool {
		matches!(self.state(), BatchState::InBatch { .. })
	}

	pub fn enter_batch(&self) {
		let mut state = self.state.lock();
		*state = match *state {
			BatchState::Idle => BatchState::InBatch {
				depth: 1,
				pending: false,
			},
			BatchState::InBatch { depth, pending } => BatchState::InBatch {
				depth: depth + 1,
				pending,
			},
		};
	}

	pub fn request_invalidate(&self) -> Flush {
		let mut state = self.state.lock();
		match &mut *state {
			BatchState::Idle => Flush::Invalidate,
			BatchState::InBatch { pending, .. } => {
				*pending = true;
				Flush::None
			}
		}
	}

	/// Closes one batch level.
	///
	/// # Panics
	///
	/// If no batch is open.
	pub fn exit_batch(&self) -> Flush {
		let mut state = self.state.lock();
		match *state {
			BatchState::Idle => panic!("exit_batch without matching enter_batch"),
			BatchState::InBatch { depth: 1, pending } => {
				*state = BatchState::Idle;
				if pending { Flush::Invalidate } else { Flush::None }
			}
			BatchState::InBatch { depth, pending } => {
				*state = BatchState::InBatch {
					depth: depth - 1,
					pending,
				};
				Flush::None
			}
		}
	}

	/// Opens a batch closed when the returned guard drops.
	///
	/// `on_flush` runs on drop if the guard closed the outermost batch with an
	/// invalidation pending, including when the scope unwinds.
	pub fn scope<F: FnOnce()>(&self, on_flush: F) -> BatchGuard<'_, F> {
		self.enter_batch();
		BatchGuard {
			batch: self,
			on_flush: Some(on_flush),
		}
	}
}

/// Scoped batch acquisition returned by [`BatchController::scope`].
pub struct BatchGuard<'a, F: FnOnce()> {
	batch: &'a BatchController,
	on_flush: Option<F>,
}

impl<F: FnOnce()> Drop for BatchGuard<'_, F> {
	fn drop(&mut self) {
		if self.batch.exit_batch() == Flush::Invalidate {
			if let Some(f) = self.on_flush.take() {
				f();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use rstest::rstest;

	use super::*;

	#[test]
	fn idle_requests_invalidate_immediately() {
		let b = BatchController::new();
		assert_eq!(b.request_invalidate(), Flush::Invalidate);
		assert_eq!(b.state(), BatchState::Idle);
	}

	#[rstest]
	#[case(1, 0)]
	#[case(1, 5)]
	#[case(3, 1)]
	#[case(4, 7)]
	fn nested_batches_flush_once(#[case] depth: usize, #[case] requests: usize) {
		let b = BatchController::new();
		for _ in 0..depth {
			b.enter_batch();
		}
		for _ in 0..requests {
			assert_eq!(b.request_invalidate(), Flush::None);
		}
		assert!(b.is_inside_atomic_change());

		let flushes: Vec<Flush> = (0..depth).map(|_| b.exit_batch()).collect();
		let expected_last = if requests > 0 { Flush::Invalidate } else { Flush::None };
		assert_eq!(flushes.last(), Some(&expected_last));
		assert!(flushes[..depth - 1].iter().all(|f| *f == Flush::None));
		assert_eq!(b.state(), BatchState::Idle);
	}

	#[test]
	fn pending_flag_survives_nesting() {
		let b = BatchController::new();
		b.enter_batch();
		let _ = b.request_invalidate();
		b.enter_batch();
		assert_eq!(b.state(), BatchState::InBatch { depth: 2, pending: true });
	}

	#[test]
	fn guard_flushes_on_unwind() {
		let b = BatchController::new();
		let flushed = Cell::new(0);
		let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
			let _g = b.scope(|| flushed.set(flushed.get() + 1));
			let _ = b.request_invalidate();
			panic!("batched work failed");
		}));
		assert!(result.is_err());
		assert_eq!(flushed.get(), 1);
		assert_eq!(b.state(), BatchState::Idle);
	}

	#[test]
	#[should_panic(expected = "without matching enter_batch")]
	fn unmatched_exit_panics() {
		let _ = BatchController::new().exit_batch();
	}
}
