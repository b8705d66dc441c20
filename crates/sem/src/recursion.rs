//! Per-thread recursion tracking for in-flight computations.
//!
//! Every computation pushes a frame naming the node and the key whose
//! producers are running. A nested query that asks for that key on the same
//! node is a cycle: it receives a provisional empty answer, and the thread's session
//! epoch is bumped so that no enclosing computation publishes a result built on
//! that provisional answer.
//!
//! # Invariants
//!
//! * Frames are strictly LIFO per thread; [`Frame`] pops on drop, including
//!   during unwinding.
//! * [`StackStamp::may_cache_now`] is true only if the stack is back at the
//!   marked depth and the epoch has not moved since the mark.
//! * The epoch is monotonic and never reset, so a stamp can never observe a
//!   stale "clean" value.

use std::cell::RefCell;
use std::marker::PhantomData;

use sema_tree::NodeId;
use crate::key::SemKey;

thread_local! {
	static SESSION: RefCell<Session> = RefCell::new(Session::default());
}

#[derive(Default)]
struct Session {
	frames: Vec<FrameData>,
	epoch: u64,
}

struct FrameData {
	owner: u64,
	node: NodeId,
	key: SemKey,
}

/// Snapshot of the session taken before a computation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStamp {
	depth: usize,
	epoch: u64,
}

impl StackStamp {
	/// True if nothing reentrant happened on this thread since the mark.
	pub fn may_cache_now(&self) -> bool {
		SESSION.with(|s| {
			let s = s.borrow();
			s.frames.len() == self.depth && s.epoch == self.epoch
		})
	}

	pub fn depth(&self) -> usize {
		self.depth
	}
}

/// Captures the current depth and epoch of this thread's session.
pub fn mark_stack() -> StackStamp {
	SESSION.with(|s| {
		let s = s.borrow();
		StackStamp {
			depth: s.frames.len(),
			epoch: s.epoch,
		}
	})
}

/// Current number of open frames on this thread.
pub fn depth() -> usize {
	SESSION.with(|s| s.borrow().frames.len())
}

/// True if `key` is already being computed for `node` by `owner` on this thread.
pub(crate) fn in_progress(owner: u64, node: NodeId, key: SemKey) -> bool {
	SESSION.with(|s| {
		s.borrow()
			.frames
			.iter()
			.any(|f| f.owner == owner && f.node == node && f.key == key)
	})
}

/// Marks every open computation on this thread as uncacheable.
pub(crate) fn prohibit_caching() {
	SESSION.with(|s| {
		let mut s = s.borrow_mut();
		s.epoch = s.epoch.wrapping_add(1);
	});
}

/// Open computation frame. Pops itself on drop.
///
/// Not `Send`: the frame belongs to the thread that pushed it.
pub(crate) struct Frame {
	depth: usize,
	_thread: PhantomData<*const ()>,
}

impl Frame {
	pub(crate) fn push(owner: u64, node: NodeId, key: SemKey) -> Self {
		let depth = SESSION.with(|s| {
			let mut s = s.borrow_mut();
			s.frames.push(FrameData { owner, node, key });
			s.frames.len()
		});
		Self {
			depth,
			_thread: PhantomData,
		}
	}
}

impl Drop for Frame {
	fn drop(&mut self) {
		SESSION.with(|s| {
			let mut s = s.borrow_mut();
			debug_assert_eq!(s.frames.len(), self.depth, "recursion frames popped out of order");
			s.frames.pop();
		});
	}
}

#[cfg(test)]
mod tests {
	use sema_tree::Tree;

	use super::*;

	fn node() -> NodeId {
		Tree::new().insert_root(())
	}

	#[test]
	fn clean_computation_may_cache() {
		let n = node();
		let stamp = mark_stack();
		{
			let _f = Frame::push(1, n, SemKey::from_index(0));
			assert!(in_progress(1, n, SemKey::from_index(0)));
			assert!(!in_progress(2, n, SemKey::from_index(0)));
			assert!(!in_progress(1, n, SemKey::from_index(1)));
			assert!(!stamp.may_cache_now());
		}
		assert!(stamp.may_cache_now());
		assert_eq!(depth(), 0);
	}

	#[test]
	fn cycle_taints_every_open_stamp() {
		let n = node();
		let outer = mark_stack();
		let f_outer = Frame::push(1, n, SemKey::from_index(0));
		let inner = mark_stack();
		{
			let _f = Frame::push(1, n, SemKey::from_index(1));
			prohibit_caching();
		}
		assert!(!inner.may_cache_now());
		drop(f_outer);
		assert!(!outer.may_cache_now());

		// A fresh computation after the cycle resolved is clean again.
		let later = mark_stack();
		let f = Frame::push(1, n, SemKey::from_index(0));
		drop(f);
		assert!(later.may_cache_now());
	}

	#[test]
	fn frames_pop_during_unwinding() {
		let n = node();
		let result = std::panic::catch_unwind(|| {
			let _f = Frame::push(7, n, SemKey::from_index(3));
			panic!("producer blew up");
		});
		assert!(result.is_err());
		assert_eq!(depth(), 0);
		assert!(!in_progress(7, n, SemKey::from_index(3)));
	}
}
