use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::NodeId;

/// Change notification emitted by a [`crate::Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
	/// Something in the tree changed. Carries no payload by contract.
	Modified,
	/// A node was removed and its handle is now dead.
	Detached(NodeId),
}

/// Receiver of [`TreeEvent`]s.
///
/// Called synchronously on the mutating thread after the tree lock has been
/// released, so implementations may read the tree.
pub trait TreeListener: Send + Sync {
	fn on_tree_event(&self, event: TreeEvent);
}

/// Handle returned by [`crate::Tree::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

#[derive(Default)]
pub(crate) struct Listeners {
	next: AtomicU64,
	entries: RwLock<Vec<(Subscription, Weak<dyn TreeListener>)>>,
}

impl Listeners {
	pub(crate) fn add(&self, listener: Weak<dyn TreeListener>) -> Subscription {
		let sub = Subscription(self.next.fetch_add(1, Ordering::Relaxed));
		self.entries.write().push((sub, listener));
		sub
	}

	pub(crate) fn remove(&self, sub: Subscription) -> bool {
		let mut entries = self.entries.write();
		let before = entries.len();
		entries.retain(|(s, _)| *s != sub);
		entries.len() != before
	}

	pub(crate) fn len(&self) -> usize {
		self.entries.read().len()
	}

	/// Delivers `events` in order to every live listener.
	///
	/// The listener list is snapshotted first; listeners may subscribe or
	/// unsubscribe from inside a callback.
	pub(crate) fn dispatch(&self, events: &[TreeEvent]) {
		if events.is_empty() {
			return;
		}

		let live: Vec<_> = {
			let entries = self.entries.read();
			entries.iter().filter_map(|(_, w)| w.upgrade()).collect()
		};

		if live.len() != self.len() {
			self.entries.write().retain(|(_, w)| w.strong_count() > 0);
		}

		tracing::trace!(listeners = live.len(), events = events.len(), "tree.dispatch");
		for listener in &live {
			for &event in events {
				listener.on_tree_event(event);
			}
		}
	}
}
