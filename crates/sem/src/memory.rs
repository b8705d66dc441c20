use std::sync::Weak;

use parking_lot::Mutex;

/// Receiver of low-memory signals.
pub trait LowMemoryListener: Send + Sync {
	fn on_low_memory(&self);
}

/// Broadcasts low-memory signals to weakly held listeners.
#[derive(Default)]
pub struct LowMemoryNotifier {
	listeners: Mutex<Vec<Weak<dyn LowMemoryListener>>>,
}

impl LowMemoryNotifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, listener: Weak<dyn LowMemoryListener>) {
		self.listeners.lock().push(listener);
	}

	/// Signals every live listener; returns how many were reached.
	pub fn fire(&self) -> usize {
		let live: Vec<_> = {
			let mut listeners = self.listeners.lock();
			listeners.retain(|l| l.strong_count() > 0);
			listeners.iter().filter_map(Weak::upgrade).collect()
		};
		tracing::debug!(listeners = live.len(), "sem.low_memory.fire");
		for l in &live {
			l.on_low_memory();
		}
		live.len()
	}
}
