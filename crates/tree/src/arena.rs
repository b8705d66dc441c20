use std::fmt;
use std::sync::Weak;

use parking_lot::RwLock;
use slab::Slab;
use smallvec::SmallVec;

use crate::events::{Listeners, Subscription, TreeEvent, TreeListener};

/// Stable handle to a tree node.
///
/// Hashable and `Copy`. Resolves only while the node it was issued for is
/// attached; after removal every lookup through it returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
	index: u32,
	generation: u32,
}

impl NodeId {
	/// Returns the arena slot index.
	#[inline]
	pub const fn index(self) -> u32 {
		self.index
	}

	/// Returns the slot generation this handle was issued for.
	#[inline]
	pub const fn generation(self) -> u32 {
		self.generation
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "n{}v{}", self.index, self.generation)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
	#[error("node {0} is not attached to the tree")]
	StaleNode(NodeId),
}

struct NodeData<T> {
	generation: u32,
	parent: Option<NodeId>,
	children: SmallVec<[NodeId; 4]>,
	data: T,
}

struct Arena<T> {
	nodes: Slab<NodeData<T>>,
	/// Next generation per slot, bumped on removal.
	generations: Vec<u32>,
}

impl<T> Arena<T> {
	fn resolve(&self, id: NodeId) -> Option<&NodeData<T>> {
		self.nodes
			.get(id.index as usize)
			.filter(|n| n.generation == id.generation)
	}

	fn resolve_mut(&mut self, id: NodeId) -> Option<&mut NodeData<T>> {
		self.nodes
			.get_mut(id.index as usize)
			.filter(|n| n.generation == id.generation)
	}

	fn insert(&mut self, parent: Option<NodeId>, data: T) -> NodeId {
		let index = self.nodes.vacant_key();
		if self.generations.len() <= index {
			self.generations.resize(index + 1, 0);
		}
		let generation = self.generations[index];
		self.nodes.insert(NodeData {
			generation,
			parent,
			children: SmallVec::new(),
			data,
		});
		NodeId {
			index: index as u32,
			generation,
		}
	}

	/// Removes `root` and its descendants, returning the removed handles.
	fn remove_subtree(&mut self, root: NodeId) -> Vec<NodeId> {
		let mut removed = Vec::new();
		let mut pending = vec![root];
		while let Some(id) = pending.pop() {
			let node = self.nodes.remove(id.index as usize);
			self.generations[id.index as usize] = node.generation.wrapping_add(1);
			pending.extend(node.children.iter().copied());
			removed.push(id);
		}
		removed
	}
}

/// Generational node arena with change notifications.
///
/// All mutators emit their [`TreeEvent`]s after releasing the arena lock.
pub struct Tree<T> {
	arena: RwLock<Arena<T>>,
	listeners: Listeners,
}

impl<T> Default for Tree<T> {
	fn default() -> Self {
		Self {
			arena: RwLock::new(Arena {
				nodes: Slab::new(),
				generations: Vec::new(),
			}),
			listeners: Listeners::default(),
		}
	}
}

impl<T> Tree<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a listener. The tree only holds it weakly.
	pub fn subscribe(&self, listener: Weak<dyn TreeListener>) -> Subscription {
		self.listeners.add(listener)
	}

	/// Returns false if `sub` was already gone.
	pub fn unsubscribe(&self, sub: Subscription) -> bool {
		self.listeners.remove(sub)
	}

	/// Inserts a parentless node.
	pub fn insert_root(&self, data: T) -> NodeId {
		let id = self.arena.write().insert(None, data);
		self.listeners.dispatch(&[TreeEvent::Modified]);
		id
	}

	/// Inserts `data` as the last child of `parent`.
	pub fn append(&self, parent: NodeId, data: T) -> Result<NodeId, TreeError> {
		let id = {
			let mut arena = self.arena.write();
			if arena.resolve(parent).is_none() {
				return Err(TreeError::StaleNode(parent));
			}
			let id = arena.insert(Some(parent), data);
			if let Some(p) = arena.resolve_mut(parent) {
				p.children.push(id);
			}
			id
		};
		self.listeners.dispatch(&[TreeEvent::Modified]);
		Ok(id)
	}

	/// Replaces a node's payload, returning the previous one.
	pub fn set(&self, node: NodeId, data: T) -> Result<T, TreeError> {
		let old = {
			let mut arena = self.arena.write();
			let n = arena.resolve_mut(node).ok_or(TreeError::StaleNode(node))?;
			std::mem::replace(&mut n.data, data)
		};
		self.listeners.dispatch(&[TreeEvent::Modified]);
		Ok(old)
	}

	/// Mutates a node's payload in place.
	pub fn update<R>(&self, node: NodeId, f: impl FnOnce(&mut T) -> R) -> Result<R, TreeError> {
		let out = {
			let mut arena = self.arena.write();
			let n = arena.resolve_mut(node).ok_or(TreeError::StaleNode(node))?;
			f(&mut n.data)
		};
		self.listeners.dispatch(&[TreeEvent::Modified]);
		Ok(out)
	}

	/// Removes `node` and its whole subtree.
	///
	/// Emits one [`TreeEvent::Detached`] per removed node, then a single
	/// [`TreeEvent::Modified`]. Returns the number of removed nodes.
	pub fn remove(&self, node: NodeId) -> Result<usize, TreeError> {
		let removed = {
			let mut arena = self.arena.write();
			let parent = arena.resolve(node).ok_or(TreeError::StaleNode(node))?.parent;
			if let Some(p) = parent.and_then(|p| arena.resolve_mut(p)) {
				p.children.retain(|c| *c != node);
			}
			arena.remove_subtree(node)
		};

		let mut events: Vec<TreeEvent> = removed.iter().copied().map(TreeEvent::Detached).collect();
		events.push(TreeEvent::Modified);
		self.listeners.dispatch(&events);
		Ok(removed.len())
	}

	/// Reads a node's payload under the arena read lock.
	pub fn with<R>(&self, node: NodeId, f: impl FnOnce(&T) -> R) -> Option<R> {
		self.arena.read().resolve(node).map(|n| f(&n.data))
	}

	pub fn contains(&self, node: NodeId) -> bool {
		self.arena.read().resolve(node).is_some()
	}

	pub fn parent(&self, node: NodeId) -> Option<NodeId> {
		self.arena.read().resolve(node).and_then(|n| n.parent)
	}

	pub fn children(&self, node: NodeId) -> Vec<NodeId> {
		self.arena
			.read()
			.resolve(node)
			.map(|n| n.children.to_vec())
			.unwrap_or_default()
	}

	/// Number of attached nodes.
	pub fn len(&self) -> usize {
		self.arena.read().nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T: Clone> Tree<T> {
	/// Returns a copy of a node's payload.
	pub fn data(&self, node: NodeId) -> Option<T> {
		self.with(node, T::clone)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use parking_lot::Mutex;

	use super::*;

	#[derive(Default)]
	struct Recorder {
		events: Mutex<Vec<TreeEvent>>,
	}

	impl TreeListener for Recorder {
		fn on_tree_event(&self, event: TreeEvent) {
			self.events.lock().push(event);
		}
	}

	#[test]
	fn stale_handles_stop_resolving_after_slot_reuse() {
		let tree = Tree::new();
		let a = tree.insert_root("a");
		tree.remove(a).unwrap();
		let b = tree.insert_root("b");

		assert_eq!(a.index(), b.index());
		assert_ne!(a, b);
		assert_eq!(tree.data(a), None);
		assert_eq!(tree.data(b), Some("b"));
		assert_eq!(tree.set(a, "x"), Err(TreeError::StaleNode(a)));
	}

	#[test]
	fn remove_detaches_whole_subtree() {
		let tree = Tree::new();
		let root = tree.insert_root(0);
		let child = tree.append(root, 1).unwrap();
		let grandchild = tree.append(child, 2).unwrap();
		let sibling = tree.append(root, 3).unwrap();

		let rec = Arc::new(Recorder::default());
		let weak: Weak<dyn TreeListener> = Arc::downgrade(&rec) as Weak<dyn TreeListener>;
		tree.subscribe(weak);

		assert_eq!(tree.remove(child).unwrap(), 2);
		assert_eq!(tree.children(root), vec![sibling]);
		assert!(!tree.contains(grandchild));

		let events = rec.events.lock().clone();
		assert_eq!(events.len(), 3);
		assert!(events.contains(&TreeEvent::Detached(child)));
		assert!(events.contains(&TreeEvent::Detached(grandchild)));
		assert_eq!(events.last(), Some(&TreeEvent::Modified));
	}

	#[test]
	fn dead_listeners_are_pruned() {
		let tree = Tree::new();
		let rec = Arc::new(Recorder::default());
		let weak: Weak<dyn TreeListener> = Arc::downgrade(&rec) as Weak<dyn TreeListener>;
		tree.subscribe(weak);
		assert_eq!(tree.listeners.len(), 1);

		drop(rec);
		tree.insert_root(());
		assert_eq!(tree.listeners.len(), 0);
	}

	#[test]
	fn unsubscribe_stops_delivery() {
		let tree = Tree::new();
		let rec = Arc::new(Recorder::default());
		let weak: Weak<dyn TreeListener> = Arc::downgrade(&rec) as Weak<dyn TreeListener>;
		let sub = tree.subscribe(weak);

		let n = tree.insert_root(1);
		assert!(tree.unsubscribe(sub));
		assert!(!tree.unsubscribe(sub));
		tree.update(n, |v| *v += 1).unwrap();

		assert_eq!(*rec.events.lock(), vec![TreeEvent::Modified]);
		assert_eq!(tree.data(n), Some(2));
	}
}
