//! Mutable source tree backing the semantic cache.
//!
//! Nodes live in a generational arena and are addressed by [`NodeId`]. A removed
//! node's handle is never reissued: the slot index may be reused, but the
//! generation moves on, so stale handles simply stop resolving.
//!
//! Consumers observe changes through [`TreeListener`]s:
//!
//! - [`TreeEvent::Modified`] after any structural or payload change,
//! - [`TreeEvent::Detached`] once per node removed from the tree.
//!
//! Listeners are held weakly. Subscribing does not keep the subscriber alive,
//! and dead listeners are pruned on the next dispatch.

mod arena;
mod events;

pub use arena::{NodeId, Tree, TreeError};
pub use events::{Subscription, TreeEvent, TreeListener};
