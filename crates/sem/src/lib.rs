//! Semantic element cache.
//!
//! Lazily computes, caches and invalidates derived objects ("semantic
//! elements") attached to nodes of a [`sema_tree::Tree`].
//!
//! # Components
//!
//! - [`key`]: semantic keys and their "is-a" hierarchy
//! - [`producer`]: producer declarations and the lazily built registry
//! - [`recursion`]: per-thread reentrancy tracking gating cacheability
//! - [`store`]: concurrent node → chunk storage with atomic full clears
//! - [`batch`]: atomic-change scopes deferring invalidation
//! - [`SemService`]: the orchestrator tying them together
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use sema_sem::{KeyGraph, ProducerDecl, ProducerSet, SemElement, SemService};
//! use sema_tree::Tree;
//!
//! let tree = Arc::new(Tree::new());
//! let lit = tree.insert_root("literal");
//!
//! let mut graph = KeyGraph::new();
//! graph.key("Expr", &[]);
//! let keys = Arc::new(graph.build().unwrap());
//!
//! let t = tree.clone();
//! let producers = ProducerSet::new().with(
//! 	ProducerDecl::new("literal", "Expr", |_, _| Ok(Some(SemElement::new("lit"))))
//! 		.when(move |n| t.data(n) == Some("literal")),
//! );
//!
//! let sem = SemService::with_producers(keys.clone(), producers);
//! sem.attach(&tree);
//!
//! let expr = keys.key("Expr").unwrap();
//! let answer = sem.query(expr, lit).unwrap();
//! assert_eq!(answer.elements()[0].downcast_ref::<&str>(), Some(&"lit"));
//! ```

pub mod batch;
mod config;
mod element;
pub mod error;
pub mod key;
mod memory;
pub mod producer;
pub mod recursion;
mod service;
mod stats;
pub mod store;

pub use batch::BatchController;
pub use config::SemConfig;
pub use element::SemElement;
pub use error::{Cancelled, ConfigError, ProducerError, ProducerFailure, Result, SemError};
pub use key::{KeyGraph, KeyHierarchy, SemKey};
pub use memory::{LowMemoryListener, LowMemoryNotifier};
pub use producer::{Producer, ProducerDecl, ProducerRegistry, ProducerSet, ProducerSource};
pub use recursion::{StackStamp, mark_stack};
pub use service::{Answer, QueryCx, SemService};
pub use stats::SemStats;
pub use store::{CacheStore, Chunk};
pub use tokio_util::sync::CancellationToken;
