//! Producer declarations and the lazily built per-key registry.
//!
//! A producer is a predicate-gated transform from a node to at most one
//! [`SemElement`], declared against a key name. Declarations come from a
//! [`ProducerSource`]; the usual source is an explicit [`ProducerSet`] built at
//! startup.
//!
//! The [`ProducerRegistry`] groups declarations by key on first use and
//! publishes the grouping through an [`ArcSwapOption`]. Concurrent first callers
//! may each build a grouping; the first one published wins and every caller
//! adopts it. [`ProducerRegistry::invalidate`] drops the published grouping so
//! the next lookup rebuilds from the source.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use sema_tree::NodeId;

use crate::element::SemElement;
use crate::error::{ConfigError, ProducerError};
use crate::key::{KeyHierarchy, SemKey};
use crate::service::QueryCx;

type Predicate = dyn Fn(NodeId) -> bool + Send + Sync;
type Transform =
	dyn Fn(&QueryCx<'_>, NodeId) -> Result<Option<SemElement>, ProducerError> + Send + Sync;

/// Unresolved producer declaration, targeting a key by name.
#[derive(Clone)]
pub struct ProducerDecl {
	name: &'static str,
	key: Box<str>,
	predicate: Option<Arc<Predicate>>,
	transform: Arc<Transform>,
}

impl ProducerDecl {
	/// Declares a producer applicable to every node.
	pub fn new<F>(name: &'static str, key: impl Into<Box<str>>, transform: F) -> Self
	where
		F: Fn(&QueryCx<'_>, NodeId) -> Result<Option<SemElement>, ProducerError>
			+ Send
			+ Sync
			+ 'static,
	{
		Self {
			name,
			key: key.into(),
			predicate: None,
			transform: Arc::new(transform),
		}
	}

	/// Restricts the producer to nodes accepted by `predicate`.
	pub fn when<P>(mut self, predicate: P) -> Self
	where
		P: Fn(NodeId) -> bool + Send + Sync + 'static,
	{
		self.predicate = Some(Arc::new(predicate));
		self
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn key_name(&self) -> &str {
		&self.key
	}
}

impl fmt::Debug for ProducerDecl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProducerDecl")
			.field("name", &self.name)
			.field("key", &self.key)
			.finish_non_exhaustive()
	}
}

/// Supplier of producer declarations.
///
/// Assumed static for the lifetime of one registry build.
pub trait ProducerSource: Send + Sync {
	fn declarations(&self) -> Vec<ProducerDecl>;
}

/// Explicit list of declarations passed at service construction.
#[derive(Debug, Default, Clone)]
pub struct ProducerSet {
	decls: Vec<ProducerDecl>,
}

impl ProducerSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, decl: ProducerDecl) -> &mut Self {
		self.decls.push(decl);
		self
	}

	pub fn with(mut self, decl: ProducerDecl) -> Self {
		self.decls.push(decl);
		self
	}

	pub fn len(&self) -> usize {
		self.decls.len()
	}

	pub fn is_empty(&self) -> bool {
		self.decls.is_empty()
	}
}

impl ProducerSource for ProducerSet {
	fn declarations(&self) -> Vec<ProducerDecl> {
		self.decls.clone()
	}
}

/// Producer resolved against a [`KeyHierarchy`].
#[derive(Clone)]
pub struct Producer {
	name: &'static str,
	key: SemKey,
	predicate: Option<Arc<Predicate>>,
	transform: Arc<Transform>,
}

impl Producer {
	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn key(&self) -> SemKey {
		self.key
	}

	/// Runs the transform if the predicate accepts `node`.
	pub fn apply(
		&self,
		cx: &QueryCx<'_>,
		node: NodeId,
	) -> Result<Option<SemElement>, ProducerError> {
		if let Some(pred) = &self.predicate {
			if !pred(node) {
				return Ok(None);
			}
		}
		(self.transform)(cx, node)
	}
}

impl fmt::Debug for Producer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Producer")
			.field("name", &self.name)
			.field("key", &self.key)
			.finish_non_exhaustive()
	}
}

/// Producers grouped by key index.
struct Grouping {
	by_key: Vec<Arc<[Producer]>>,
}

impl Grouping {
	fn build(keys: &KeyHierarchy, decls: Vec<ProducerDecl>) -> Result<Self, ConfigError> {
		let mut by_key: Vec<Vec<Producer>> = vec![Vec::new(); keys.len()];
		for decl in decls {
			let key = keys.key(&decl.key).ok_or_else(|| ConfigError::UnregisteredKey {
				producer: decl.name.to_owned(),
				key: decl.key.to_string(),
			})?;
			by_key[key.index()].push(Producer {
				name: decl.name,
				key,
				predicate: decl.predicate,
				transform: decl.transform,
			});
		}
		Ok(Self {
			by_key: by_key.into_iter().map(Arc::from).collect(),
		})
	}
}

/// Lazily built, process-wide producer lookup.
pub struct ProducerRegistry {
	source: Arc<dyn ProducerSource>,
	grouping: ArcSwapOption<Grouping>,
}

impl ProducerRegistry {
	pub fn new(source: Arc<dyn ProducerSource>) -> Self {
		Self {
			source,
			grouping: ArcSwapOption::empty(),
		}
	}

	/// Returns the producers registered for exactly `key`, in declaration order.
	///
	/// Builds the grouping on first use.
	pub fn producers_for(
		&self,
		keys: &KeyHierarchy,
		key: SemKey,
	) -> Result<Arc<[Producer]>, ConfigError> {
		let grouping = self.grouping(keys)?;
		Ok(grouping
			.by_key
			.get(key.index())
			.cloned()
			.unwrap_or_else(|| Arc::from(Vec::new())))
	}

	/// True once a grouping has been published.
	pub fn is_built(&self) -> bool {
		self.grouping.load().is_some()
	}

	/// Drops the published grouping; the next lookup rebuilds it.
	pub fn invalidate(&self) {
		self.grouping.store(None);
		tracing::debug!("sem.registry.invalidate");
	}

	fn grouping(&self, keys: &KeyHierarchy) -> Result<Arc<Grouping>, ConfigError> {
		if let Some(g) = self.grouping.load_full() {
			return Ok(g);
		}

		let decls = self.source.declarations();
		let count = decls.len();
		let built = Arc::new(Grouping::build(keys, decls)?);

		let none: Option<Arc<Grouping>> = None;
		let prev = self.grouping.compare_and_swap(&none, Some(built.clone()));
		match &*prev {
			None => {
				tracing::debug!(producers = count, keys = keys.len(), "sem.registry.build");
				Ok(built)
			}
			Some(winner) => Ok(winner.clone()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::key::KeyGraph;

	struct CountingSource {
		set: ProducerSet,
		builds: AtomicUsize,
	}

	impl ProducerSource for CountingSource {
		fn declarations(&self) -> Vec<ProducerDecl> {
			self.builds.fetch_add(1, Ordering::SeqCst);
			self.set.declarations()
		}
	}

	fn hierarchy() -> KeyHierarchy {
		let mut g = KeyGraph::new();
		g.key("Expr", &[]).key("Literal", &["Expr"]);
		g.build().unwrap()
	}

	fn constant(name: &'static str, key: &str) -> ProducerDecl {
		ProducerDecl::new(name, key, move |_, _| Ok(Some(SemElement::new(name))))
	}

	#[test]
	fn groups_by_key_in_declaration_order() {
		let keys = hierarchy();
		let source = Arc::new(CountingSource {
			set: ProducerSet::new()
				.with(constant("a", "Expr"))
				.with(constant("b", "Literal"))
				.with(constant("c", "Expr")),
			builds: AtomicUsize::new(0),
		});
		let reg = ProducerRegistry::new(source.clone());
		assert!(!reg.is_built());

		let expr = reg.producers_for(&keys, keys.key("Expr").unwrap()).unwrap();
		let names: Vec<_> = expr.iter().map(Producer::name).collect();
		assert_eq!(names, ["a", "c"]);

		let lit = reg.producers_for(&keys, keys.key("Literal").unwrap()).unwrap();
		assert_eq!(lit.len(), 1);
		assert_eq!(source.builds.load(Ordering::SeqCst), 1);

		reg.invalidate();
		reg.producers_for(&keys, keys.key("Literal").unwrap()).unwrap();
		assert_eq!(source.builds.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn unregistered_key_fails_build() {
		let keys = hierarchy();
		let reg = ProducerRegistry::new(Arc::new(ProducerSet::new().with(constant("x", "Stmt"))));
		let err = reg.producers_for(&keys, keys.key("Expr").unwrap()).unwrap_err();
		assert!(matches!(err, ConfigError::UnregisteredKey { key, .. } if key == "Stmt"));
		assert!(!reg.is_built());
	}

	#[test]
	fn concurrent_first_callers_agree() {
		let keys = Arc::new(hierarchy());
		let reg = Arc::new(ProducerRegistry::new(Arc::new(
			ProducerSet::new().with(constant("a", "Expr")),
		)));
		let expr = keys.key("Expr").unwrap();

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let (keys, reg) = (keys.clone(), reg.clone());
				std::thread::spawn(move || reg.producers_for(&keys, expr).unwrap())
			})
			.collect();
		let lists: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

		let published = reg.producers_for(&keys, expr).unwrap();
		for list in &lists {
			assert!(Arc::ptr_eq(list, &published));
		}
	}
}
