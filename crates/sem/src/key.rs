//! Semantic keys and their "is-a" hierarchy.
//!
//! Keys are declared by name through a [`KeyGraph`] and frozen into a
//! [`KeyHierarchy`]. The hierarchy answers [`KeyHierarchy::inheritors`]: the
//! key itself plus every declared key whose supertype chain reaches it. A query
//! for an abstract key aggregates results stored under all of its inheritors.
//!
//! # Invariants
//!
//! * The supertype relation is acyclic; [`KeyGraph::build`] rejects cycles.
//! * `inheritors(k)` starts with `k`, lists every key at most once, and is
//!   computed once per key for the lifetime of the hierarchy.

use std::fmt;
use std::sync::{Arc, OnceLock};

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::ConfigError;

/// Handle to a declared semantic key.
///
/// Only meaningful for the [`KeyHierarchy`] that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemKey(u32);

impl SemKey {
	pub(crate) const fn from_index(index: u32) -> Self {
		Self(index)
	}

	/// Returns the declaration ordinal.
	#[inline]
	pub const fn index(self) -> usize {
		self.0 as usize
	}
}

impl fmt::Display for SemKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SemKey({})", self.0)
	}
}

/// Declarations of semantic keys, in order.
#[derive(Debug, Default, Clone)]
pub struct KeyGraph {
	decls: Vec<(Box<str>, Vec<Box<str>>)>,
}

impl KeyGraph {
	pub fn new() -> Self {
		Self::default()
	}

	/// Declares `name` with its direct supertypes.
	///
	/// Supertypes may be declared before or after the key itself.
	pub fn key(&mut self, name: impl Into<Box<str>>, supertypes: &[&str]) -> &mut Self {
		self.decls
			.push((name.into(), supertypes.iter().map(|s| Box::from(*s)).collect()));
		self
	}

	/// Freezes the declarations.
	///
	/// # Errors
	///
	/// [`ConfigError::DuplicateKey`], [`ConfigError::UnknownSupertype`] or
	/// [`ConfigError::CyclicKey`].
	pub fn build(&self) -> Result<KeyHierarchy, ConfigError> {
		let mut by_name = FxHashMap::default();
		for (i, (name, _)) in self.decls.iter().enumerate() {
			if by_name.insert(name.clone(), SemKey(i as u32)).is_some() {
				return Err(ConfigError::DuplicateKey(name.to_string()));
			}
		}

		let mut keys: Vec<KeyInfo> = Vec::with_capacity(self.decls.len());
		for (name, supers) in &self.decls {
			let mut supertypes = SmallVec::new();
			for s in supers {
				let id = by_name.get(s).ok_or_else(|| ConfigError::UnknownSupertype {
					key: name.to_string(),
					supertype: s.to_string(),
				})?;
				if !supertypes.contains(id) {
					supertypes.push(*id);
				}
			}
			keys.push(KeyInfo {
				name: name.clone(),
				supertypes,
				subtypes: SmallVec::new(),
			});
		}

		if let Some(on_cycle) = find_cycle(&keys) {
			return Err(ConfigError::CyclicKey(keys[on_cycle.index()].name.to_string()));
		}

		for i in 0..keys.len() {
			let supers = keys[i].supertypes.clone();
			for s in supers {
				keys[s.index()].subtypes.push(SemKey(i as u32));
			}
		}

		let inheritors = (0..keys.len()).map(|_| OnceLock::new()).collect();
		Ok(KeyHierarchy {
			keys,
			by_name,
			inheritors,
		})
	}
}

struct KeyInfo {
	name: Box<str>,
	supertypes: SmallVec<[SemKey; 2]>,
	subtypes: SmallVec<[SemKey; 4]>,
}

/// Returns a key lying on a supertype cycle, if any.
fn find_cycle(keys: &[KeyInfo]) -> Option<SemKey> {
	#[derive(Clone, Copy, PartialEq, Eq)]
	enum Mark {
		Unvisited,
		OnPath,
		Done,
	}

	let mut marks = vec![Mark::Unvisited; keys.len()];
	for start in 0..keys.len() {
		if marks[start] != Mark::Unvisited {
			continue;
		}
		// (key, next supertype slot)
		let mut path: Vec<(usize, usize)> = vec![(start, 0)];
		marks[start] = Mark::OnPath;
		while let Some(top) = path.last_mut() {
			let (k, next) = *top;
			match keys[k].supertypes.get(next) {
				Some(&s) => {
					top.1 += 1;
					match marks[s.index()] {
						Mark::OnPath => return Some(s),
						Mark::Unvisited => {
							marks[s.index()] = Mark::OnPath;
							path.push((s.index(), 0));
						}
						Mark::Done => {}
					}
				}
				None => {
					marks[k] = Mark::Done;
					path.pop();
				}
			}
		}
	}
	None
}

/// Frozen, validated key hierarchy.
pub struct KeyHierarchy {
	keys: Vec<KeyInfo>,
	by_name: FxHashMap<Box<str>, SemKey>,
	inheritors: Box<[OnceLock<Arc<[SemKey]>>]>,
}

impl fmt::Debug for KeyHierarchy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.keys.iter().map(|k| &*k.name)).finish()
	}
}

impl KeyHierarchy {
	/// Looks a key up by name.
	pub fn key(&self, name: &str) -> Option<SemKey> {
		self.by_name.get(name).copied()
	}

	/// Returns the declared name of `key`.
	///
	/// # Panics
	///
	/// If `key` was issued by another hierarchy with more keys.
	pub fn name(&self, key: SemKey) -> &str {
		&self.keys[key.index()].name
	}

	pub fn supertypes(&self, key: SemKey) -> &[SemKey] {
		&self.keys[key.index()].supertypes
	}

	pub fn contains(&self, key: SemKey) -> bool {
		key.index() < self.keys.len()
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// All keys in declaration order.
	pub fn keys(&self) -> impl Iterator<Item = SemKey> + '_ {
		(0..self.keys.len() as u32).map(SemKey)
	}

	/// Returns `key` followed by all of its transitive subtypes.
	///
	/// Breadth-first over direct subtypes in declaration order. Computed on
	/// first request and shared afterwards.
	pub fn inheritors(&self, key: SemKey) -> Arc<[SemKey]> {
		self.inheritors[key.index()]
			.get_or_init(|| {
				let mut seen = FxHashSet::default();
				seen.insert(key);
				let mut out = vec![key];
				let mut cursor = 0;
				while cursor < out.len() {
					let k = out[cursor];
					cursor += 1;
					for &sub in &self.keys[k.index()].subtypes {
						if seen.insert(sub) {
							out.push(sub);
						}
					}
				}
				out.into()
			})
			.clone()
	}

	/// True if `sub` is `sup` or one of its transitive subtypes.
	pub fn is_a(&self, sub: SemKey, sup: SemKey) -> bool {
		self.inheritors(sup).contains(&sub)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn names(h: &KeyHierarchy, keys: &[SemKey]) -> Vec<String> {
		keys.iter().map(|k| h.name(*k).to_owned()).collect()
	}

	#[test]
	fn diamond_inheritors_listed_once() {
		let mut g = KeyGraph::new();
		g.key("Expr", &[])
			.key("Call", &["Expr"])
			.key("Named", &["Expr"])
			.key("MethodCall", &["Call", "Named"]);
		let h = g.build().unwrap();

		let expr = h.key("Expr").unwrap();
		assert_eq!(
			names(&h, &h.inheritors(expr)),
			["Expr", "Call", "Named", "MethodCall"]
		);
		let call = h.key("Call").unwrap();
		assert_eq!(names(&h, &h.inheritors(call)), ["Call", "MethodCall"]);
		assert!(h.is_a(h.key("MethodCall").unwrap(), expr));
		assert!(!h.is_a(expr, call));
	}

	#[test]
	fn supertypes_may_be_declared_later() {
		let mut g = KeyGraph::new();
		g.key("Literal", &["Expr"]).key("Expr", &[]);
		let h = g.build().unwrap();
		let expr = h.key("Expr").unwrap();
		assert_eq!(names(&h, &h.inheritors(expr)), ["Expr", "Literal"]);
	}

	#[test]
	fn rejects_cycles() {
		let mut g = KeyGraph::new();
		g.key("A", &["C"]).key("B", &["A"]).key("C", &["B"]);
		assert!(matches!(g.build(), Err(ConfigError::CyclicKey(_))));

		let mut g = KeyGraph::new();
		g.key("Selfish", &["Selfish"]);
		assert!(matches!(g.build(), Err(ConfigError::CyclicKey(name)) if name == "Selfish"));
	}

	#[test]
	fn rejects_unknown_and_duplicate_keys() {
		let mut g = KeyGraph::new();
		g.key("A", &["Missing"]);
		assert!(matches!(
			g.build(),
			Err(ConfigError::UnknownSupertype { supertype, .. }) if supertype == "Missing"
		));

		let mut g = KeyGraph::new();
		g.key("A", &[]).key("A", &[]);
		assert!(matches!(g.build(), Err(ConfigError::DuplicateKey(_))));
	}

	#[test]
	fn inheritors_are_memoized() {
		let mut g = KeyGraph::new();
		g.key("A", &[]).key("B", &["A"]);
		let h = g.build().unwrap();
		let a = h.key("A").unwrap();
		assert!(Arc::ptr_eq(&h.inheritors(a), &h.inheritors(a)));
	}

	/// Random DAGs where key `i` may only extend keys `< i`.
	fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
		(1usize..12).prop_flat_map(|n| {
			(0..n)
				.map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
				.collect::<Vec<_>>()
		})
	}

	proptest! {
		#[test]
		fn inheritors_match_transitive_closure(supers in dag()) {
			let names: Vec<String> = (0..supers.len()).map(|i| format!("k{i}")).collect();
			let mut g = KeyGraph::new();
			for (i, s) in supers.iter().enumerate() {
				let s: Vec<&str> = s.iter().map(|j| names[*j].as_str()).collect();
				g.key(names[i].as_str(), &s);
			}
			let h = g.build().unwrap();

			for target in 0..supers.len() {
				// Brute force: k inherits target if target is reachable upward from k.
				let mut expected: FxHashSet<usize> = FxHashSet::default();
				for k in 0..supers.len() {
					let mut stack = vec![k];
					let mut seen = FxHashSet::default();
					while let Some(x) = stack.pop() {
						if x == target {
							expected.insert(k);
							break;
						}
						if seen.insert(x) {
							stack.extend(supers[x].iter().copied());
						}
					}
				}

				let got = h.inheritors(SemKey(target as u32));
				prop_assert_eq!(got[0], SemKey(target as u32));
				let got_set: FxHashSet<usize> = got.iter().map(|k| k.index()).collect();
				prop_assert_eq!(got_set.len(), got.len());
				prop_assert_eq!(got_set, expected);
			}
		}
	}
}
