use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque value produced for a (key, node) pair.
///
/// Cheap to clone. Two elements are equal only when they share the same
/// allocation; the cache never looks inside.
#[derive(Clone)]
pub struct SemElement {
	value: Arc<dyn Any + Send + Sync>,
	type_name: &'static str,
}

impl SemElement {
	pub fn new<T: Any + Send + Sync>(value: T) -> Self {
		Self {
			value: Arc::new(value),
			type_name: std::any::type_name::<T>(),
		}
	}

	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.value.downcast_ref()
	}

	pub fn is<T: Any>(&self) -> bool {
		self.value.is::<T>()
	}

	/// Returns true if both handles point at the same element.
	#[inline]
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.value, &other.value)
	}

	fn addr(&self) -> usize {
		Arc::as_ptr(&self.value) as *const () as usize
	}
}

impl PartialEq for SemElement {
	fn eq(&self, other: &Self) -> bool {
		self.ptr_eq(other)
	}
}

impl Eq for SemElement {}

impl std::hash::Hash for SemElement {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.addr().hash(state);
	}
}

impl fmt::Debug for SemElement {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SemElement<{}>@{:#x}", self.type_name, self.addr())
	}
}

/// Appends `src` to `dst`, skipping elements already present by identity.
pub(crate) fn extend_unique(
	dst: &mut Vec<SemElement>,
	seen: &mut rustc_hash::FxHashSet<usize>,
	src: &[SemElement],
) {
	for e in src {
		if seen.insert(e.addr()) {
			dst.push(e.clone());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identity_equality() {
		let a = SemElement::new("lit");
		let b = SemElement::new("lit");
		assert_eq!(a, a.clone());
		assert_ne!(a, b);
		assert_eq!(a.downcast_ref::<&str>(), Some(&"lit"));
		assert!(!a.is::<String>());
	}

	#[test]
	fn extend_unique_keeps_first_occurrence_order() {
		let a = SemElement::new(1u8);
		let b = SemElement::new(2u8);
		let mut out = Vec::new();
		let mut seen = rustc_hash::FxHashSet::default();
		extend_unique(&mut out, &mut seen, &[a.clone(), b.clone()]);
		extend_unique(&mut out, &mut seen, &[b.clone(), a.clone()]);
		assert_eq!(out, vec![a, b]);
	}
}
