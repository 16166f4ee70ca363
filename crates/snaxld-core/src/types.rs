//! Signature interning for the type section.
//!
//! The [`SignatureRegistry`] deduplicates function signatures and assigns
//! each unique one a dense 0-based index. Insertion order is the order the
//! type section lists signatures in, so it is observable in the output.

use std::collections::HashMap;

use crate::format::Signature;

#[derive(Debug, Default)]
pub struct SignatureRegistry {
    indices: HashMap<Signature, u32>,
    list: Vec<Signature>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a signature, returning its index.
    ///
    /// If the signature was already registered, returns the existing index.
    pub fn register(&mut self, sig: &Signature) -> u32 {
        if let Some(&idx) = self.indices.get(sig) {
            return idx;
        }
        let idx = self.list.len() as u32;
        self.indices.insert(sig.clone(), idx);
        self.list.push(sig.clone());
        idx
    }

    /// Look up a previously registered signature.
    ///
    /// Returns `None` when the signature was never registered; callers
    /// treat that as an internal invariant violation.
    pub fn lookup(&self, sig: &Signature) -> Option<u32> {
        self.indices.get(sig).copied()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Signatures in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ValueType;

    #[test]
    fn test_register_dedups() {
        let mut reg = SignatureRegistry::new();
        let void = Signature::new(vec![], None);
        let unary = Signature::new(vec![ValueType::I32], None);

        assert_eq!(reg.register(&void), 0);
        assert_eq!(reg.register(&unary), 1);
        assert_eq!(reg.register(&void), 0);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_lookup() {
        let mut reg = SignatureRegistry::new();
        let sig = Signature::new(vec![ValueType::I64], Some(ValueType::I32));
        assert_eq!(reg.lookup(&sig), None);
        reg.register(&sig);
        assert_eq!(reg.lookup(&sig), Some(0));
    }

    #[test]
    fn test_insertion_order_is_observable() {
        let mut reg = SignatureRegistry::new();
        let a = Signature::new(vec![ValueType::F64], None);
        let b = Signature::new(vec![], Some(ValueType::F32));
        reg.register(&a);
        reg.register(&b);
        let listed: Vec<_> = reg.iter().cloned().collect();
        assert_eq!(listed, vec![a, b]);
    }
}
