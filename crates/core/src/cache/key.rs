use std::fmt;
use std::hash::{Hash, Hasher};

use itertools::Itertools;

use crate::value::Value;

const DEFAULT_HASH: i64 = 17;
const MULTIPLIER: i64 = 37;

/// An ordered accumulator of components. Each component's own hash is
/// multiplied by its 1-based position before folding, so permutations of
/// the same multiset produce different keys.
#[derive(Debug, Clone)]
pub struct CacheKey {
    hash: i64,
    checksum: i64,
    count: usize,
    components: Vec<Value>,
    null_key: bool,
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKey {
    pub fn new() -> Self {
        Self {
            hash: DEFAULT_HASH,
            checksum: 0,
            count: 0,
            components: Vec::new(),
            null_key: false,
        }
    }

    /// The distinguished sentinel key. It refuses updates.
    pub fn null_key() -> Self {
        Self {
            null_key: true,
            ..Self::new()
        }
    }

    pub fn is_null_key(&self) -> bool {
        self.null_key
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, component: Value) {
        assert!(!self.null_key, "the null cache key cannot be updated");
        let base = component.hash_code();
        self.count += 1;
        self.checksum = self.checksum.wrapping_add(base);
        let positioned = base.wrapping_mul(self.count as i64);
        self.hash = self.hash.wrapping_mul(MULTIPLIER).wrapping_add(positioned);
        self.components.push(component);
    }

    pub fn update_all(&mut self, components: impl IntoIterator<Item = Value>) {
        for component in components {
            self.update(component);
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.checksum == other.checksum
            && self.count == other.count
            && self.components == other.components
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i64(self.hash);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.hash,
            self.checksum,
            self.components
                .iter()
                .map(|c| c.to_string())
                .join("|")
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn equal_update_sequences_produce_equal_keys() {
        let mut k1 = CacheKey::new();
        k1.update(Value::Str("select * from t where id=?".into()));
        k1.update(Value::Int(42));
        let mut k2 = CacheKey::new();
        k2.update(Value::Str("select * from t where id=?".into()));
        k2.update(Value::Int(42));
        assert_eq!(k1, k2);
    }

    #[test]
    fn permuted_components_produce_distinct_keys() {
        let mut k1 = CacheKey::new();
        k1.update(Value::Str("select * from t where id=?".into()));
        k1.update(Value::Int(42));
        let mut k3 = CacheKey::new();
        k3.update(Value::Int(42));
        k3.update(Value::Str("select * from t where id=?".into()));
        assert_ne!(k1, k3);
    }

    #[test]
    fn clone_is_equal_but_independent() {
        let mut original = CacheKey::new();
        original.update(Value::Int(1));
        let mut cloned = original.clone();
        assert_eq!(original, cloned);
        cloned.update(Value::Int(2));
        assert_ne!(original, cloned);
        assert_eq!(original.count(), 1);
    }

    #[test]
    fn list_components_compare_structurally() {
        let mut k1 = CacheKey::new();
        k1.update(Value::List(vec![Value::Int(1), Value::Int(2)]));
        let mut k2 = CacheKey::new();
        k2.update(Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(k1, k2);
    }

    #[test]
    #[should_panic(expected = "null cache key")]
    fn null_key_refuses_updates() {
        let mut key = CacheKey::null_key();
        key.update(Value::Int(1));
    }
}
