//! String cache
//!
//! Every string live in the VM is interned here. Equal strings share one
//! entry; the count tracks how many live `Value` cells hold the handle.
//! `insert` of an equal string bumps the count, `remove` decrements and
//! evicts at zero. Handles are cheap `Rc<str>` clones, so equality checks
//! can take the pointer-identity fast path before falling back to content.
//!
//! After a legal program finishes, the cache is empty: every `insert` has
//! been matched by a `remove` through the VM's ownership discipline.

use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to an interned string.
pub type CachedString = Rc<str>;

#[derive(Debug, Default)]
pub struct StringCache {
    strings: HashMap<Rc<str>, usize>,
}

impl StringCache {
    pub fn new() -> Self {
        StringCache::default()
    }

    /// Intern `text`, bumping its live count, and return the shared handle.
    pub fn insert(&mut self, text: &str) -> CachedString {
        if let Some((key, _)) = self.strings.get_key_value(text) {
            let handle = Rc::clone(key);
            if let Some(count) = self.strings.get_mut(text) {
                *count += 1;
            }
            handle
        } else {
            let handle: Rc<str> = Rc::from(text);
            self.strings.insert(Rc::clone(&handle), 1);
            handle
        }
    }

    /// Drop one live count for `text`, evicting the entry at zero.
    ///
    /// Removing a string that is not cached is a no-op, matching the
    /// lookup-then-decrement behavior the VM relies on during teardown.
    pub fn remove(&mut self, text: &str) {
        if let Some(count) = self.strings.get_mut(text) {
            *count -= 1;
            if *count == 0 {
                self.strings.remove(text);
            }
        }
    }

    /// Intern the concatenation of two cached strings.
    ///
    /// Neither operand is consumed; the caller releases them separately.
    pub fn concat(&mut self, first: &str, second: &str) -> CachedString {
        let mut joined = String::with_capacity(first.len() + second.len());
        joined.push_str(first);
        joined.push_str(second);
        self.insert(&joined)
    }

    /// Number of distinct interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Live count for a string, zero if not interned.
    pub fn live_count(&self, text: &str) -> usize {
        self.strings.get(text).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_shares_one_entry() {
        let mut cache = StringCache::new();
        let a = cache.insert("hello");
        let b = cache.insert("hello");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.live_count("hello"), 2);
    }

    #[test]
    fn test_remove_evicts_at_zero() {
        let mut cache = StringCache::new();
        cache.insert("x");
        cache.insert("x");
        cache.remove("x");
        assert_eq!(cache.live_count("x"), 1);
        cache.remove("x");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut cache = StringCache::new();
        cache.remove("missing");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concat_does_not_consume_operands() {
        let mut cache = StringCache::new();
        let a = cache.insert("foo");
        let b = cache.insert("bar");
        let joined = cache.concat(&a, &b);
        assert_eq!(&*joined, "foobar");
        assert_eq!(cache.live_count("foo"), 1);
        assert_eq!(cache.live_count("bar"), 1);
        assert_eq!(cache.live_count("foobar"), 1);
        assert_eq!(cache.len(), 3);
    }
}
