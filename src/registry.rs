use crate::pattern::Pattern;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// The process-wide set of active patterns. Readers take a cheap snapshot
/// (an `Arc` clone) and never block behind a writer mid-update; the consumer
/// samples one snapshot per block so a whole block is folded against a single
/// consistent set.
#[derive(Clone)]
pub struct PatternRegistry {
    patterns: Arc<RwLock<Arc<BTreeSet<Pattern>>>>,
}

impl PatternRegistry {
    pub fn new<I: IntoIterator<Item = Pattern>>(patterns: I) -> Self {
        PatternRegistry { patterns: Arc::new(RwLock::new(Arc::new(patterns.into_iter().collect()))) }
    }

    pub fn snapshot(&self) -> Arc<BTreeSet<Pattern>> {
        Arc::clone(&self.patterns.read().expect("registry poisoned"))
    }

    pub fn insert(&self, pattern: Pattern) {
        let mut guard = self.patterns.write().expect("registry poisoned");
        let mut next = (**guard).clone();
        next.insert(pattern);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, pattern: &Pattern) -> bool {
        let mut guard = self.patterns.write().expect("registry poisoned");
        if !guard.contains(pattern) {
            return false;
        }
        let mut next = (**guard).clone();
        next.remove(pattern);
        *guard = Arc::new(next);
        true
    }

    pub fn contains(&self, pattern: &Pattern) -> bool {
        self.snapshot().contains(pattern)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credential, PolicyId};

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let registry = PatternRegistry::new([Pattern::Any]);
        let before = registry.snapshot();
        registry.insert(Pattern::Policy(PolicyId([1; 28])));
        assert_eq!(before.len(), 1, "an old snapshot must not see the new pattern");
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn remove_reports_membership() {
        let registry = PatternRegistry::new([Pattern::PaymentCredential(Credential([2; 28]))]);
        assert!(registry.remove(&Pattern::PaymentCredential(Credential([2; 28]))));
        assert!(!registry.remove(&Pattern::PaymentCredential(Credential([2; 28]))));
        assert!(registry.is_empty());
    }
}
