//! Run-scoped identifier allocation.
//!
//! One allocator is created per run and passed down to every stage; nothing
//! is persisted until the run finishes, so an aborted run leaves no trace of
//! the identifiers it issued.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::domain::Tier;

/// Default hard cap on identifiers per tier
pub const DEFAULT_TIER_CAP: usize = 99_999;

/// Allocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("Identifier namespace '{prefix}' exhausted after {cap} identifiers")]
    NamespaceExhausted { prefix: &'static str, cap: usize },
}

/// Issues `uc_001`, `pol_001`, ... in allocation order
#[derive(Debug, Clone)]
pub struct IdAllocator {
    cap: usize,
    next: BTreeMap<Tier, usize>,
    issued: BTreeMap<Tier, BTreeSet<String>>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_TIER_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            next: BTreeMap::new(),
            issued: BTreeMap::new(),
        }
    }

    /// Allocate the next identifier of `tier`
    pub fn allocate(&mut self, tier: Tier) -> Result<String, AllocError> {
        let next = self.next.entry(tier).or_insert(1);
        if *next > self.cap {
            return Err(AllocError::NamespaceExhausted {
                prefix: tier.prefix(),
                cap: self.cap,
            });
        }

        let id = format!("{}{:03}", tier.prefix(), next);
        *next += 1;
        self.issued.entry(tier).or_default().insert(id.clone());
        Ok(id)
    }

    /// Number of identifiers issued for `tier`
    pub fn issued_count(&self, tier: Tier) -> usize {
        self.issued.get(&tier).map(|s| s.len()).unwrap_or(0)
    }

    /// Whether `id` was issued by this allocator
    pub fn is_issued(&self, id: &str) -> bool {
        Tier::of_id(id)
            .and_then(|tier| self.issued.get(&tier))
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }
}

/// Identifiers that occur more than once, sorted and listed once each
///
/// Re-validation scans existing identifiers instead of allocating new ones.
pub fn find_duplicates<'a, I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();

    for id in ids {
        if !seen.insert(id) {
            duplicates.insert(id.to_string());
        }
    }

    duplicates.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_sequential_per_tier() {
        let mut alloc = IdAllocator::new();

        assert_eq!(alloc.allocate(Tier::UseCase).unwrap(), "uc_001");
        assert_eq!(alloc.allocate(Tier::UseCase).unwrap(), "uc_002");
        assert_eq!(alloc.allocate(Tier::Policy).unwrap(), "pol_001");
        assert_eq!(alloc.allocate(Tier::TestCase).unwrap(), "tc_001");
        assert_eq!(alloc.allocate(Tier::Example).unwrap(), "ex_001");

        assert_eq!(alloc.issued_count(Tier::UseCase), 2);
        assert!(alloc.is_issued("uc_002"));
        assert!(!alloc.is_issued("uc_003"));
        assert!(!alloc.is_issued("bogus"));
    }

    #[test]
    fn test_suffix_widens_past_three_digits() {
        let mut alloc = IdAllocator::new();
        let mut last = String::new();
        for _ in 0..1000 {
            last = alloc.allocate(Tier::Example).unwrap();
        }
        assert_eq!(last, "ex_1000");
    }

    #[test]
    fn test_namespace_exhausted_under_cap() {
        let mut alloc = IdAllocator::with_cap(2);
        alloc.allocate(Tier::Policy).unwrap();
        alloc.allocate(Tier::Policy).unwrap();

        let err = alloc.allocate(Tier::Policy).unwrap_err();
        assert_eq!(
            err,
            AllocError::NamespaceExhausted {
                prefix: "pol_",
                cap: 2
            }
        );

        // other tiers are unaffected
        assert!(alloc.allocate(Tier::UseCase).is_ok());
    }

    #[test]
    fn test_separate_allocators_do_not_interfere() {
        let mut a = IdAllocator::new();
        let mut b = IdAllocator::new();
        assert_eq!(a.allocate(Tier::UseCase).unwrap(), "uc_001");
        assert_eq!(b.allocate(Tier::UseCase).unwrap(), "uc_001");
    }

    #[test]
    fn test_find_duplicates() {
        let ids = ["uc_001", "uc_002", "uc_001", "uc_003", "uc_001", "uc_002"];
        assert_eq!(find_duplicates(ids), vec!["uc_001", "uc_002"]);
        assert!(find_duplicates(["a", "b"]).is_empty());
    }
}
