//! # Residency Container
//!
//! Ordered, deduplicated set of allocations a command list or queue needs
//! resident when its commands execute.

use alloc::vec::Vec;

use hashbrown::HashSet;

use ember_core::AllocationId;

/// Allocations referenced by recorded commands
#[derive(Debug, Clone, Default)]
pub struct ResidencyContainer {
    order: Vec<AllocationId>,
    seen: HashSet<AllocationId>,
}

impl ResidencyContainer {
    /// Empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allocation; duplicates and null handles are ignored
    pub fn push(&mut self, id: AllocationId) -> bool {
        if id.is_null() || !self.seen.insert(id) {
            return false;
        }
        self.order.push(id);
        true
    }

    /// Add several allocations
    pub fn extend<I: IntoIterator<Item = AllocationId>>(&mut self, ids: I) {
        for id in ids {
            self.push(id);
        }
    }

    /// Whether an allocation is present
    pub fn contains(&self, id: AllocationId) -> bool {
        self.seen.contains(&id)
    }

    /// Allocations in insertion order
    pub fn as_slice(&self) -> &[AllocationId] {
        &self.order
    }

    /// Number of allocations
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the container is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_deduplicates() {
        let mut residency = ResidencyContainer::new();
        assert!(residency.push(AllocationId::new(3)));
        assert!(!residency.push(AllocationId::new(3)));
        assert!(!residency.push(AllocationId::null()));
        residency.extend([AllocationId::new(1), AllocationId::new(3)]);
        assert_eq!(residency.as_slice(), &[AllocationId::new(3), AllocationId::new(1)]);
    }

    #[test]
    fn test_clear() {
        let mut residency = ResidencyContainer::new();
        residency.push(AllocationId::new(9));
        residency.clear();
        assert!(residency.is_empty());
        assert!(!residency.contains(AllocationId::new(9)));
        assert!(residency.push(AllocationId::new(9)));
    }
}
