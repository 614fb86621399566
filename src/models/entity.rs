//! Entity contract used by the list and single-object caches.

use std::fmt::Debug;
use std::hash::Hash;

// == Entity ==
/// A mapped row the caches can hold.
///
/// The caches only need two things from an entity: a stable identity key,
/// used to replace list elements and address single-object slots, and
/// whether it carries unsaved changes, used to decide what to flush.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Identity (primary key) type
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Returns the identity key of this entity.
    fn key(&self) -> Self::Key;

    /// Returns true if the entity has changes not yet written to the store.
    fn is_dirty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Customer {
        id: u32,
    }

    impl Entity for Customer {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn test_entity_is_clean_by_default() {
        let customer = Customer { id: 7 };
        assert_eq!(customer.key(), 7);
        assert!(!customer.is_dirty());
    }
}
