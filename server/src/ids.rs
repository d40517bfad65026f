use shared::{BlobId, BotId, CommandId, FoodId, SessionId, ToxinId};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdCategory {
    Bot,
    Blob,
    Food,
    Toxin,
    Session,
    Command,
}

/// Hands out ids that are unique and increasing within each category.
///
/// Shared between the tick loop and session tasks; allocation never blocks.
/// Counters are 64 bits wide so they never wrap back to the zero sentinel.
#[derive(Debug)]
pub struct IdAllocator {
    counters: [AtomicU64; 6],
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
        }
    }

    pub fn next(&self, category: IdCategory) -> u64 {
        self.counters[category as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    fn starting_at(category: IdCategory, last: u64) -> Self {
        let ids = Self::new();
        ids.counters[category as usize].store(last, Ordering::Relaxed);
        ids
    }

    pub fn next_bot(&self) -> BotId {
        self.next(IdCategory::Bot)
    }

    pub fn next_blob(&self) -> BlobId {
        self.next(IdCategory::Blob)
    }

    pub fn next_food(&self) -> FoodId {
        self.next(IdCategory::Food)
    }

    pub fn next_toxin(&self) -> ToxinId {
        self.next(IdCategory::Toxin)
    }

    pub fn next_session(&self) -> SessionId {
        self.next(IdCategory::Session)
    }

    pub fn next_command(&self) -> CommandId {
        self.next(IdCategory::Command)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_bot(), 1);
        assert_eq!(ids.next_bot(), 2);
        assert_eq!(ids.next_bot(), 3);
    }

    #[test]
    fn test_categories_are_independent() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_food(), 1);
        assert_eq!(ids.next_food(), 2);
        assert_eq!(ids.next_toxin(), 1);
        assert_eq!(ids.next_session(), 1);
        assert_eq!(ids.next_command(), 1);
        assert_eq!(ids.next_blob(), 1);
        assert_eq!(ids.next_food(), 3);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1000).map(|_| ids.next_blob()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(ids.next_blob(), 8001);
    }

    #[test]
    fn test_ids_past_u32_range_stay_unique() {
        let ids = IdAllocator::starting_at(IdCategory::Bot, u64::from(u32::MAX) - 1);
        let a = ids.next_bot();
        let b = ids.next_bot();
        let c = ids.next_bot();
        assert_eq!(a, u64::from(u32::MAX));
        assert_eq!(b, u64::from(u32::MAX) + 1);
        assert!(a != 0 && b != 0 && c > b);
    }
}
