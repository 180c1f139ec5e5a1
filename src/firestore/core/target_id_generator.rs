use crate::firestore::model::TargetId;

/// Hands out target ids from one of two disjoint sequences.
///
/// Query targets persisted in the target cache get even ids; limbo
/// resolution targets owned by the sync engine get odd ids.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even sequence continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self { last_id: 0 };
        generator.seek(highest_target_id);
        generator
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }

    /// Moves the sequence so the next id is greater than `target_id`.
    pub fn seek(&mut self, target_id: TargetId) {
        let parity = self.last_id.rem_euclid(2);
        self.last_id = if target_id.rem_euclid(2) == parity {
            target_id
        } else {
            target_id - 1
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_ids_are_even_from_two() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);
        assert_eq!(generator.next(), 6);
    }

    #[test]
    fn sync_engine_ids_are_odd_from_one() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 3);
    }

    #[test]
    fn seeks_past_persisted_ids() {
        let mut generator = TargetIdGenerator::for_target_cache(10);
        assert_eq!(generator.next(), 12);
        let mut generator = TargetIdGenerator::for_target_cache(11);
        assert_eq!(generator.next(), 12);

        let mut limbo = TargetIdGenerator::for_sync_engine();
        limbo.seek(4);
        assert_eq!(limbo.next(), 5);
        limbo.seek(5);
        assert_eq!(limbo.next(), 7);
    }
}
