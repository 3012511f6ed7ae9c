/// Hands out target ids from one of two disjoint sequences.
///
/// The local store uses even ids for query targets and the sync engine uses odd ids for
/// limbo resolution targets, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: i32,
}

const GENERATOR_ID_SHIFT: i32 = 1;

impl TargetIdGenerator {
    /// Even ids, continuing after `after` (the highest id already in the target cache).
    pub fn for_target_cache(after: i32) -> Self {
        Self::seeded(0, after)
    }

    /// Odd ids, starting at 1.
    pub fn for_sync_engine() -> Self {
        Self::seeded(1, 0)
    }

    fn seeded(generator_id: i32, after: i32) -> Self {
        let mut generator = Self {
            next_id: generator_id,
        };
        while generator.next_id <= after {
            generator.next_id += 1 << GENERATOR_ID_SHIFT;
        }
        // Ids are always positive.
        if generator.next_id == 0 {
            generator.next_id += 1 << GENERATOR_ID_SHIFT;
        }
        generator
    }

    pub fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1 << GENERATOR_ID_SHIFT;
        id
    }
}
