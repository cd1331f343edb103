use rand_core::{OsRng, RngCore};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The caller identity presented to the backend for one attempt. Never
/// reused: the conversation id doubles as the backend's idempotency key.
#[derive(Debug, Clone)]
pub struct Identity {
    pub caller_id: String,
    pub conversation_id: String,
}

pub struct IdentityRotator {
    pool: Vec<String>,
    fallback: String,
    cursor: AtomicUsize,
}

impl IdentityRotator {
    pub fn new(pool: Vec<String>, fallback: String) -> Self {
        // Randomized starting offset so restarts don't always hammer the
        // same pool entry first.
        let start = if pool.is_empty() {
            0
        } else {
            OsRng.next_u32() as usize % pool.len()
        };
        Self {
            pool,
            fallback,
            cursor: AtomicUsize::new(start),
        }
    }

    pub fn next(&self) -> Identity {
        let caller_id = if self.pool.is_empty() {
            self.fallback.clone()
        } else {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pool.len();
            self.pool[index].clone()
        };
        Identity {
            caller_id,
            conversation_id: format!("conv-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rotates_round_robin_over_the_pool() {
        let rotator = IdentityRotator::new(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            "fallback".to_string(),
        );
        let callers: Vec<String> = (0..6).map(|_| rotator.next().caller_id).collect();
        let first_cycle: HashSet<&String> = callers[..3].iter().collect();
        assert_eq!(first_cycle.len(), 3);
        assert_eq!(callers[..3], callers[3..]);
    }

    #[test]
    fn empty_pool_uses_fallback() {
        let rotator = IdentityRotator::new(Vec::new(), "solo".to_string());
        assert_eq!(rotator.next().caller_id, "solo");
        assert_eq!(rotator.next().caller_id, "solo");
    }

    #[test]
    fn conversation_ids_are_unique_per_attempt() {
        let rotator = IdentityRotator::new(vec!["a".to_string()], "f".to_string());
        let ids: HashSet<String> = (0..64).map(|_| rotator.next().conversation_id).collect();
        assert_eq!(ids.len(), 64);
    }
}
