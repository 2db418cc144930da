// ============================================================================
// Epoch Sampling
// ============================================================================
//
// Several independently published roots (map roots, the undo log root, the
// committing-transactions set) are each swapped atomically, but never
// together. A reader that needs a mutually consistent view samples all of
// them, samples again, and accepts the second sample only when it is
// identical to the first. Every publication allocates a fresh `Arc` and the
// first sample keeps the old one alive, so pointer identity cannot be fooled
// by address reuse: if both samples agree, every root held its sampled value
// at the instant the first sample finished.
//
// ============================================================================

use crate::core::Result;

/// A group of sampled roots that can tell whether another sample saw the same epoch
pub trait Epoch {
    fn same_epoch(&self, other: &Self) -> bool;
}

/// Sample until two consecutive samples agree and return the agreed one
pub fn stable_sample<T, F>(mut sample: F) -> Result<T>
where
    T: Epoch,
    F: FnMut() -> Result<T>,
{
    let mut previous = sample()?;
    loop {
        let current = sample()?;
        if previous.same_epoch(&current) {
            return Ok(current);
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Pair(Arc<u32>, Arc<u32>);

    impl Epoch for Pair {
        fn same_epoch(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.0, &other.0) && Arc::ptr_eq(&self.1, &other.1)
        }
    }

    #[test]
    fn test_stable_sample_retries_until_unchanged() {
        let left = Arc::new(1);
        let stable = Arc::new(2);
        let mut calls = 0;
        let mut churn = vec![Arc::new(10), Arc::new(11)];

        let sampled = stable_sample(|| {
            calls += 1;
            // the second root changes twice before settling
            let right = churn.pop().unwrap_or_else(|| Arc::clone(&stable));
            Ok(Pair(Arc::clone(&left), right))
        })
        .unwrap();

        assert_eq!(*sampled.1, 2);
        assert_eq!(calls, 4);
    }
}
