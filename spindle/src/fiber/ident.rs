//! Process-wide fiber identity and live count, for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE: AtomicU64 = AtomicU64::new(0);

/// Counts a new fiber and hands out its id.
pub(crate) fn register() -> u64 {
    LIVE.fetch_add(1, Ordering::Relaxed);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn unregister() {
    LIVE.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn live() -> u64 {
    LIVE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let ids: Vec<u64> = (0..100).map(|_| register()).collect();
        for _ in &ids {
            unregister();
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let ids: Vec<u64> = (0..250).map(|_| register()).collect();
                    (0..250).for_each(|_| unregister());
                    ids
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
    }
}
