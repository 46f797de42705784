use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-name operation locks.
///
/// An entry exists only while some task holds or waits for the name.
#[derive(Default)]
pub struct NameLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    /// Lock every name in `names`, in sorted order so that two operations
    /// touching overlapping sets of names cannot deadlock.
    pub async fn lock(&self, names: &[&str]) -> NameGuard {
        let mut sorted: Vec<&str> = names.iter().copied().filter(|n| !n.is_empty()).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for name in sorted {
            let lock = self.locks.entry(name.to_string()).or_default().clone();
            held.push((name.to_string(), lock.lock_owned().await));
        }
        NameGuard {
            locks: self.locks.clone(),
            held,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct NameGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    held: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        for (name, guard) in self.held.drain(..).rev() {
            drop(guard);
            self.locks
                .remove_if(&name, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_name_serializes() {
        let locks = Arc::new(NameLocks::default());
        let guard = locks.lock(&["pvc-a"]).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&["pvc-a", "snapshot-b"]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty(), "entries are dropped with the last holder");
    }

    #[tokio::test]
    async fn test_lock_order_is_sorted_and_deduplicated() {
        let locks = NameLocks::default();
        let guard = locks.lock(&["snapshot-b", "pvc-a", "snapshot-b", ""]).await;
        let names: Vec<&str> = guard.held.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["pvc-a", "snapshot-b"]);
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_disjoint_names_do_not_block() {
        let locks = NameLocks::default();
        let _a = locks.lock(&["pvc-a"]).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&["pvc-b"])).await;
        assert!(b.is_ok());
    }
}
