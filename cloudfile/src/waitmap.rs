//! Per-key single-slot wait list (spec §9): both the bitmap page fetcher
//! and the cache's write-retrieval set need to let a second caller for
//! the same key suspend until the first caller's in-flight operation
//! completes, rather than duplicate the work (invariant I3).

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub enum Claim {
    /// You are the first caller for this key: do the work, then call
    /// [`WaitMap::finish`] with the same key to wake any followers.
    Leader,
    /// Someone else is already doing the work; await this and then
    /// re-check whatever cache you were querying.
    Follower(oneshot::Receiver<()>),
}

pub struct WaitMap<K> {
    inner: Mutex<HashMap<K, Vec<oneshot::Sender<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for WaitMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> WaitMap<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to become the sole worker for `key`.
    pub fn claim(&self, key: &K) -> Claim {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Claim::Follower(rx)
            }
            None => {
                inner.insert(key.clone(), Vec::new());
                Claim::Leader
            }
        }
    }

    /// Release the claim on `key`, waking every follower that queued up
    /// while the leader's work was in flight.
    pub fn finish(&self, key: &K) {
        let waiters = self.inner.lock().remove(key);
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    pub fn in_flight(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claimant_becomes_a_follower() {
        let wm: WaitMap<&'static str> = WaitMap::new();
        assert!(matches!(wm.claim(&"k"), Claim::Leader));
        let follow = wm.claim(&"k");
        let rx = match follow {
            Claim::Follower(rx) => rx,
            _ => panic!("expected follower"),
        };
        wm.finish(&"k");
        rx.await.unwrap();
    }
}
