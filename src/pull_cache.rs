//! Per-cycle "pull once" cache.
//!
//! For any image reference, the expensive pull-and-inspect round trip runs
//! at most once per cycle no matter how many containers share the
//! reference. The first requester registers a pending entry and runs the
//! fetch with the map lock released; everyone else waits on the entry's
//! broadcast channel. Settled results, including failures, stay cached for
//! the cache's lifetime — one instance per cycle, never shared across
//! cycles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::types::ImageRecord;

#[derive(Debug, Clone, Error)]
pub enum PullError {
    /// The waiter's own token was cancelled while the fetch was in flight.
    /// The fetch itself keeps running for the remaining waiters.
    #[error("pull wait cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

type Settled = Option<Result<ImageRecord, PullError>>;

struct Entry {
    rx: watch::Receiver<Settled>,
}

#[derive(Default)]
pub struct PullCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PullCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the image record for `key`, or join an in-flight or settled
    /// fetch for the same key. The bool is true when this caller did not
    /// initiate the fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        token: &CancellationToken,
        key: &str,
        fetch: F,
    ) -> (Result<ImageRecord, PullError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ImageRecord>>,
    {
        // Register or join under the lock; never hold it across an await.
        let (initiator_tx, mut rx) = {
            let mut entries = self.entries.lock().expect("pull cache lock poisoned");
            match entries.get(key) {
                Some(entry) => (None, entry.rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.to_string(), Entry { rx: rx.clone() });
                    (Some(tx), rx)
                }
            }
        };

        if let Some(tx) = initiator_tx {
            let result = fetch()
                .await
                .map_err(|e| PullError::Failed(format!("{:#}", e)));
            // Receivers survive the sender, so the settled value stays
            // readable for late requesters within this cycle.
            let _ = tx.send(Some(result.clone()));
            return (result, false);
        }

        loop {
            if let Some(result) = rx.borrow().clone() {
                return (result, true);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return (
                            Err(PullError::Failed("pull fetch abandoned".into())),
                            true,
                        );
                    }
                }
                _ = token.cancelled() => return (Err(PullError::Cancelled), true),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn image(id: &str) -> ImageRecord {
        ImageRecord {
            id: id.into(),
            repo_tags: vec!["nginx:latest".into()],
            created: None,
            size: 0,
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let cache = Arc::new(PullCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&token, "nginx:latest", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(image("sha256:aaa"))
                    })
                    .await
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (result, hit) = handle.await.unwrap();
            assert_eq!(result.unwrap().id, "sha256:aaa");
            if hit {
                hits += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 4);
    }

    #[tokio::test]
    async fn failures_are_cached_not_retried() {
        let cache = PullCache::new();
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();

        let (first, hit) = cache
            .get_or_fetch(&token, "nginx:latest", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("registry unreachable")
            })
            .await;
        assert!(!hit);
        assert!(matches!(first, Err(PullError::Failed(_))));

        let (second, hit) = cache
            .get_or_fetch(&token, "nginx:latest", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(image("sha256:aaa"))
            })
            .await;
        assert!(hit);
        match second {
            Err(PullError::Failed(msg)) => assert!(msg.contains("registry unreachable")),
            other => panic!("expected cached failure, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_disturb_the_fetch() {
        let cache = Arc::new(PullCache::new());
        let fetch_token = CancellationToken::new();

        let initiator = {
            let cache = Arc::clone(&cache);
            let token = fetch_token.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&token, "nginx:latest", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(image("sha256:aaa"))
                    })
                    .await
            })
        };

        // Give the initiator time to register the pending entry.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter_token = CancellationToken::new();
        waiter_token.cancel();
        let (waited, hit) = cache
            .get_or_fetch(&waiter_token, "nginx:latest", || async {
                panic!("second fetch must never run")
            })
            .await;
        assert!(hit);
        assert!(matches!(waited, Err(PullError::Cancelled)));

        // The original fetch settles normally for everyone else.
        let (result, _) = initiator.await.unwrap();
        assert_eq!(result.unwrap().id, "sha256:aaa");

        let (late, hit) = cache
            .get_or_fetch(&fetch_token, "nginx:latest", || async {
                panic!("settled entry must be served from cache")
            })
            .await;
        assert!(hit);
        assert_eq!(late.unwrap().id, "sha256:aaa");
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently() {
        let cache = PullCache::new();
        let token = CancellationToken::new();

        let (a, _) = cache
            .get_or_fetch(&token, "nginx:latest", || async { Ok(image("sha256:aaa")) })
            .await;
        let (b, hit) = cache
            .get_or_fetch(&token, "redis:7", || async { Ok(image("sha256:bbb")) })
            .await;
        assert_eq!(a.unwrap().id, "sha256:aaa");
        assert_eq!(b.unwrap().id, "sha256:bbb");
        assert!(!hit);
    }
}
