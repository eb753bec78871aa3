//! Invoice-creation idempotency
//!
//! Makes "create invoice" safe to retry: the first request for a key drives
//! the wallet client and persists the issued invoice; every later request
//! with the same key and the same logical parameters returns the stored
//! invoice without touching the wallet. Concurrent callers presenting the
//! same key are serialized per key, so the create path runs at most once.

use crate::db::{Database, IdempotencyQueries, IdempotencyRecord};
use crate::{PaywallError, PaywallResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// An invoice issued by the wallet client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    /// The BOLT11 invoice string
    pub invoice: String,
    /// Payment hash encoded in the invoice
    pub payment_hash: String,
}

/// Durable idempotency map with per-key single-flight
pub struct IdempotencyMap {
    db: Arc<Database>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdempotencyMap {
    /// Create a map over the given store
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the invoice already issued for `key`, or call `create` to
    /// issue one and persist it.
    ///
    /// A stored record whose amount or description differs from the request
    /// is a `Conflict`: the key is being reused for different parameters.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        amount_sat: u64,
        description: &str,
        create: F,
    ) -> PaywallResult<IssuedInvoice>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaywallResult<IssuedInvoice>>,
    {
        let key_lock = self.key_lock(key).await;
        let result = {
            let _guard = key_lock.lock().await;
            self.lookup_or_issue(key, amount_sat, description, create).await
        };

        // Release on every exit path (replay, conflict, create failure),
        // not just success; otherwise the map grows by one entry per key
        // ever seen.
        drop(key_lock);
        self.release_key_lock(key).await;
        result
    }

    async fn lookup_or_issue<F, Fut>(
        &self,
        key: &str,
        amount_sat: u64,
        description: &str,
        create: F,
    ) -> PaywallResult<IssuedInvoice>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaywallResult<IssuedInvoice>>,
    {
        let queries = IdempotencyQueries::new(&self.db);

        if let Some(existing) = queries.get(key).await? {
            if existing.amount_sat != amount_sat || existing.description != description {
                return Err(PaywallError::Conflict(format!(
                    "idempotency key {} was used with different parameters",
                    key
                )));
            }
            debug!("Idempotency: returning stored invoice for key {}", key);
            return Ok(IssuedInvoice {
                invoice: existing.invoice,
                payment_hash: existing.payment_hash,
            });
        }

        let issued = create().await?;

        queries
            .insert(&IdempotencyRecord {
                idempotency_key: key.to_string(),
                payment_hash: issued.payment_hash.clone(),
                invoice: issued.invoice.clone(),
                amount_sat,
                description: description.to_string(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        info!("Idempotency: issued invoice for key {}", key);
        Ok(issued)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the per-key lock entry once no other caller holds it, keeping
    /// the lock map from growing with one entry per key ever seen.
    async fn release_key_lock(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            // Only the map itself holds a reference; concurrent callers
            // still waiting on this key keep their own clone, which blocks
            // removal until they release too.
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    async fn lock_entry_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn test_map() -> IdempotencyMap {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        IdempotencyMap::new(db)
    }

    fn issued(n: u32) -> IssuedInvoice {
        IssuedInvoice {
            invoice: format!("lnbc-test-{}", n),
            payment_hash: format!("hash-{}", n),
        }
    }

    #[tokio::test]
    async fn test_repeated_calls_return_identical_invoice() {
        let map = test_map().await;
        let calls = Arc::new(AtomicU32::new(0));

        let mut results = Vec::new();
        for _ in 0..3 {
            let calls = calls.clone();
            let result = map
                .get_or_create("key1", 1000, "Article 42", move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(issued(n))
                })
                .await
                .unwrap();
            results.push(result);
        }

        // Create path invoked at most once; all callers see the same pair
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[tokio::test]
    async fn test_concurrent_same_key_single_flight() {
        let map = Arc::new(test_map().await);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                map.get_or_create("key1", 1000, "Article 42", move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    // Widen the race window
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok(issued(n))
                })
                .await
                .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[tokio::test]
    async fn test_parameter_mismatch_is_conflict() {
        let map = test_map().await;

        map.get_or_create("key1", 1000, "Article 42", || async { Ok(issued(0)) })
            .await
            .unwrap();

        let err = map
            .get_or_create("key1", 2000, "Article 42", || async { Ok(issued(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, PaywallError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_failure_is_not_recorded() {
        let map = test_map().await;

        let err = map
            .get_or_create("key1", 1000, "Article 42", || async {
                Err(PaywallError::Unavailable("daemon down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaywallError::Unavailable(_)));

        // A later retry with the same key issues fresh
        let result = map
            .get_or_create("key1", 1000, "Article 42", || async { Ok(issued(7)) })
            .await
            .unwrap();
        assert_eq!(result.payment_hash, "hash-7");
    }

    #[tokio::test]
    async fn test_lock_map_drains_after_every_outcome() {
        let map = test_map().await;

        // Replays of many distinct keys must not accumulate lock entries
        for n in 0..50 {
            let key = format!("key-{}", n);
            map.get_or_create(&key, 1000, "Article 42", || async move { Ok(issued(n)) })
                .await
                .unwrap();
            map.get_or_create(&key, 1000, "Article 42", || async {
                panic!("replay must not issue")
            })
            .await
            .unwrap();
        }
        assert_eq!(map.lock_entry_count().await, 0);

        // Conflict path releases too
        let err = map
            .get_or_create("key-0", 9999, "Article 42", || async { Ok(issued(0)) })
            .await
            .unwrap_err();
        assert!(matches!(err, PaywallError::Conflict(_)));
        assert_eq!(map.lock_entry_count().await, 0);

        // Create-failure path releases too
        let err = map
            .get_or_create("fresh", 1000, "Article 42", || async {
                Err(PaywallError::Unavailable("daemon down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaywallError::Unavailable(_)));
        assert_eq!(map.lock_entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_different_keys_issue_independently() {
        let map = test_map().await;

        let a = map
            .get_or_create("key1", 1000, "a", || async { Ok(issued(1)) })
            .await
            .unwrap();
        let b = map
            .get_or_create("key2", 1000, "a", || async { Ok(issued(2)) })
            .await
            .unwrap();
        assert_ne!(a.payment_hash, b.payment_hash);
    }
}
