//! Instance ownership leases built on the store's conditional write.

use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::store::records::lease_key;
use crate::store::{InstanceStore, WriteOutcome};
use crate::types::{InstanceId, Lease, RunnerId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// A lease this process currently holds, with the store version it was written at
#[derive(Debug, Clone)]
pub struct HeldLease {
    pub instance: InstanceId,
    pub holder: RunnerId,
    pub version: u64,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HeldLease {
    pub fn renewal_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        now >= self.renewed_at + interval
    }
}

/// Acquires, renews and releases leases.
///
/// Acquisition succeeds only when no unexpired lease exists, whoever holds
/// it; the write itself is conditional on the version that was read, so
/// two runners racing for the same instance cannot both win.
#[derive(Clone)]
pub struct LeaseManager {
    records: InstanceStore,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(records: InstanceStore, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            records,
            clock,
            ttl,
        }
    }

    /// Try to take ownership of an instance
    pub async fn acquire(&self, instance: InstanceId, holder: &RunnerId) -> Result<HeldLease> {
        let key = lease_key(instance);
        let now = self.clock.now();

        let existing = self.records.read_versioned(&key).await?;
        let expected = existing.as_ref().map(|doc| doc.version);

        if let Some(doc) = existing {
            let lease: Lease = serde_json::from_value(doc.value)
                .map_err(|e| OrchestratorError::corruption(&key, e))?;
            if lease.is_live(now) {
                return Err(OrchestratorError::LeaseConflict {
                    instance,
                    holder: Some(lease.holder),
                });
            }
        }

        let lease = Lease {
            holder: holder.clone(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };

        match self.swap(&key, expected, &lease).await? {
            WriteOutcome::Written { version } => {
                tracing::debug!("Runner {} acquired lease on {}", holder, instance);
                Ok(HeldLease {
                    instance,
                    holder: holder.clone(),
                    version,
                    acquired_at: now,
                    renewed_at: now,
                    expires_at: lease.expires_at,
                })
            }
            WriteOutcome::Conflict { .. } => Err(OrchestratorError::LeaseConflict {
                instance,
                holder: None,
            }),
        }
    }

    /// Extend a held lease; fails with `LeaseLost` if it was taken over or released
    pub async fn renew(&self, held: &mut HeldLease) -> Result<()> {
        let key = lease_key(held.instance);
        let now = self.clock.now();
        let lease = Lease {
            holder: held.holder.clone(),
            acquired_at: held.acquired_at,
            expires_at: now + self.ttl,
        };

        match self.swap(&key, Some(held.version), &lease).await? {
            WriteOutcome::Written { version } => {
                held.version = version;
                held.renewed_at = now;
                held.expires_at = lease.expires_at;
                Ok(())
            }
            WriteOutcome::Conflict { .. } => Err(OrchestratorError::LeaseLost(held.instance)),
        }
    }

    /// Give up a held lease so another runner can take over immediately
    pub async fn release(&self, held: HeldLease) -> Result<()> {
        let key = lease_key(held.instance);
        let lease = Lease {
            holder: held.holder.clone(),
            acquired_at: held.acquired_at,
            expires_at: self.clock.now(),
        };

        if let WriteOutcome::Conflict { .. } = self.swap(&key, Some(held.version), &lease).await? {
            tracing::debug!(
                "Lease on {} changed hands before release by {}",
                held.instance,
                held.holder
            );
        }
        Ok(())
    }

    /// The unexpired lease on an instance, if any
    pub async fn current(&self, instance: InstanceId) -> Result<Option<Lease>> {
        let lease: Option<Lease> = self.records.get(&lease_key(instance)).await?;
        let now = self.clock.now();
        Ok(lease.filter(|l| l.is_live(now)))
    }

    async fn swap(&self, key: &str, expected: Option<u64>, lease: &Lease) -> Result<WriteOutcome> {
        let value = serde_json::to_value(lease).map_err(|e| OrchestratorError::corruption(key, e))?;
        let store = self.records.raw();
        self.records
            .retry_policy()
            .run("lease write", || {
                store.conditional_write(key, expected, value.clone())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStateStore;

    fn setup() -> (Arc<ManualClock>, InstanceStore) {
        let clock = Arc::new(ManualClock::default());
        let records = InstanceStore::new(Arc::new(MemoryStateStore::new()), RetryPolicy::none());
        (clock, records)
    }

    fn manager(records: &InstanceStore, clock: &Arc<ManualClock>) -> LeaseManager {
        LeaseManager::new(records.clone(), clock.clone(), Duration::seconds(30))
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let (clock, records) = setup();
        let leases = manager(&records, &clock);
        let instance = InstanceId::new();
        let a = RunnerId::new("a");
        let b = RunnerId::new("b");

        let (first, second) = tokio::join!(
            leases.acquire(instance, &a),
            leases.acquire(instance, &b)
        );

        let wins = [first.is_ok(), second.is_ok()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(
            loser,
            Err(OrchestratorError::LeaseConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_live_lease_blocks_other_runner() {
        let (clock, records) = setup();
        let leases = manager(&records, &clock);
        let instance = InstanceId::new();

        leases.acquire(instance, &RunnerId::new("a")).await.unwrap();
        let err = leases
            .acquire(instance, &RunnerId::new("b"))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::LeaseConflict { holder, .. } => {
                assert_eq!(holder, Some(RunnerId::new("a")))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            leases.current(instance).await.unwrap().unwrap().holder,
            RunnerId::new("a")
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_and_renewal_fails() {
        let (clock, records) = setup();
        let leases = manager(&records, &clock);
        let instance = InstanceId::new();

        let mut held = leases.acquire(instance, &RunnerId::new("a")).await.unwrap();
        clock.advance(Duration::seconds(31));
        assert!(leases.current(instance).await.unwrap().is_none());

        leases.acquire(instance, &RunnerId::new("b")).await.unwrap();

        let err = leases.renew(&mut held).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaseLost(id) if id == instance));
    }

    #[tokio::test]
    async fn test_renew_extends_and_release_frees() {
        let (clock, records) = setup();
        let leases = manager(&records, &clock);
        let instance = InstanceId::new();

        let mut held = leases.acquire(instance, &RunnerId::new("a")).await.unwrap();
        assert!(!held.renewal_due(clock.now(), Duration::seconds(10)));

        clock.advance(Duration::seconds(20));
        assert!(held.renewal_due(clock.now(), Duration::seconds(10)));
        leases.renew(&mut held).await.unwrap();
        assert_eq!(held.expires_at, clock.now() + Duration::seconds(30));

        clock.advance(Duration::seconds(20));
        assert!(leases.current(instance).await.unwrap().is_some());

        leases.release(held).await.unwrap();
        assert!(leases.current(instance).await.unwrap().is_none());
        leases.acquire(instance, &RunnerId::new("b")).await.unwrap();
    }
}
