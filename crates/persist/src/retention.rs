use chrono::{DateTime, Duration, Utc};
use revisionable_common::{Identity, Snapshot};
use revisionable_kernel::{SnapshotStore, StoreError};

/// How many snapshots of one entity survive truncation.
///
/// Only snapshots at least `minimum_age` old are candidates for deletion;
/// of those, the newest `limit` are kept and everything at or below the next
/// one goes. Without a `limit` nothing is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub limit: Option<usize>,
    pub minimum_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_minimum_age(mut self, age: Duration) -> Self {
        self.minimum_age = Some(age);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.limit.is_none()
    }

    /// Highest revision to delete, if any.
    pub fn cutoff<'a>(&self, snapshots: impl IntoIterator<Item = &'a Snapshot>, now: DateTime<Utc>) -> Option<u64> {
        let limit = self.limit?;
        let floor = self.minimum_age.map(|age| now - age);
        let mut eligible: Vec<u64> = snapshots
            .into_iter()
            .filter(|s| floor.is_none_or(|floor| s.created_at <= floor))
            .map(|s| s.revision)
            .collect();
        eligible.sort_unstable_by(|a, b| b.cmp(a));
        eligible.get(limit).copied()
    }
}

/// Apply `policy` to the snapshots of one entity. Returns the number deleted.
pub fn truncate<S: SnapshotStore + ?Sized>(
    store: &mut S,
    entity_type: &str,
    id: &Identity,
    policy: &RetentionPolicy,
) -> Result<usize, StoreError> {
    if policy.is_noop() {
        return Ok(0);
    }
    let snapshots = store.snapshots_for(entity_type, id)?;
    let Some(cutoff) = policy.cutoff(&snapshots, store.now()) else {
        return Ok(0);
    };
    let removed = store.delete_snapshots_through(entity_type, id, cutoff)?;
    if removed > 0 {
        tracing::info!(entity_type, %id, cutoff, removed, "truncated revisions");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn epoch() -> DateTime<Utc> {
        DateTime::UNIX_EPOCH
    }

    /// Snapshots 1..=ages.len(), created `ages[i]` seconds before `now`.
    fn history(ages: &[i64], now: DateTime<Utc>) -> Vec<Snapshot> {
        ages.iter()
            .enumerate()
            .map(|(i, age)| Snapshot {
                entity_type: "Post".into(),
                entity_id: Identity::from(1),
                revision: i as u64 + 1,
                payload: Vec::new(),
                created_at: now - Duration::seconds(*age),
                trash: false,
                extensions: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn limit_keeps_newest() {
        let now = epoch();
        let snapshots = history(&[50, 40, 30, 20, 10], now);
        let policy = RetentionPolicy::new().with_limit(3);
        assert_eq!(policy.cutoff(&snapshots, now), Some(2));
    }

    #[test]
    fn under_limit_deletes_nothing() {
        let now = epoch();
        let snapshots = history(&[20, 10], now);
        assert_eq!(RetentionPolicy::new().with_limit(3).cutoff(&snapshots, now), None);
    }

    #[test]
    fn young_snapshots_are_never_candidates() {
        let now = epoch();
        let snapshots = history(&[300, 200, 30, 20, 10], now);
        let policy = RetentionPolicy::new()
            .with_limit(1)
            .with_minimum_age(Duration::seconds(60));
        assert_eq!(policy.cutoff(&snapshots, now), Some(1));
    }

    #[test]
    fn minimum_age_alone_deletes_nothing() {
        let now = epoch();
        let snapshots = history(&[300, 200, 100], now);
        let policy = RetentionPolicy::new().with_minimum_age(Duration::seconds(60));
        assert!(policy.is_noop());
        assert_eq!(policy.cutoff(&snapshots, now), None);
    }

    proptest! {
        #[test]
        fn truncation_keeps_young_and_limit_eligible(
            gaps in proptest::collection::vec(1i64..100, 0..20),
            limit in 0usize..6,
            min_age in proptest::option::of(0i64..500),
        ) {
            let now = epoch();
            // Oldest first: ages strictly decrease as revisions increase.
            let total: i64 = gaps.iter().sum();
            let mut age = total;
            let ages: Vec<i64> = gaps.iter().map(|gap| { let a = age; age -= gap; a }).collect();
            let snapshots = history(&ages, now);

            let mut policy = RetentionPolicy::new().with_limit(limit);
            if let Some(secs) = min_age {
                policy = policy.with_minimum_age(Duration::seconds(secs));
            }
            let cutoff = policy.cutoff(&snapshots, now).unwrap_or(0);
            let kept: Vec<&Snapshot> = snapshots.iter().filter(|s| s.revision > cutoff).collect();

            let floor = min_age.map(|secs| now - Duration::seconds(secs));
            let is_young = |s: &Snapshot| floor.is_some_and(|floor| s.created_at > floor);
            for s in &snapshots {
                if is_young(s) {
                    prop_assert!(s.revision > cutoff, "young revision {} deleted", s.revision);
                }
            }
            let eligible = snapshots.iter().filter(|s| !is_young(s)).count();
            let kept_eligible = kept.iter().filter(|s| !is_young(s)).count();
            prop_assert_eq!(kept_eligible, eligible.min(limit));
        }
    }
}
