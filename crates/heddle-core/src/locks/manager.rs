//! LockManager - リソースキーに対するリース
//!
//! 待ち行列は持たない。衝突したら即 `LockConflict` を返し、呼び出し側が
//! 後でやり直す。期限切れのリースは見つけたときに掃除する（永続側も削除）。
//!
//! テーブルはストアの射影で、書き込みは「commit → テーブル更新」の順。
//! commit に失敗したらテーブルを捨てて次のアクセスで読み直す。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{HolderId, LockMode, LockRecord, ProjectId, WorkspaceId};
use crate::error::{HeddleError, Result};
use crate::ports::Mutation;
use crate::ports::clock::span;
use crate::state::{StateManager, Transaction};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const MAX_TTL: Duration = Duration::from_secs(3600);

/// Workspace / project a lease is taken on behalf of. Keys themselves are
/// global; the scope is recorded for listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockScope {
    pub workspace_id: Option<WorkspaceId>,
    pub project_id: Option<ProjectId>,
}

impl LockScope {
    pub fn project(workspace_id: WorkspaceId, project_id: ProjectId) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            project_id: Some(project_id),
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(span(ttl))
        .ok_or_else(|| HeddleError::InvalidArgument(format!("lock ttl {ttl:?} overflows the clock")))
}

#[derive(Default)]
struct LockTable {
    loaded: bool,
    by_key: BTreeMap<String, Vec<LockRecord>>,
}

impl LockTable {
    fn live<'a>(&'a self, key: &str, now: DateTime<Utc>) -> impl Iterator<Item = &'a LockRecord> + 'a {
        self.by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter(move |l| !l.is_expired(now))
    }

    fn expired(&self, key: Option<&str>, now: DateTime<Utc>) -> Vec<LockRecord> {
        let keys: Box<dyn Iterator<Item = &Vec<LockRecord>>> = match key {
            Some(key) => Box::new(self.by_key.get(key).into_iter()),
            None => Box::new(self.by_key.values()),
        };
        keys.flatten().filter(|l| l.is_expired(now)).cloned().collect()
    }

    fn remove(&mut self, record: &LockRecord) {
        if let Some(locks) = self.by_key.get_mut(&record.resource_key) {
            locks.retain(|l| l.lock_id != record.lock_id);
            if locks.is_empty() {
                self.by_key.remove(&record.resource_key);
            }
        }
    }

    fn upsert(&mut self, record: LockRecord) {
        let locks = self.by_key.entry(record.resource_key.clone()).or_default();
        match locks.iter_mut().find(|l| l.lock_id == record.lock_id) {
            Some(existing) => *existing = record,
            None => locks.push(record),
        }
    }
}

pub struct LockManager {
    state: Arc<StateManager>,
    table: Mutex<LockTable>,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl LockManager {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self {
            state,
            table: Mutex::new(LockTable::default()),
            default_ttl: DEFAULT_TTL,
            max_ttl: MAX_TTL,
        }
    }

    pub fn with_ttls(mut self, default_ttl: Duration, max_ttl: Duration) -> Self {
        self.max_ttl = max_ttl;
        self.default_ttl = default_ttl.min(max_ttl);
        self
    }

    async fn ensure_loaded(&self, table: &mut LockTable) -> Result<()> {
        if table.loaded {
            return Ok(());
        }
        let mut by_key: BTreeMap<String, Vec<LockRecord>> = BTreeMap::new();
        for record in self.state.store().locks().await? {
            by_key.entry(record.resource_key.clone()).or_default().push(record);
        }
        debug!(keys = by_key.len(), "lock table loaded");
        table.by_key = by_key;
        table.loaded = true;
        Ok(())
    }

    /// Commits `tx`; on failure the table is dropped and reloaded later.
    async fn commit(&self, table: &mut LockTable, tx: Transaction) -> Result<()> {
        if let Err(err) = self.state.commit(tx).await {
            table.loaded = false;
            return Err(err);
        }
        Ok(())
    }

    fn ttl(&self, ttl: Option<Duration>) -> Result<Duration> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(HeddleError::InvalidArgument("lock ttl must be positive".into()));
        }
        if ttl > self.max_ttl {
            debug!(requested = ?ttl, max = ?self.max_ttl, "lock ttl clamped");
        }
        Ok(ttl.min(self.max_ttl))
    }

    /// Grants a lease or fails with `LockConflict`. Never waits.
    ///
    /// A holder that already holds the key gets its lease refreshed (and its
    /// mode changed, if nobody else is in the way).
    pub async fn acquire(
        &self,
        resource_key: &str,
        holder: &HolderId,
        mode: LockMode,
        ttl: Option<Duration>,
        scope: LockScope,
    ) -> Result<LockRecord> {
        if resource_key.is_empty() {
            return Err(HeddleError::InvalidArgument("empty resource key".into()));
        }
        let ttl = self.ttl(ttl)?;

        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();

        let conflict = table
            .live(resource_key, now)
            .filter(|l| &l.holder != holder && !mode.compatible_with(l.mode))
            .max_by_key(|l| l.expires_at);
        if let Some(blocking) = conflict {
            let remaining = blocking.remaining(now);
            warn!(key = resource_key, holder = %holder, held_by = %blocking.holder, "lock conflict");
            return Err(HeddleError::LockConflict {
                resource_key: resource_key.to_string(),
                holder: blocking.holder.clone(),
                mode: blocking.mode,
                remaining,
            });
        }

        let expired = table.expired(Some(resource_key), now);
        let mut tx = Transaction::new("acquire_lock");
        for record in &expired {
            tx.push(Mutation::DeleteLock(record.lock_id));
        }

        let existing = table.live(resource_key, now).find(|l| &l.holder == holder).cloned();
        let renewed = existing.is_some();
        let record = match existing {
            Some(mut record) => {
                record.mode = mode;
                record.expires_at = expiry(now, ttl)?;
                tx.push(Mutation::UpdateLock(record.clone()));
                record
            }
            None => {
                let record = LockRecord {
                    lock_id: self.state.ids().next(),
                    resource_key: resource_key.to_string(),
                    holder: holder.clone(),
                    mode,
                    workspace_id: scope.workspace_id,
                    project_id: scope.project_id,
                    acquired_at: now,
                    expires_at: expiry(now, ttl)?,
                };
                tx.push(Mutation::InsertLock(record.clone()));
                record
            }
        };
        self.commit(&mut table, tx).await?;

        for record in &expired {
            table.remove(record);
        }
        table.upsert(record.clone());
        info!(key = resource_key, holder = %holder, mode = %mode, ttl = ?ttl, renewed, "lock granted");
        Ok(record)
    }

    /// Releases `holder`'s lease on the key. Anyone else gets `NotHolder`
    /// and the lock stays as it was.
    pub async fn release(&self, resource_key: &str, holder: &HolderId) -> Result<LockRecord> {
        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();

        let Some(record) = table
            .live(resource_key, now)
            .find(|l| &l.holder == holder)
            .cloned()
        else {
            let current = table.live(resource_key, now).map(|l| l.holder.clone()).collect();
            warn!(key = resource_key, holder = %holder, "release by non-holder refused");
            return Err(HeddleError::NotHolder {
                resource_key: resource_key.to_string(),
                holder: holder.clone(),
                current,
            });
        };

        let mut tx = Transaction::new("release_lock");
        tx.push(Mutation::DeleteLock(record.lock_id));
        self.commit(&mut table, tx).await?;
        table.remove(&record);
        info!(key = resource_key, holder = %holder, "lock released");
        Ok(record)
    }

    /// Runs `work` while holding the lease and releases it afterwards,
    /// whatever `work` returned.
    ///
    /// A lease that already lapsed and went to someone else is left alone.
    /// If the returned future is dropped before `work` finishes, the lease
    /// runs out at its ttl.
    pub async fn with_lease<F, Fut, T>(
        &self,
        resource_key: &str,
        holder: &HolderId,
        mode: LockMode,
        ttl: Option<Duration>,
        scope: LockScope,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(LockRecord) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(resource_key, holder, mode, ttl, scope).await?;
        let output = work(lease).await;
        match self.release(resource_key, holder).await {
            Ok(_) => Ok(output),
            Err(HeddleError::NotHolder { current, .. }) => {
                warn!(key = resource_key, holder = %holder, ?current, "lease lapsed before release");
                Ok(output)
            }
            Err(err) => Err(err),
        }
    }

    /// Pushes the expiry of a held lease to `now + ttl`.
    pub async fn extend(
        &self,
        resource_key: &str,
        holder: &HolderId,
        ttl: Option<Duration>,
    ) -> Result<LockRecord> {
        let ttl = self.ttl(ttl)?;
        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();

        let Some(mut record) = table
            .live(resource_key, now)
            .find(|l| &l.holder == holder)
            .cloned()
        else {
            let current = table.live(resource_key, now).map(|l| l.holder.clone()).collect();
            return Err(HeddleError::NotHolder {
                resource_key: resource_key.to_string(),
                holder: holder.clone(),
                current,
            });
        };

        record.expires_at = expiry(now, ttl)?;
        let mut tx = Transaction::new("extend_lock");
        tx.push(Mutation::UpdateLock(record.clone()));
        self.commit(&mut table, tx).await?;
        table.upsert(record.clone());
        debug!(key = resource_key, holder = %holder, expires_at = %record.expires_at, "lock extended");
        Ok(record)
    }

    /// Live leases, by key. Expired ones found on the way are purged.
    pub async fn list_active(&self, project: Option<ProjectId>) -> Result<Vec<LockRecord>> {
        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();

        let expired = table.expired(None, now);
        if !expired.is_empty() {
            let mut tx = Transaction::new("purge_locks");
            for record in &expired {
                tx.push(Mutation::DeleteLock(record.lock_id));
            }
            self.commit(&mut table, tx).await?;
            for record in &expired {
                table.remove(record);
            }
            debug!(purged = expired.len(), "expired locks purged");
        }

        Ok(table
            .by_key
            .values()
            .flatten()
            .filter(|l| project.is_none() || l.project_id == project)
            .cloned()
            .collect())
    }

    /// Live leases on one key.
    pub async fn lock_on(&self, resource_key: &str) -> Result<Vec<LockRecord>> {
        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();
        Ok(table.live(resource_key, now).cloned().collect())
    }

    /// Live leases taken by `holder`.
    pub async fn held_by(&self, holder: &HolderId) -> Result<Vec<LockRecord>> {
        let mut table = self.table.lock().await;
        self.ensure_loaded(&mut table).await?;
        let now = self.state.now();
        Ok(table
            .by_key
            .values()
            .flatten()
            .filter(|l| &l.holder == holder && !l.is_expired(now))
            .cloned()
            .collect())
    }

    /// Reloads the table from the store. Returns the number of records.
    pub async fn rebuild(&self) -> Result<usize> {
        let mut table = self.table.lock().await;
        table.loaded = false;
        self.ensure_loaded(&mut table).await?;
        Ok(table.by_key.values().map(Vec::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::domain::Role;
    use crate::fixtures;
    use crate::ports::FixedClock;
    use rstest::rstest;

    fn manager() -> (LockManager, Arc<StateManager>, FixedClock) {
        let (state, clock) = fixtures::state_manager();
        (LockManager::new(state.clone()), state, clock)
    }

    fn secs(n: u64) -> Option<Duration> {
        Some(Duration::from_secs(n))
    }

    #[tokio::test]
    async fn exclusive_conflict_clears_after_expiry() {
        let (locks, _, clock) = manager();
        let (h1, h2) = (HolderId::from("h1"), HolderId::from("h2"));

        locks.acquire("R", &h1, LockMode::Exclusive, secs(5), LockScope::default()).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let err = locks
            .acquire("R", &h2, LockMode::Exclusive, secs(5), LockScope::default())
            .await
            .unwrap_err();
        match err {
            HeddleError::LockConflict { holder, remaining, .. } => {
                assert_eq!(holder, h1);
                assert_eq!(remaining, Duration::from_secs(3));
            }
            other => panic!("unexpected {other:?}"),
        }

        // still held at exactly the expiry instant
        clock.advance(Duration::from_secs(3));
        assert!(locks.acquire("R", &h2, LockMode::Exclusive, secs(5), LockScope::default()).await.is_err());

        clock.advance(Duration::from_secs(1));
        let granted = locks
            .acquire("R", &h2, LockMode::Exclusive, secs(5), LockScope::default())
            .await
            .unwrap();
        assert_eq!(granted.holder, h2);
    }

    #[tokio::test]
    async fn release_by_non_holder_leaves_the_lock() {
        let (locks, _, _) = manager();
        let (h1, h2) = (HolderId::from("h1"), HolderId::from("h2"));
        locks.acquire("R", &h1, LockMode::Exclusive, secs(5), LockScope::default()).await.unwrap();

        let err = locks.release("R", &h2).await.unwrap_err();
        assert!(matches!(err, HeddleError::NotHolder { ref current, .. } if current == &vec![h1.clone()]));
        assert_eq!(locks.lock_on("R").await.unwrap()[0].holder, h1);

        locks.release("R", &h1).await.unwrap();
        assert!(locks.lock_on("R").await.unwrap().is_empty());
    }

    #[rstest]
    #[case(LockMode::Shared, LockMode::Shared, true)]
    #[case(LockMode::Shared, LockMode::Exclusive, false)]
    #[case(LockMode::Exclusive, LockMode::Shared, false)]
    #[tokio::test]
    async fn second_holder_by_mode(#[case] first: LockMode, #[case] second: LockMode, #[case] granted: bool) {
        let (locks, _, _) = manager();
        locks.acquire("R", &"a".into(), first, None, LockScope::default()).await.unwrap();
        let result = locks.acquire("R", &"b".into(), second, None, LockScope::default()).await;
        assert_eq!(result.is_ok(), granted);
    }

    #[tokio::test]
    async fn reacquire_refreshes_the_lease() {
        let (locks, state, clock) = manager();
        let h1 = HolderId::from("h1");
        let first = locks.acquire("R", &h1, LockMode::Exclusive, secs(10), LockScope::default()).await.unwrap();
        clock.advance(Duration::from_secs(8));
        let second = locks.acquire("R", &h1, LockMode::Exclusive, secs(10), LockScope::default()).await.unwrap();

        assert_eq!(first.lock_id, second.lock_id);
        assert_eq!(second.expires_at, fixtures::t0() + chrono::TimeDelta::seconds(18));
        assert_eq!(state.store().locks().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn ttl_defaults_and_clamps() {
        let (locks, _, _) = manager();
        let default = locks.acquire("a", &"h".into(), LockMode::Shared, None, LockScope::default()).await.unwrap();
        assert_eq!(default.expires_at - default.acquired_at, chrono::TimeDelta::seconds(300));

        let clamped = locks
            .acquire("b", &"h".into(), LockMode::Shared, secs(86_400), LockScope::default())
            .await
            .unwrap();
        assert_eq!(clamped.expires_at - clamped.acquired_at, chrono::TimeDelta::seconds(3600));

        let err = locks.acquire("c", &"h".into(), LockMode::Shared, secs(0), LockScope::default()).await.unwrap_err();
        assert!(matches!(err, HeddleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn extend_requires_the_holder() {
        let (locks, _, clock) = manager();
        let h1 = HolderId::from("h1");
        locks.acquire("R", &h1, LockMode::Exclusive, secs(5), LockScope::default()).await.unwrap();
        clock.advance(Duration::from_secs(4));

        let extended = locks.extend("R", &h1, secs(60)).await.unwrap();
        assert_eq!(extended.expires_at, fixtures::t0() + chrono::TimeDelta::seconds(64));
        assert!(matches!(
            locks.extend("R", &"h2".into(), secs(60)).await.unwrap_err(),
            HeddleError::NotHolder { .. }
        ));
    }

    #[tokio::test]
    async fn listing_purges_expired_leases_from_the_store() {
        let (locks, state, clock) = manager();
        let mut tx = Transaction::new("seed");
        tx.push(Mutation::InsertWorkspace(fixtures::workspace(1, "alice")))
            .push(Mutation::PutMember(fixtures::member(1, "alice", Role::Owner)))
            .push(Mutation::InsertProject(fixtures::project(10, 1)))
            .push(Mutation::InsertProject(fixtures::project(11, 1)));
        state.commit(tx).await.unwrap();

        let etl = LockScope::project(fixtures::ws_id(1), fixtures::proj_id(10));
        let ml = LockScope::project(fixtures::ws_id(1), fixtures::proj_id(11));
        locks.acquire("short", &"h1".into(), LockMode::Exclusive, secs(1), etl).await.unwrap();
        locks.acquire("shared", &"h2".into(), LockMode::Shared, secs(60), etl).await.unwrap();
        locks.acquire("other", &"h2".into(), LockMode::Shared, secs(60), ml).await.unwrap();
        locks.acquire("long", &"h1".into(), LockMode::Exclusive, secs(60), LockScope::default()).await.unwrap();

        let keys = |records: Vec<LockRecord>| records.into_iter().map(|l| l.resource_key).collect::<Vec<_>>();
        assert_eq!(keys(locks.list_active(Some(fixtures::proj_id(10))).await.unwrap()), vec!["shared", "short"]);
        assert_eq!(keys(locks.list_active(Some(fixtures::proj_id(11))).await.unwrap()), vec!["other"]);

        clock.advance(Duration::from_secs(2));
        assert_eq!(keys(locks.list_active(Some(fixtures::proj_id(10))).await.unwrap()), vec!["shared"]);
        assert_eq!(keys(locks.list_active(None).await.unwrap()), vec!["long", "other", "shared"]);
        assert_eq!(state.store().locks().await.unwrap().len(), 3);
        assert_eq!(locks.held_by(&"h1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn with_lease_releases_after_the_work() {
        let (locks, _, _) = manager();
        let h1 = HolderId::from("h1");

        let seen = locks
            .with_lease("R", &h1, LockMode::Exclusive, secs(30), LockScope::default(), |lease| async move {
                lease.holder.to_string()
            })
            .await
            .unwrap();
        assert_eq!(seen, "h1");
        assert!(locks.lock_on("R").await.unwrap().is_empty());

        // the work's own error does not keep the lease
        let failed: std::result::Result<(), &str> = locks
            .with_lease("R", &h1, LockMode::Exclusive, None, LockScope::default(), |_| async { Err("boom") })
            .await
            .unwrap();
        assert_eq!(failed, Err("boom"));
        assert!(locks.lock_on("R").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn with_lease_refuses_a_held_key_without_running() {
        let (locks, _, clock) = manager();
        let (locks, clock) = (&locks, &clock);
        locks.acquire("R", &"h1".into(), LockMode::Exclusive, secs(5), LockScope::default()).await.unwrap();

        let ran = &AtomicBool::new(false);
        let err = locks
            .with_lease("R", &"h2".into(), LockMode::Shared, None, LockScope::default(), |_| async move {
                ran.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::LockConflict { .. }));
        assert!(!ran.load(Ordering::SeqCst));

        // a lease that lapses mid-work and is taken over stays with the new holder
        let taken = locks
            .with_lease("L", &"h1".into(), LockMode::Exclusive, secs(1), LockScope::default(), |_| async move {
                clock.advance(Duration::from_secs(2));
                locks.acquire("L", &"h2".into(), LockMode::Exclusive, None, LockScope::default()).await.unwrap()
            })
            .await
            .unwrap();
        assert_eq!(locks.lock_on("L").await.unwrap(), vec![taken]);
    }

    #[tokio::test]
    async fn ttl_that_overflows_the_clock_is_rejected() {
        let (locks, _, _) = manager();
        let locks = locks.with_ttls(DEFAULT_TTL, Duration::MAX);
        let err = locks
            .acquire("R", &"h".into(), LockMode::Shared, Some(Duration::MAX), LockScope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::InvalidArgument(_)));
        assert!(locks.lock_on("R").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_new_manager_sees_persisted_leases() {
        let (locks, state, _) = manager();
        locks.acquire("R", &"h1".into(), LockMode::Exclusive, secs(30), LockScope::default()).await.unwrap();

        let restarted = LockManager::new(state);
        assert_eq!(restarted.rebuild().await.unwrap(), 1);
        let err = restarted
            .acquire("R", &"h2".into(), LockMode::Exclusive, None, LockScope::default())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
