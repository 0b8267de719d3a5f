// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of plaudit.
//
// plaudit is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// plaudit is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with plaudit.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The Snapshot Coordinator
//!
//! ## Introduction
//!
//! Computing the ranking means reading every project & team-- expensive, and the inputs change
//! constantly. So we materialize it: compute once, persist an immutable [RankingSnapshot], and let
//! every reader for the next few minutes share it. The catch is the thundering herd: when the
//! current snapshot goes stale, *every* concurrent request notices at once, and absent some
//! coordination each would recompute ("cache stampede"). This module is that coordination.
//!
//! ## The protocol
//!
//! [`register()`](Coordinator::register) collapses any burst of concurrent callers into at most
//! one recomputation per freshness window:
//!
//! 1. Check, lock-free: is there a snapshot younger than the freshness window whose inputs
//!    haven't changed since it was taken? Return its id. This is the common path & it never
//!    touches the lock.
//! 2. Otherwise take the distributed registration lock (bounded wait-- a crashed holder must not
//!    wedge every reader; on timeout fail fast with a retryable error).
//! 3. *Re-check* under the lock: while we waited, another holder may have just created a
//!    perfectly good snapshot. If so, return its id, having computed nothing.
//! 4. Compute, serialize, append, return the new id. Append happens only after serialization
//!    succeeds; a serialization failure persists nothing.
//! 5. Release the lock, on every path.
//!
//! Step 3 is the crux: every caller that observed "stale" before any of them recomputed falls
//! through to the lock, but only the first to hold it pays for a computation; the rest find its
//! result. Within one window, then, all callers observe the *same* snapshot id.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use crate::{
    counter_add,
    entities::SnapshotId,
    metrics::{self, Instruments, Sort},
    ranking::{self, RankingEntry},
    snapshot::{self, RankingSnapshot},
    storage,
};

/// Name of the registration lock; every process coordinating on one store must agree on it.
pub const RANKING_SNAPSHOT_LOCK: &str = "ranking-snapshot-lock";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Snapshot {id} holds corrupt ranking data: {source}"))]
    Corrupt {
        id: SnapshotId,
        source: ranking::Error,
    },
    #[snafu(display("The snapshot lock provider failed while acquiring: {source}"))]
    LockInterrupted {
        source: LockError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timed-out waiting for the ranking snapshot lock"))]
    LockUnavailable { backtrace: Backtrace },
    #[snafu(display("While serializing a new snapshot, {source}"))]
    Serialization { source: ranking::Error },
    #[snafu(display("No ranking snapshot exists"))]
    SnapshotNotFound { backtrace: Backtrace },
    #[snafu(display("While talking to the snapshot store, {source}"))]
    Snapshots { source: snapshot::Error },
    #[snafu(display("While talking to the backing store, {source}"))]
    Storage { source: storage::Error },
}

impl Error {
    /// Contention is transient; everything else isn't. Callers use this to decide whether a retry
    /// is worth anyone's time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockUnavailable { .. })
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the lock provider                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Opaque failure from a [LockProvider]
#[derive(Debug)]
pub struct LockError {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for LockError {}

impl LockError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> LockError {
        LockError {
            source: Box::new(err),
        }
    }
}

/// The distributed mutual-exclusion seam
///
/// Any coordination primitive with bounded-wait acquisition & a hold lease can satisfy this: a
/// store-native keyed lock, a consensus-backed lease, or (for single-process deployments) the
/// in-memory provider in [`memory`](crate::memory). `try_lock` resolving `Ok(false)` means the
/// wait timed out; `Err` means the provider itself failed, which is a different animal (see
/// [`Error::LockInterrupted`]).
#[async_trait]
pub trait LockProvider {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        hold: Duration,
    ) -> std::result::Result<bool, LockError>;
    async fn unlock(&self, name: &str) -> std::result::Result<(), LockError>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Configuration parameters for snapshot coordination
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// How long a snapshot stays reusable without recomputation
    #[serde(rename = "freshness-minutes")]
    pub freshness_minutes: u64,
    /// Bound on the wait for the registration lock
    #[serde(rename = "lock-wait-seconds")]
    pub lock_wait_seconds: u64,
    /// Lease on a held registration lock; a crashed holder frees it after this long
    #[serde(rename = "lock-hold-seconds")]
    pub lock_hold_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            freshness_minutes: 5,
            lock_wait_seconds: 15,
            lock_hold_seconds: 60,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          SnapshotView                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A snapshot with its ranking data deserialized; what reporting consumers actually want
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotView {
    pub id: SnapshotId,
    pub requested_at: DateTime<Utc>,
    pub entries: Vec<RankingEntry>,
}

impl TryFrom<RankingSnapshot> for SnapshotView {
    type Error = Error;

    fn try_from(snap: RankingSnapshot) -> Result<SnapshotView> {
        let entries = ranking::parse(&snap.ranking_data).context(CorruptSnafu { id: snap.id })?;
        Ok(SnapshotView {
            id: snap.id,
            requested_at: snap.requested_at,
            entries,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Coordinator                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("snapshot.cache.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("snapshot.cache.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("snapshot.creations", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("snapshot.lock.timeouts", Sort::IntegralCounter) }

/// The coordinator proper; cheap to clone (everything inside is an [Arc] or tiny).
#[derive(Clone)]
pub struct Coordinator {
    storage: Arc<dyn storage::Backend + Send + Sync>,
    snapshots: Arc<dyn snapshot::Store + Send + Sync>,
    locks: Arc<dyn LockProvider + Send + Sync>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn storage::Backend + Send + Sync>,
        snapshots: Arc<dyn snapshot::Store + Send + Sync>,
        locks: Arc<dyn LockProvider + Send + Sync>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> Coordinator {
        Coordinator {
            storage,
            snapshots,
            locks,
            config,
            instruments,
        }
    }

    /// Ensure a fresh snapshot exists; return its id
    ///
    /// The stampede-prevention protocol described [above](self). Fails with
    /// [`Error::LockUnavailable`] (retryable) if the registration lock can't be had within the
    /// configured wait.
    pub async fn register(&self) -> Result<SnapshotId> {
        if let Some(id) = self.reusable().await? {
            debug!("Reusing snapshot {id}");
            counter_add!(self.instruments, "snapshot.cache.hits", 1, &[]);
            return Ok(id);
        }
        counter_add!(self.instruments, "snapshot.cache.misses", 1, &[]);

        let acquired = self
            .locks
            .try_lock(
                RANKING_SNAPSHOT_LOCK,
                Duration::from_secs(self.config.lock_wait_seconds),
                Duration::from_secs(self.config.lock_hold_seconds),
            )
            .await
            .context(LockInterruptedSnafu)?;
        if !acquired {
            warn!("Failed to acquire the lock for snapshot registration");
            counter_add!(self.instruments, "snapshot.lock.timeouts", 1, &[]);
            return LockUnavailableSnafu.fail();
        }
        info!("Lock acquired for snapshot registration");

        // The lock is ours; whatever happens below, give it back.
        let result = self.register_locked().await;
        if let Err(err) = self.locks.unlock(RANKING_SNAPSHOT_LOCK).await {
            // Worst case the hold lease cleans up after us.
            warn!("Failed to release the snapshot registration lock: {err}");
        }
        result
    }

    /// The portion of [`register`](Coordinator::register) run while holding the lock
    async fn register_locked(&self) -> Result<SnapshotId> {
        // Re-check: we may have spent a while waiting on the lock, during which the previous
        // holder likely created exactly the snapshot we wanted.
        if let Some(id) = self.reusable().await? {
            debug!("Reusing snapshot {id} (created while we waited on the lock)");
            counter_add!(self.instruments, "snapshot.cache.hits", 1, &[]);
            return Ok(id);
        }

        let rows = self.storage.projects_with_teams().await.context(StorageSnafu)?;
        let entries = ranking::compute(&rows);
        let json = ranking::serialize(entries).context(SerializationSnafu)?;
        let id = self
            .snapshots
            .append(json, Utc::now())
            .await
            .context(SnapshotsSnafu)?;
        info!("Created ranking snapshot {id}");
        counter_add!(self.instruments, "snapshot.creations", 1, &[]);
        Ok(id)
    }

    /// Is there a snapshot we can hand out without recomputing? That's one younger than the
    /// freshness window whose inputs haven't changed since it was taken.
    async fn reusable(&self) -> Result<Option<SnapshotId>> {
        let threshold =
            Utc::now() - chrono::Duration::minutes(self.config.freshness_minutes as i64);
        match self
            .snapshots
            .find_latest_since(&threshold)
            .await
            .context(SnapshotsSnafu)?
        {
            Some(snap) => {
                if self
                    .storage
                    .ranking_inputs_changed_after(&snap.requested_at)
                    .await
                    .context(StorageSnafu)?
                {
                    // Young enough, but the world moved on underneath it.
                    Ok(None)
                } else {
                    Ok(Some(snap.id))
                }
            }
            None => Ok(None),
        }
    }

    /// The most recent snapshot, deserialized; fails with [`Error::SnapshotNotFound`] if none has
    /// ever been taken
    pub async fn latest(&self) -> Result<SnapshotView> {
        self.snapshots
            .find_latest()
            .await
            .context(SnapshotsSnafu)?
            .context(SnapshotNotFoundSnafu)?
            .try_into()
    }

    /// The last seven calendar days (UTC, oldest first), each backfilled with the most recent
    /// snapshot known at or before that day
    ///
    /// A day with no snapshot of its own inherits the previous day's; the first day, having no
    /// previous day, falls back to the closest snapshot preceding it (or, failing even that, the
    /// globally-latest one). Days before the first snapshot ever taken come back `None`.
    pub async fn last_seven_days(&self) -> Result<Vec<Option<SnapshotView>>> {
        let first_day = Utc::now().date_naive() - Days::new(6);
        let start = day_start(&first_day);
        let end = day_start(&(first_day + Days::new(7)));

        let mut in_window = self
            .snapshots
            .find_all_between(&start, &end)
            .await
            .context(SnapshotsSnafu)?;
        in_window.sort_by_key(|s| std::cmp::Reverse((s.requested_at, s.id)));

        let mut latest_per_day: HashMap<NaiveDate, RankingSnapshot> = HashMap::new();
        for snap in in_window {
            latest_per_day
                .entry(snap.requested_at.date_naive())
                .or_insert(snap);
        }

        let mut views: Vec<Option<SnapshotView>> = Vec::with_capacity(7);
        let mut last_known: Option<RankingSnapshot> = None;
        for i in 0..7u64 {
            let day = first_day + Days::new(i);
            let mut snap = latest_per_day.get(&day).cloned();
            if snap.is_none() && i == 0 {
                snap = self
                    .snapshots
                    .find_latest_before(&start)
                    .await
                    .context(SnapshotsSnafu)?;
                if snap.is_none() {
                    snap = self.snapshots.find_latest().await.context(SnapshotsSnafu)?;
                }
                if let Some(ref snap) = snap {
                    warn!(
                        "No snapshot for first day ({day}); falling back to {} ({})",
                        snap.id, snap.requested_at
                    );
                }
            }
            if snap.is_none() {
                snap = last_known.clone();
            }
            last_known = snap.clone();
            views.push(match snap {
                Some(snap) => Some(snap.try_into()?),
                None => None,
            });
        }

        Ok(views)
    }
}

fn day_start(day: &NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap(/* known good */).and_utc()
}

#[cfg(test)]
mod check_coordination {
    use super::*;

    use crate::{
        entities::{ProjectTitle, TeamId},
        memory::Memory,
        snapshot::Store,
        storage::{Backend, NewProject},
    };

    fn coordinator(memory: &Memory, config: Config) -> Coordinator {
        let memory = Arc::new(memory.clone());
        Coordinator::new(
            memory.clone(),
            memory.clone(),
            memory,
            config,
            Arc::new(Instruments::new("plaudit")),
        )
    }

    async fn seed(memory: &Memory) -> TeamId {
        let t0 = Utc::now() - chrono::Duration::hours(1);
        let team = memory.add_team(1, 1, &t0).await.unwrap();
        memory
            .add_project(
                &NewProject {
                    team_id: Some(team),
                    title: ProjectTitle::new("p").unwrap(/* known good */),
                    introduction: None,
                    detailed_description: None,
                    representative_image_url: None,
                    deployment_url: None,
                    github_url: None,
                    tags: vec![],
                },
                &t0,
            )
            .await
            .unwrap();
        team
    }

    #[tokio::test]
    async fn cache_reuse() {
        let memory = Memory::new();
        seed(&memory).await;
        let coordinator = coordinator(&memory, Config::default());

        let first = coordinator.register().await.unwrap();
        let second = coordinator.register().await.unwrap();
        let third = coordinator.register().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(memory.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn new_data_invalidates() {
        let memory = Memory::new();
        let team = seed(&memory).await;
        let coordinator = coordinator(&memory, Config::default());

        let first = coordinator.register().await.unwrap();
        // A plaudit lands *after* the snapshot was taken; even well inside the freshness window,
        // the next registration must produce a new snapshot.
        memory
            .add_given_plaudits(&team, 1, &Utc::now())
            .await
            .unwrap();
        let second = coordinator.register().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(memory.snapshot_count(), 2);
    }

    #[tokio::test]
    async fn expired_window_recomputes() {
        let memory = Memory::new();
        seed(&memory).await;
        let coordinator = coordinator(&memory, Config::default());

        // Plant a snapshot well outside the 5-minute window; nothing has changed since, but it's
        // too old to reuse.
        let stale = memory
            .append(
                crate::ranking::serialize(vec![]).unwrap(),
                Utc::now() - chrono::Duration::minutes(10),
            )
            .await
            .unwrap();
        let fresh = coordinator.register().await.unwrap();
        assert_ne!(stale, fresh);
    }

    #[tokio::test]
    async fn contention_fails_fast() {
        let memory = Memory::new();
        seed(&memory).await;
        // Someone else holds the registration lock & the store is empty: register() must give up
        // within its bounded wait, with a retryable error.
        memory
            .try_lock(
                RANKING_SNAPSHOT_LOCK,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        let coordinator = coordinator(
            &memory,
            Config {
                lock_wait_seconds: 0,
                ..Default::default()
            },
        );
        let err = coordinator.register().await.unwrap_err();
        assert!(matches!(err, Error::LockUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(memory.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn latest_and_corruption() {
        let memory = Memory::new();
        let coordinator = coordinator(&memory, Config::default());

        assert!(matches!(
            coordinator.latest().await,
            Err(Error::SnapshotNotFound { .. })
        ));

        memory
            .append("certainly not json".to_owned(), Utc::now())
            .await
            .unwrap();
        // Corrupt data is surfaced, never papered-over by recomputing from live state.
        assert!(matches!(
            coordinator.latest().await,
            Err(Error::Corrupt { .. })
        ));
    }
}
