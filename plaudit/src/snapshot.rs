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

//! # The Snapshot Store
//!
//! A [RankingSnapshot] is an immutable, timestamped materialization of one ranking computation.
//! The store is append-only: snapshots are created (by the [coordinator](crate::coordinator),
//! holding the registration lock), then only ever read-- never updated, never deleted (retention
//! is someone else's problem). Immutability is what lets any number of concurrent readers page
//! through a snapshot with no locking whatsoever.
//!
//! Absence ("no snapshot yet") is an ordinary outcome, modeled as `Ok(None)`; an `Err` from any of
//! these methods means the storage layer itself failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::SnapshotId;

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// A materialized ranking: opaque id (assigned monotonically by the store), the serialized ranking
/// table (see [ranking](crate::ranking)), and the moment it was requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RankingSnapshot {
    pub id: SnapshotId,
    pub ranking_data: String,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store {
    /// Persist a new snapshot; a pure insert, it fails only on storage errors. Returns the id the
    /// store assigned.
    async fn append(
        &self,
        ranking_data: String,
        requested_at: DateTime<Utc>,
    ) -> Result<SnapshotId, Error>;
    /// Retrieve a snapshot by id. None means there is no snapshot by that id.
    async fn find(&self, id: &SnapshotId) -> Result<Option<RankingSnapshot>, Error>;
    /// The most recent snapshot, full stop
    async fn find_latest(&self) -> Result<Option<RankingSnapshot>, Error>;
    /// The most recent snapshot with `requested_at` strictly after `threshold`
    async fn find_latest_since(
        &self,
        threshold: &DateTime<Utc>,
    ) -> Result<Option<RankingSnapshot>, Error>;
    /// The most recent snapshot with `requested_at` strictly before `when`; backs the first-day
    /// fallback of the seven-day view
    async fn find_latest_before(
        &self,
        when: &DateTime<Utc>,
    ) -> Result<Option<RankingSnapshot>, Error>;
    /// All snapshots with `start <= requested_at < end`, in no particular order
    async fn find_all_between(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<RankingSnapshot>, Error>;
}
