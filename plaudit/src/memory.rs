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

//! # The in-memory backend
//!
//! A single-process implementation of all three of plaudit's seams: [`storage::Backend`], the
//! [`snapshot::Store`], and the [`coordinator::LockProvider`]. It backs every test in the
//! workspace and `plauditd`'s single-node mode; relational & distributed implementations plug in
//! behind the same traits without the rest of the crate noticing.
//!
//! Ids are handed out monotonically per table, like the auto-increment columns they stand in for.
//! The named locks honor the same contract as a distributed lock service: bounded wait, and a
//! *hold* lease after which an un-released lock expires on its own (so a crashed holder can't
//! wedge everyone else).
//!
//! [`storage::Backend`]: crate::storage::Backend
//! [`snapshot::Store`]: crate::snapshot::Store
//! [`coordinator::LockProvider`]: crate::coordinator::LockProvider

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::debug;
use url::Url;

use crate::{
    coordinator::{LockError, LockProvider},
    entities::{
        BadgeStat, BadgeStatId, Comment, CommentId, Member, MemberId, Project, ProjectId,
        SnapshotId, Team, TeamId,
    },
    paging::{keyset_slice, BadgeAcquisition, CommentRecency, CountAnchor, ProjectRecency,
             TimeAnchor},
    snapshot::{self, RankingSnapshot},
    storage::{self, NewProject, ProjectExistsSnafu, UnknownProjectSnafu, UnknownTeamSnafu},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tables                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct Tables {
    next_team: i64,
    next_member: i64,
    next_project: i64,
    next_comment: i64,
    next_badge: i64,
    next_snapshot: i64,
    teams: HashMap<TeamId, Team>,
    members: HashMap<MemberId, Member>,
    projects: HashMap<ProjectId, Project>,
    comments: HashMap<CommentId, Comment>,
    badges: HashMap<BadgeStatId, BadgeStat>,
    /// (receiver, giver) :=> tally row; backs the upsert in `record_badge`
    badge_index: HashMap<(TeamId, TeamId), BadgeStatId>,
    snapshots: BTreeMap<SnapshotId, RankingSnapshot>,
    /// When did a ranking input (project creation, plaudit count) last change?
    ranking_touched_at: Option<DateTime<Utc>>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           named locks                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Held {
    permit: OwnedSemaphorePermit,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct Locks {
    semaphores: HashMap<String, Arc<Semaphore>>,
    held: HashMap<String, Held>,
}

impl Locks {
    fn release(&mut self, name: &str) -> bool {
        match self.held.remove(name) {
            Some(held) => {
                held.expiry.abort();
                drop(held.permit);
                true
            }
            None => false,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Memory                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The in-memory backend; cheap to clone, clones share state.
#[derive(Clone, Default)]
pub struct Memory {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<Mutex<Locks>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    /// How many snapshots have ever been appended? The single-writer tests assert on this.
    pub fn snapshot_count(&self) -> usize {
        self.tables.read().unwrap(/* poisoning is fatal */).snapshots.len()
    }
}

#[async_trait]
impl storage::Backend for Memory {
    async fn add_team(
        &self,
        term: u32,
        number: u32,
        dt: &DateTime<Utc>,
    ) -> Result<TeamId, storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        tables.next_team += 1;
        let id = TeamId::from_raw(tables.next_team);
        tables.teams.insert(
            id,
            Team {
                id,
                term,
                number,
                given_plaudit_count: 0,
                received_plaudit_count: 0,
                badge_image_url: None,
                created_at: *dt,
                modified_at: *dt,
            },
        );
        Ok(id)
    }
    async fn team(&self, id: &TeamId) -> Result<Option<Team>, storage::Error> {
        Ok(self.tables.read().unwrap(/* poisoning is fatal */).teams.get(id).cloned())
    }
    async fn teams_by_ids(&self, ids: &[TeamId]) -> Result<Vec<Team>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(ids
            .iter()
            .filter_map(|id| tables.teams.get(id).cloned())
            .collect())
    }
    async fn add_given_plaudits(
        &self,
        id: &TeamId,
        amount: u64,
        dt: &DateTime<Utc>,
    ) -> Result<(), storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        let team = tables
            .teams
            .get_mut(id)
            .ok_or(UnknownTeamSnafu { id: *id }.build())?;
        team.given_plaudit_count += amount;
        team.modified_at = *dt;
        tables.ranking_touched_at = Some(*dt);
        Ok(())
    }
    async fn add_received_plaudits(
        &self,
        id: &TeamId,
        amount: u64,
        dt: &DateTime<Utc>,
    ) -> Result<(), storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        let team = tables
            .teams
            .get_mut(id)
            .ok_or(UnknownTeamSnafu { id: *id }.build())?;
        team.received_plaudit_count += amount;
        team.modified_at = *dt;
        tables.ranking_touched_at = Some(*dt);
        Ok(())
    }

    async fn add_member(
        &self,
        name: &str,
        nickname: Option<&str>,
        profile_image_url: Option<Url>,
        _dt: &DateTime<Utc>,
    ) -> Result<MemberId, storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        tables.next_member += 1;
        let id = MemberId::from_raw(tables.next_member);
        tables.members.insert(
            id,
            Member {
                id,
                name: name.to_owned(),
                nickname: nickname.map(str::to_owned),
                profile_image_url,
            },
        );
        Ok(id)
    }
    async fn members_by_ids(&self, ids: &[MemberId]) -> Result<Vec<Member>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(ids
            .iter()
            .filter_map(|id| tables.members.get(id).cloned())
            .collect())
    }

    async fn add_project(
        &self,
        new_project: &NewProject,
        dt: &DateTime<Utc>,
    ) -> Result<ProjectId, storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        if let Some(team) = new_project.team_id {
            if tables.projects.values().any(|p| p.team_id == Some(team)) {
                return ProjectExistsSnafu { team }.fail();
            }
        }
        tables.next_project += 1;
        let id = ProjectId::from_raw(tables.next_project);
        tables.projects.insert(
            id,
            Project {
                id,
                team_id: new_project.team_id,
                title: new_project.title.clone(),
                introduction: new_project.introduction.clone(),
                detailed_description: new_project.detailed_description.clone(),
                representative_image_url: new_project.representative_image_url.clone(),
                deployment_url: new_project.deployment_url.clone(),
                github_url: new_project.github_url.clone(),
                tags: new_project.tags.clone(),
                created_at: *dt,
                modified_at: *dt,
            },
        );
        tables.ranking_touched_at = Some(*dt);
        Ok(id)
    }
    async fn projects_by_ids(&self, ids: &[ProjectId]) -> Result<Vec<Project>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(ids
            .iter()
            .filter_map(|id| tables.projects.get(id).cloned())
            .collect())
    }
    async fn projects_with_teams(
        &self,
    ) -> Result<Vec<(Project, Option<Team>)>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .projects
            .values()
            .map(|project| {
                let team = project
                    .team_id
                    .and_then(|id| tables.teams.get(&id).cloned());
                (project.clone(), team)
            })
            .collect())
    }
    async fn project_for_team(&self, team: &TeamId) -> Result<Option<ProjectId>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .projects
            .values()
            .find(|p| p.team_id == Some(*team))
            .map(|p| p.id))
    }
    async fn ranking_inputs_changed_after(
        &self,
        dt: &DateTime<Utc>,
    ) -> Result<bool, storage::Error> {
        Ok(self
            .tables
            .read()
            .unwrap(/* poisoning is fatal */)
            .ranking_touched_at
            .is_some_and(|touched| touched > *dt))
    }
    async fn latest_projects(
        &self,
        anchor: &Option<TimeAnchor<ProjectId>>,
        limit: usize,
    ) -> Result<Vec<Project>, storage::Error> {
        let rows = {
            let tables = self.tables.read().unwrap(/* poisoning is fatal */);
            tables.projects.values().cloned().collect::<Vec<Project>>()
        };
        Ok(keyset_slice(rows, &ProjectRecency, anchor, limit))
    }

    async fn add_comment(
        &self,
        project: &ProjectId,
        author: &MemberId,
        content: &str,
        dt: &DateTime<Utc>,
    ) -> Result<CommentId, storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        if !tables.projects.contains_key(project) {
            return UnknownProjectSnafu { id: *project }.fail();
        }
        tables.next_comment += 1;
        let id = CommentId::from_raw(tables.next_comment);
        tables.comments.insert(
            id,
            Comment {
                id,
                project_id: *project,
                author_id: *author,
                content: content.to_owned(),
                created_at: *dt,
                modified_at: *dt,
            },
        );
        Ok(id)
    }
    async fn comments_for_project(
        &self,
        project: &ProjectId,
        anchor: &Option<TimeAnchor<CommentId>>,
        limit: usize,
    ) -> Result<Vec<Comment>, storage::Error> {
        let rows = {
            let tables = self.tables.read().unwrap(/* poisoning is fatal */);
            tables
                .comments
                .values()
                .filter(|c| c.project_id == *project)
                .cloned()
                .collect::<Vec<Comment>>()
        };
        Ok(keyset_slice(rows, &CommentRecency, anchor, limit))
    }
    async fn comment_counts(
        &self,
        ids: &[ProjectId],
    ) -> Result<HashMap<ProjectId, u64>, storage::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        let mut counts: HashMap<ProjectId, u64> = HashMap::new();
        for comment in tables.comments.values() {
            if ids.contains(&comment.project_id) {
                *counts.entry(comment.project_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn record_badge(
        &self,
        giver: &TeamId,
        receiver: &TeamId,
        dt: &DateTime<Utc>,
    ) -> Result<BadgeStatId, storage::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        for id in [giver, receiver] {
            if !tables.teams.contains_key(id) {
                return UnknownTeamSnafu { id: *id }.fail();
            }
        }
        match tables.badge_index.get(&(*receiver, *giver)).copied() {
            Some(id) => {
                let stat = tables.badges.get_mut(&id).unwrap(/* indexed */);
                stat.acquired_count += 1;
                stat.modified_at = *dt;
                Ok(id)
            }
            None => {
                tables.next_badge += 1;
                let id = BadgeStatId::from_raw(tables.next_badge);
                tables.badges.insert(
                    id,
                    BadgeStat {
                        id,
                        giver_team_id: *giver,
                        receiver_team_id: *receiver,
                        acquired_count: 1,
                        created_at: *dt,
                        modified_at: *dt,
                    },
                );
                tables.badge_index.insert((*receiver, *giver), id);
                Ok(id)
            }
        }
    }
    async fn badges_for_team(
        &self,
        receiver: &TeamId,
        anchor: &Option<CountAnchor<BadgeStatId>>,
        limit: usize,
    ) -> Result<Vec<BadgeStat>, storage::Error> {
        let rows = {
            let tables = self.tables.read().unwrap(/* poisoning is fatal */);
            tables
                .badges
                .values()
                .filter(|b| b.receiver_team_id == *receiver)
                .cloned()
                .collect::<Vec<BadgeStat>>()
        };
        Ok(keyset_slice(rows, &BadgeAcquisition, anchor, limit))
    }
}

#[async_trait]
impl snapshot::Store for Memory {
    async fn append(
        &self,
        ranking_data: String,
        requested_at: DateTime<Utc>,
    ) -> Result<SnapshotId, snapshot::Error> {
        let mut tables = self.tables.write().unwrap(/* poisoning is fatal */);
        tables.next_snapshot += 1;
        let id = SnapshotId::from_raw(tables.next_snapshot);
        tables.snapshots.insert(
            id,
            RankingSnapshot {
                id,
                ranking_data,
                requested_at,
            },
        );
        Ok(id)
    }
    async fn find(&self, id: &SnapshotId) -> Result<Option<RankingSnapshot>, snapshot::Error> {
        Ok(self.tables.read().unwrap(/* poisoning is fatal */).snapshots.get(id).cloned())
    }
    async fn find_latest(&self) -> Result<Option<RankingSnapshot>, snapshot::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .snapshots
            .values()
            .max_by_key(|s| (s.requested_at, s.id))
            .cloned())
    }
    async fn find_latest_since(
        &self,
        threshold: &DateTime<Utc>,
    ) -> Result<Option<RankingSnapshot>, snapshot::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .snapshots
            .values()
            .filter(|s| s.requested_at > *threshold)
            .max_by_key(|s| (s.requested_at, s.id))
            .cloned())
    }
    async fn find_latest_before(
        &self,
        when: &DateTime<Utc>,
    ) -> Result<Option<RankingSnapshot>, snapshot::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .snapshots
            .values()
            .filter(|s| s.requested_at < *when)
            .max_by_key(|s| (s.requested_at, s.id))
            .cloned())
    }
    async fn find_all_between(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<RankingSnapshot>, snapshot::Error> {
        let tables = self.tables.read().unwrap(/* poisoning is fatal */);
        Ok(tables
            .snapshots
            .values()
            .filter(|s| s.requested_at >= *start && s.requested_at < *end)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LockProvider for Memory {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        hold: Duration,
    ) -> Result<bool, LockError> {
        let semaphore = {
            let mut locks = self.locks.lock().unwrap(/* poisoning is fatal */);
            locks
                .semaphores
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Err(_elapsed) => Ok(false),
            Ok(Err(err)) => Err(LockError::new(err)),
            Ok(Ok(permit)) => {
                // Lease semantics: if the holder dies without unlocking, the permit is dropped
                // after `hold` & the lock frees itself.
                let expiry = tokio::spawn({
                    let locks = self.locks.clone();
                    let name = name.to_owned();
                    async move {
                        tokio::time::sleep(hold).await;
                        if locks.lock().unwrap(/* poisoning is fatal */).release(&name) {
                            debug!("lock {name} expired un-released");
                        }
                    }
                });
                self.locks
                    .lock()
                    .unwrap(/* poisoning is fatal */)
                    .held
                    .insert(name.to_owned(), Held { permit, expiry });
                Ok(true)
            }
        }
    }
    async fn unlock(&self, name: &str) -> Result<(), LockError> {
        // Unlocking a lock we don't hold (say, one that expired out from under us) is a no-op.
        self.locks.lock().unwrap(/* poisoning is fatal */).release(name);
        Ok(())
    }
}

#[cfg(test)]
mod check_locks {
    use super::*;

    #[tokio::test]
    async fn mutual_exclusion() {
        let memory = Memory::new();
        let wait = Duration::from_millis(50);
        let hold = Duration::from_secs(30);

        assert!(memory.try_lock("l", wait, hold).await.unwrap());
        // Second acquisition times-out...
        assert!(!memory.try_lock("l", wait, hold).await.unwrap());
        // ...until the holder lets go.
        memory.unlock("l").await.unwrap();
        assert!(memory.try_lock("l", wait, hold).await.unwrap());
        memory.unlock("l").await.unwrap();
    }

    #[tokio::test]
    async fn lease_expiry() {
        let memory = Memory::new();
        assert!(memory
            .try_lock("l", Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap());
        // Don't unlock; the lease expires & the lock frees itself.
        assert!(memory
            .try_lock("l", Duration::from_millis(500), Duration::from_secs(30))
            .await
            .unwrap());
        memory.unlock("l").await.unwrap();
    }

    #[tokio::test]
    async fn distinct_names_dont_contend() {
        let memory = Memory::new();
        let wait = Duration::from_millis(10);
        let hold = Duration::from_secs(30);
        assert!(memory.try_lock("a", wait, hold).await.unwrap());
        assert!(memory.try_lock("b", wait, hold).await.unwrap());
    }
}

#[cfg(test)]
mod check_tables {
    use super::*;

    use chrono::TimeZone;

    use crate::{entities::ProjectTitle, storage::Backend};

    fn new_project(team: Option<TeamId>) -> NewProject {
        NewProject {
            team_id: team,
            title: ProjectTitle::new("p").unwrap(/* known good */),
            introduction: None,
            detailed_description: None,
            representative_image_url: None,
            deployment_url: None,
            github_url: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn one_project_per_team() {
        let memory = Memory::new();
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        let team = memory.add_team(1, 1, &t0).await.unwrap();
        memory.add_project(&new_project(Some(team)), &t0).await.unwrap();
        assert!(matches!(
            memory.add_project(&new_project(Some(team)), &t0).await,
            Err(storage::Error::ProjectExists { .. })
        ));
        // Teamless projects don't collide with anything.
        memory.add_project(&new_project(None), &t0).await.unwrap();
        memory.add_project(&new_project(None), &t0).await.unwrap();
    }

    #[tokio::test]
    async fn ranking_inputs() {
        let memory = Memory::new();
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(1);
        let team = memory.add_team(1, 1, &t0).await.unwrap();
        memory.add_project(&new_project(Some(team)), &t0).await.unwrap();

        assert!(!memory.ranking_inputs_changed_after(&t0).await.unwrap());
        memory.add_given_plaudits(&team, 3, &t1).await.unwrap();
        assert!(memory.ranking_inputs_changed_after(&t0).await.unwrap());
        assert!(!memory.ranking_inputs_changed_after(&t1).await.unwrap());
    }

    #[tokio::test]
    async fn badge_upserts() {
        let memory = Memory::new();
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        let giver = memory.add_team(1, 1, &t0).await.unwrap();
        let receiver = memory.add_team(1, 2, &t0).await.unwrap();

        let first = memory.record_badge(&giver, &receiver, &t0).await.unwrap();
        let second = memory.record_badge(&giver, &receiver, &t0).await.unwrap();
        assert_eq!(first, second);

        let stats = memory
            .badges_for_team(&receiver, &None, 10)
            .await
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].acquired_count, 2);
    }
}
