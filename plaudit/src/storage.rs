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

//! # storage
//!
//! Abstractions for the plaudit storage layer.
//!
//! The business entities live in a relational store that this crate treats as an external
//! collaborator; [Backend] is the narrow contract we consume. The listing methods
//! ([`latest_projects`], [`comments_for_project`], [`badges_for_team`]) take a keyset anchor & a
//! limit and must return rows already filtered & in descending `(key, id)` order-- a SQL backend
//! pushes that into WHERE/ORDER BY/LIMIT; the bundled in-memory backend evaluates
//! [`paging::keyset_slice`](crate::paging::keyset_slice). Mutators take their timestamps
//! explicitly, so imports & tests can backdate rows.
//!
//! [`latest_projects`]: Backend::latest_projects
//! [`comments_for_project`]: Backend::comments_for_project
//! [`badges_for_team`]: Backend::badges_for_team

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{prelude::*, Backtrace};
use url::Url;

use crate::{
    entities::{
        BadgeStat, BadgeStatId, Comment, CommentId, Member, MemberId, Project, ProjectId,
        ProjectTitle, Team, TeamId,
    },
    paging::{CountAnchor, TimeAnchor},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Generic error variant implementations can use to surface their own failures
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Team {team} already showcases a project"))]
    ProjectExists { team: TeamId, backtrace: Backtrace },
    #[snafu(display("No project with id {id}"))]
    UnknownProject {
        id: ProjectId,
        backtrace: Backtrace,
    },
    #[snafu(display("No team with id {id}"))]
    UnknownTeam { id: TeamId, backtrace: Backtrace },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

/// Everything needed to record a new project; the id & timestamps are the backend's to assign.
#[derive(Clone, Debug)]
pub struct NewProject {
    pub team_id: Option<TeamId>,
    pub title: ProjectTitle,
    pub introduction: Option<String>,
    pub detailed_description: Option<String>,
    pub representative_image_url: Option<Url>,
    pub deployment_url: Option<Url>,
    pub github_url: Option<Url>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait Backend {
    /// Create a team; return the id the store assigned.
    async fn add_team(&self, term: u32, number: u32, dt: &DateTime<Utc>)
        -> Result<TeamId, Error>;
    /// Retrieve a [Team] by id. None means there is no team by that id.
    async fn team(&self, id: &TeamId) -> Result<Option<Team>, Error>;
    /// Batch-get teams; rows come back in no particular order, absentees silently missing.
    async fn teams_by_ids(&self, ids: &[TeamId]) -> Result<Vec<Team>, Error>;
    /// Credit `id` with `amount` plaudits *given*; this is a ranking input, so it bumps the
    /// store's record of when ranking inputs last changed.
    async fn add_given_plaudits(
        &self,
        id: &TeamId,
        amount: u64,
        dt: &DateTime<Utc>,
    ) -> Result<(), Error>;
    /// Credit `id` with `amount` plaudits *received*.
    async fn add_received_plaudits(
        &self,
        id: &TeamId,
        amount: u64,
        dt: &DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Create a member (only what comment hydration needs).
    async fn add_member(
        &self,
        name: &str,
        nickname: Option<&str>,
        profile_image_url: Option<Url>,
        dt: &DateTime<Utc>,
    ) -> Result<MemberId, Error>;
    /// Batch-get members.
    async fn members_by_ids(&self, ids: &[MemberId]) -> Result<Vec<Member>, Error>;

    /// Create a project. At most one project per team; a second registration against the same
    /// team fails with [`Error::ProjectExists`].
    async fn add_project(
        &self,
        new_project: &NewProject,
        dt: &DateTime<Utc>,
    ) -> Result<ProjectId, Error>;
    /// Batch-get projects; callers wanting a particular order re-sort (see the ranking page's
    /// hydration step).
    async fn projects_by_ids(&self, ids: &[ProjectId]) -> Result<Vec<Project>, Error>;
    /// Every project paired with its team (None where the association is missing); the ranking
    /// computation's input.
    async fn projects_with_teams(&self) -> Result<Vec<(Project, Option<Team>)>, Error>;
    /// The project a team showcases, if any (there is at most one).
    async fn project_for_team(&self, team: &TeamId) -> Result<Option<ProjectId>, Error>;
    /// Has anything the ranking depends on (project creation, plaudit counts) changed strictly
    /// after `dt`? Deliberately coarse: *any* such write invalidates.
    async fn ranking_inputs_changed_after(&self, dt: &DateTime<Utc>) -> Result<bool, Error>;
    /// Projects newest-first from `anchor`, at most `limit` rows.
    async fn latest_projects(
        &self,
        anchor: &Option<TimeAnchor<ProjectId>>,
        limit: usize,
    ) -> Result<Vec<Project>, Error>;

    /// Leave a comment on a project.
    async fn add_comment(
        &self,
        project: &ProjectId,
        author: &MemberId,
        content: &str,
        dt: &DateTime<Utc>,
    ) -> Result<CommentId, Error>;
    /// A project's comments newest-first from `anchor`, at most `limit` rows.
    async fn comments_for_project(
        &self,
        project: &ProjectId,
        anchor: &Option<TimeAnchor<CommentId>>,
        limit: usize,
    ) -> Result<Vec<Comment>, Error>;
    /// Comment tallies for a batch of projects; projects with no comments may be absent from the
    /// result.
    async fn comment_counts(
        &self,
        ids: &[ProjectId],
    ) -> Result<HashMap<ProjectId, u64>, Error>;

    /// Record `giver` awarding its badge to `receiver` (upsert; increments the tally).
    async fn record_badge(
        &self,
        giver: &TeamId,
        receiver: &TeamId,
        dt: &DateTime<Utc>,
    ) -> Result<BadgeStatId, Error>;
    /// The badge tallies `receiver` has amassed, most-acquired first from `anchor`, at most
    /// `limit` rows.
    async fn badges_for_team(
        &self,
        receiver: &TeamId,
        anchor: &Option<CountAnchor<BadgeStatId>>,
        limit: usize,
    ) -> Result<Vec<BadgeStat>, Error>;
}
