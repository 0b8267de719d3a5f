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

//! # The plaudit integration tests
//!
//! ## Introduction
//!
//! The properties that matter most in plaudit-- one snapshot per freshness window under a stampede
//! of callers, duplicate- and gap-free pagination walks under concurrent writes-- only show up
//! when the whole stack is wired together. The tests under `tests/` do exactly that, against the
//! bundled in-memory backend; no external fixture (database, lock service) is required, so they
//! run under the stock `cargo test` harness.
//!
//! Code applicable to all the integration tests (state assembly, seed data) belongs here.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use plaudit::{
    coordinator::{Config, Coordinator},
    entities::{ProjectId, ProjectTitle, TeamId},
    http::Plaudit,
    memory::Memory,
    metrics::Instruments,
    paging::PageSize,
    storage::{Backend, NewProject},
    util::Key,
};

/// The key under which all test tokens are signed
pub fn token_key() -> Key {
    Key::from(b"plaudit-test-pagination-token-key".to_vec())
}

/// Assemble application state around `memory`
pub fn make_state(memory: &Memory, config: Config) -> Plaudit {
    let memory = Arc::new(memory.clone());
    let instruments = Arc::new(Instruments::new("plaudit"));
    let coordinator = Coordinator::new(
        memory.clone(),
        memory.clone(),
        memory.clone(),
        config,
        instruments.clone(),
    );
    Plaudit {
        storage: memory.clone(),
        snapshots: memory,
        coordinator,
        token_key: token_key(),
        default_page_size: PageSize::new(12).unwrap(/* known good */),
        instruments,
    }
}

/// Seed one team & its showcased project; returns both ids
pub async fn seed_team_with_project(
    memory: &Memory,
    term: u32,
    number: u32,
    given: u64,
    received: u64,
    at: &DateTime<Utc>,
) -> (TeamId, ProjectId) {
    let team = memory.add_team(term, number, at).await.unwrap();
    if given > 0 {
        memory.add_given_plaudits(&team, given, at).await.unwrap();
    }
    if received > 0 {
        memory
            .add_received_plaudits(&team, received, at)
            .await
            .unwrap();
    }
    let project = memory
        .add_project(
            &NewProject {
                team_id: Some(team),
                title: ProjectTitle::new(&format!("team {term}-{number}")).unwrap(/* known good */),
                introduction: None,
                detailed_description: None,
                representative_image_url: None,
                deployment_url: None,
                github_url: None,
                tags: vec![],
            },
            at,
        )
        .await
        .unwrap();
    (team, project)
}

/// Seed a teamless project (ineligible for ranking)
pub async fn seed_teamless_project(memory: &Memory, at: &DateTime<Utc>) -> ProjectId {
    memory
        .add_project(
            &NewProject {
                team_id: None,
                title: ProjectTitle::new("orphan").unwrap(/* known good */),
                introduction: None,
                detailed_description: None,
                representative_image_url: None,
                deployment_url: None,
                github_url: None,
                tags: vec![],
            },
            at,
        )
        .await
        .unwrap()
}
