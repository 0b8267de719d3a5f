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

//! # Project listings
//!
//! ## Introduction
//!
//! Two ways to browse projects, plus the snapshot API itself:
//!
//! - `/projects/ranking`: pages through an immutable ranking snapshot. The interesting part is
//!   bridging the snapshot's flat, already-ranked list with the cursor contract used everywhere
//!   else: the cursor carries the last-seen project id, position is recovered by scanning the
//!   snapshot (it's small & already in memory-- no index needed), and entities are hydrated from
//!   the live store *in snapshot order*.
//! - `/projects/latest`: an ordinary time-strategy keyset page over the live table.
//! - `/projects/ranking/snapshots[/latest|/weekly]`: registration & reporting views over the
//!   [coordinator](crate::coordinator).
//!
//! A note on the ranking page & staleness: if a client hands us a cursor minted against snapshot
//! A along with the context of snapshot B (say, A rotated out from under a long-lived tab), the
//! cursor's project may not appear in B at all. We restart from the top of B rather than
//! erroring-- the client is paging a leaderboard, not auditing it.

use std::{cmp::min, collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    coordinator::{self, SnapshotView},
    counter_add,
    entities::{Project, ProjectId, ProjectTitle, SnapshotId, TeamId},
    http::{ErrorResponseBody, Plaudit},
    metrics::{self, Sort},
    paging::{self, fetch_page, ProjectRecency, RankCursor, TimeAnchor},
    ranking::{self, RankingEntry},
    snapshot, storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The supplied cursor is invalid: {source}"))]
    BadCursor { source: paging::Error },
    #[snafu(display("{source}"))]
    BadPageSize { source: paging::Error },
    #[snafu(display("While coordinating the ranking snapshot, {source}"))]
    Coordination { source: coordinator::Error },
    #[snafu(display("Snapshot {id} holds corrupt ranking data: {source}"))]
    Corrupt {
        id: SnapshotId,
        source: ranking::Error,
    },
    #[snafu(display("No snapshot with id {id}"))]
    SnapshotNotFound {
        id: SnapshotId,
        backtrace: Backtrace,
    },
    #[snafu(display("While reading from the snapshot store, {source}"))]
    Snapshots { source: snapshot::Error },
    #[snafu(display("While reading from the backing store, {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("While signing the next-page cursor, {source}"))]
    TokenSign { source: paging::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            // Broken requests-- tell the caller how to fix it
            Error::BadCursor { source } => (StatusCode::BAD_REQUEST, format!("{source}")),
            Error::BadPageSize { source } => (StatusCode::BAD_REQUEST, format!("{source}")),
            Error::SnapshotNotFound { id, .. } => {
                (StatusCode::NOT_FOUND, format!("No snapshot with id {id}"))
            }
            // Contention is retryable; say so
            Error::Coordination { source } if source.is_retryable() => (
                StatusCode::SERVICE_UNAVAILABLE,
                "The ranking is being recomputed; try again shortly".to_string(),
            ),
            Error::Coordination {
                source: coordinator::Error::SnapshotNotFound { .. },
            } => (StatusCode::NOT_FOUND, "No ranking snapshot exists".to_string()),
            // Internal failure-- own up to it
            Error::Coordination { source } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}"))
            }
            Error::Corrupt { id, source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Snapshot {id} holds corrupt ranking data: {source}"),
            ),
            Error::Snapshots { source } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}"))
            }
            Error::Storage { source } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}"))
            }
            Error::TokenSign { source } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}"))
            }
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         project cards                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A project as it appears in any listing: the project row joined with its team's live counts &
/// its comment tally
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectCard {
    pub id: ProjectId,
    pub team_id: Option<TeamId>,
    pub term: Option<u32>,
    pub team_number: Option<u32>,
    pub title: ProjectTitle,
    pub introduction: Option<String>,
    pub representative_image_url: Option<Url>,
    pub tags: Vec<String>,
    pub comment_count: u64,
    pub given_plaudit_count: Option<u64>,
    pub received_plaudit_count: Option<u64>,
    pub badge_image_url: Option<Url>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Hydrate cards for `projects`, preserving their order
///
/// Counts come from the *live* team rows: a ranking snapshot freezes the order, not the numbers
/// on display.
async fn build_cards(
    storage: &(dyn storage::Backend + Send + Sync),
    projects: Vec<Project>,
) -> std::result::Result<Vec<ProjectCard>, storage::Error> {
    let project_ids = projects.iter().map(|p| p.id).collect::<Vec<ProjectId>>();
    let team_ids = projects
        .iter()
        .filter_map(|p| p.team_id)
        .collect::<Vec<TeamId>>();

    let comment_counts = storage.comment_counts(&project_ids).await?;
    let teams = storage
        .teams_by_ids(&team_ids)
        .await?
        .into_iter()
        .map(|team| (team.id, team))
        .collect::<HashMap<TeamId, _>>();

    Ok(projects
        .into_iter()
        .map(|project| {
            let team = project.team_id.and_then(|id| teams.get(&id));
            ProjectCard {
                id: project.id,
                team_id: project.team_id,
                term: team.map(|t| t.term),
                team_number: team.map(|t| t.number),
                title: project.title,
                introduction: project.introduction,
                representative_image_url: project.representative_image_url,
                tags: project.tags,
                comment_count: comment_counts.get(&project.id).copied().unwrap_or(0),
                given_plaudit_count: team.map(|t| t.given_plaudit_count),
                received_plaudit_count: team.map(|t| t.received_plaudit_count),
                badge_image_url: team.and_then(|t| t.badge_image_url.clone()),
                created_at: project.created_at,
                modified_at: project.modified_at,
            }
        })
        .collect())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the ranking page                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One page of the ranking, plus the context every caller needs to stay on the same snapshot
#[derive(Clone, Debug)]
pub struct RankingPage {
    /// The snapshot actually served; clients pass this back to keep paging the same ranking
    pub context_id: SnapshotId,
    pub items: Vec<ProjectCard>,
    pub next: Option<RankCursor>,
    pub has_next: bool,
}

/// Serve one page of the ranking
///
/// `context` names the snapshot to page through; absent (or non-positive, which no store ever
/// assigns), we fall back to [`register`](crate::coordinator::Coordinator::register), which
/// always yields a resolvable id. An explicit-but-unknown context is the caller's mistake:
/// [`Error::SnapshotNotFound`].
pub async fn ranking_page(
    state: &Plaudit,
    context: Option<SnapshotId>,
    cursor: Option<RankCursor>,
    page_size: paging::PageSize,
) -> Result<RankingPage> {
    let context = match context.filter(SnapshotId::is_positive) {
        Some(id) => id,
        None => {
            debug!("Invalid or missing snapshot context; registering");
            state
                .coordinator
                .register()
                .await
                .context(CoordinationSnafu)?
        }
    };

    let snap = state
        .snapshots
        .find(&context)
        .await
        .context(SnapshotsSnafu)?
        .context(SnapshotNotFoundSnafu { id: context })?;
    let entries = ranking::parse(&snap.ranking_data).context(CorruptSnafu { id: context })?;

    // Position is one past the cursor's entry; a cursor that names no entry (minted against a
    // rotated snapshot) restarts from the top.
    let start = match cursor {
        Some(cursor) => entries
            .iter()
            .position(|e| e.project_id == cursor.id)
            .map(|i| i + 1)
            .unwrap_or_else(|| {
                warn!(
                    "Cursor {} names no entry in snapshot {context}; restarting from the top",
                    cursor.id
                );
                0
            }),
        None => 0,
    };
    let end = min(start + page_size.get(), entries.len());
    let window: &[RankingEntry] = &entries[start..end];
    let has_next = end < entries.len();
    let next = if has_next {
        window.last().map(|e| RankCursor { id: e.project_id })
    } else {
        None
    };

    let ids = window.iter().map(|e| e.project_id).collect::<Vec<ProjectId>>();
    let mut projects = state
        .storage
        .projects_by_ids(&ids)
        .await
        .context(StorageSnafu)?;
    // The live store returns rows in its own order; the snapshot's is the one that counts.
    projects.sort_by_key(|p| {
        ids.iter()
            .position(|id| *id == p.id)
            .unwrap_or(usize::MAX)
    });
    let items = build_cards(state.storage.as_ref(), projects)
        .await
        .context(StorageSnafu)?;

    Ok(RankingPage {
        context_id: context,
        items,
        next,
        has_next,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the latest page                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One time-ordered page of projects
#[derive(Clone, Debug)]
pub struct LatestPage {
    pub items: Vec<ProjectCard>,
    pub next: Option<TimeAnchor<ProjectId>>,
    pub has_next: bool,
}

/// Serve one newest-first page of projects from the live table
pub async fn latest_page(
    state: &Plaudit,
    cursor: Option<TimeAnchor<ProjectId>>,
    page_size: paging::PageSize,
) -> Result<LatestPage> {
    let storage = state.storage.clone();
    let page = fetch_page(&ProjectRecency, cursor, page_size, |anchor, limit| {
        let storage = storage.clone();
        async move { storage.latest_projects(&anchor, limit).await }
    })
    .await
    .context(StorageSnafu)?;

    let items = build_cards(state.storage.as_ref(), page.items)
        .await
        .context(StorageSnafu)?;
    Ok(LatestPage {
        items,
        next: page.next,
        has_next: page.has_next,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("projects.ranking.pages", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("projects.ranking.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("projects.latest.pages", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("projects.latest.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("snapshots.api.registrations", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("snapshots.api.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct RankingQuery {
    #[serde(rename = "context-id")]
    context_id: Option<i64>,
    cursor: Option<String>,
    #[serde(rename = "page-size")]
    page_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct RankingMeta {
    context_id: SnapshotId,
    next_cursor: Option<String>,
    has_next: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct PageRsp<T, M> {
    data: Vec<T>,
    meta: M,
}

fn page_size_from(query: Option<usize>, state: &Plaudit) -> Result<paging::PageSize> {
    match query {
        Some(size) => paging::PageSize::new(size).context(BadPageSizeSnafu),
        None => Ok(state.default_page_size),
    }
}

/// GET `/projects/ranking`: one page of the current (or named) ranking snapshot
async fn ranking(
    State(state): State<Arc<Plaudit>>,
    Query(query): Query<RankingQuery>,
) -> axum::response::Response {
    async fn ranking1(
        state: &Plaudit,
        query: RankingQuery,
    ) -> Result<PageRsp<ProjectCard, RankingMeta>> {
        let page_size = page_size_from(query.page_size, state)?;
        let cursor = query
            .cursor
            .map(|token| paging::verify_token::<RankCursor>(&token, &state.token_key))
            .transpose()
            .context(BadCursorSnafu)?;
        let page = ranking_page(
            state,
            query.context_id.map(SnapshotId::from_raw),
            cursor,
            page_size,
        )
        .await?;
        let next_cursor = page
            .next
            .map(|cursor| paging::sign_token(&cursor, &state.token_key))
            .transpose()
            .context(TokenSignSnafu)?;
        Ok(PageRsp {
            data: page.items,
            meta: RankingMeta {
                context_id: page.context_id,
                next_cursor,
                has_next: page.has_next,
            },
        })
    }

    match ranking1(&state, query).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "projects.ranking.pages", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "projects.ranking.failures", 1, &[]);
            err.into_response()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct LatestQuery {
    cursor: Option<String>,
    #[serde(rename = "page-size")]
    page_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct TimeMeta {
    next_cursor: Option<String>,
    has_next: bool,
}

/// GET `/projects/latest`: one newest-first page of projects
async fn latest(
    State(state): State<Arc<Plaudit>>,
    Query(query): Query<LatestQuery>,
) -> axum::response::Response {
    async fn latest1(
        state: &Plaudit,
        query: LatestQuery,
    ) -> Result<PageRsp<ProjectCard, TimeMeta>> {
        let page_size = page_size_from(query.page_size, state)?;
        let cursor = query
            .cursor
            .map(|token| {
                paging::verify_token::<TimeAnchor<ProjectId>>(&token, &state.token_key)
            })
            .transpose()
            .context(BadCursorSnafu)?;
        let page = latest_page(state, cursor, page_size).await?;
        let next_cursor = page
            .next
            .map(|cursor| paging::sign_token(&cursor, &state.token_key))
            .transpose()
            .context(TokenSignSnafu)?;
        Ok(PageRsp {
            data: page.items,
            meta: TimeMeta {
                next_cursor,
                has_next: page.has_next,
            },
        })
    }

    match latest1(&state, query).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "projects.latest.pages", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "projects.latest.failures", 1, &[]);
            err.into_response()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct RegisterRsp {
    id: SnapshotId,
}

/// POST `/projects/ranking/snapshots`: ensure a fresh snapshot exists; 201 with its id
async fn register_snapshot(State(state): State<Arc<Plaudit>>) -> axum::response::Response {
    match state.coordinator.register().await.context(CoordinationSnafu) {
        Ok(id) => {
            counter_add!(state.instruments, "snapshots.api.registrations", 1, &[]);
            (StatusCode::CREATED, Json(RegisterRsp { id })).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "snapshots.api.failures", 1, &[]);
            err.into_response()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SnapshotRsp {
    id: SnapshotId,
    requested_at: DateTime<Utc>,
    projects: Vec<RankingEntry>,
}

impl From<SnapshotView> for SnapshotRsp {
    fn from(view: SnapshotView) -> SnapshotRsp {
        SnapshotRsp {
            id: view.id,
            requested_at: view.requested_at,
            projects: view.entries,
        }
    }
}

/// GET `/projects/ranking/snapshots/latest`
async fn latest_snapshot(State(state): State<Arc<Plaudit>>) -> axum::response::Response {
    match state.coordinator.latest().await.context(CoordinationSnafu) {
        Ok(view) => (StatusCode::OK, Json(SnapshotRsp::from(view))).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "snapshots.api.failures", 1, &[]);
            err.into_response()
        }
    }
}

/// GET `/projects/ranking/snapshots/weekly`: seven days of snapshots, oldest first, nulls where
/// nothing was ever known
async fn weekly_snapshots(State(state): State<Arc<Plaudit>>) -> axum::response::Response {
    match state
        .coordinator
        .last_seven_days()
        .await
        .context(CoordinationSnafu)
    {
        Ok(views) => (
            StatusCode::OK,
            Json(
                views
                    .into_iter()
                    .map(|view| view.map(SnapshotRsp::from))
                    .collect::<Vec<Option<SnapshotRsp>>>(),
            ),
        )
            .into_response(),
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "snapshots.api.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the project-listing & snapshot APIs
///
/// The returned [Router] will presumably be merged with other routers.
pub fn make_router(state: Arc<Plaudit>) -> Router<Arc<Plaudit>> {
    Router::new()
        .route("/projects/ranking", get(ranking))
        .route("/projects/latest", get(latest))
        .route("/projects/ranking/snapshots", post(register_snapshot))
        .route("/projects/ranking/snapshots/latest", get(latest_snapshot))
        .route("/projects/ranking/snapshots/weekly", get(weekly_snapshots))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
