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

//! # Badge listings
//!
//! The badges a team has amassed, most-acquired first-- the keyset engine's *count* strategy.
//! Counts collide constantly (every team with a single badge from some giver ties at 1), which is
//! exactly what the `(count, id)` compound cursor exists for: the id tie-break keeps pages stable
//! & walks duplicate-free even when a whole page shares one count.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::error;
use url::Url;

use crate::{
    counter_add,
    entities::{BadgeStatId, ProjectId, TeamId},
    http::{ErrorResponseBody, Plaudit},
    metrics::{self, Sort},
    paging::{self, fetch_page, BadgeAcquisition, CountAnchor},
    storage,
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
    #[snafu(display("While reading from the backing store, {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("While signing the next-page cursor, {source}"))]
    TokenSign { source: paging::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadCursor { source } => (StatusCode::BAD_REQUEST, format!("{source}")),
            Error::BadPageSize { source } => (StatusCode::BAD_REQUEST, format!("{source}")),
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
//                                           badge cards                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One giver's badge tally, hydrated with enough of the giver team to render it
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BadgeCard {
    pub id: BadgeStatId,
    pub giver_team_id: TeamId,
    pub giver_term: Option<u32>,
    pub giver_team_number: Option<u32>,
    /// The giver team's showcased project, for click-through
    pub project_id: Option<ProjectId>,
    pub badge_image_url: Option<Url>,
    pub acquired_count: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One count-ordered page of a team's badges
#[derive(Clone, Debug)]
pub struct BadgePage {
    pub items: Vec<BadgeCard>,
    pub next: Option<CountAnchor<BadgeStatId>>,
    pub has_next: bool,
}

/// Serve one most-acquired-first page of the badges `team` has received
pub async fn badge_page(
    state: &Plaudit,
    team: &TeamId,
    cursor: Option<CountAnchor<BadgeStatId>>,
    page_size: paging::PageSize,
) -> Result<BadgePage> {
    let storage = state.storage.clone();
    let team = *team;
    let page = fetch_page(&BadgeAcquisition, cursor, page_size, |anchor, limit| {
        let storage = storage.clone();
        async move { storage.badges_for_team(&team, &anchor, limit).await }
    })
    .await
    .context(StorageSnafu)?;

    let giver_ids = page
        .items
        .iter()
        .map(|b| b.giver_team_id)
        .collect::<Vec<TeamId>>();
    let givers = state
        .storage
        .teams_by_ids(&giver_ids)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .map(|team| (team.id, team))
        .collect::<HashMap<TeamId, _>>();

    let mut items = Vec::with_capacity(page.items.len());
    for stat in page.items {
        let giver = givers.get(&stat.giver_team_id);
        let project_id = state
            .storage
            .project_for_team(&stat.giver_team_id)
            .await
            .context(StorageSnafu)?;
        items.push(BadgeCard {
            id: stat.id,
            giver_team_id: stat.giver_team_id,
            giver_term: giver.map(|t| t.term),
            giver_team_number: giver.map(|t| t.number),
            project_id,
            badge_image_url: giver.and_then(|t| t.badge_image_url.clone()),
            acquired_count: stat.acquired_count,
            created_at: stat.created_at,
            modified_at: stat.modified_at,
        });
    }

    Ok(BadgePage {
        items,
        next: page.next,
        has_next: page.has_next,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("badges.pages", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("badges.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct BadgesQuery {
    cursor: Option<String>,
    #[serde(rename = "page-size")]
    page_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct BadgesMeta {
    next_cursor: Option<String>,
    has_next: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct BadgesRsp {
    data: Vec<BadgeCard>,
    meta: BadgesMeta,
}

/// GET `/teams/{team_id}/badges`
async fn badges(
    State(state): State<Arc<Plaudit>>,
    Path(team_id): Path<i64>,
    Query(query): Query<BadgesQuery>,
) -> axum::response::Response {
    async fn badges1(state: &Plaudit, team_id: i64, query: BadgesQuery) -> Result<BadgesRsp> {
        let page_size = match query.page_size {
            Some(size) => paging::PageSize::new(size).context(BadPageSizeSnafu)?,
            None => state.default_page_size,
        };
        let cursor = query
            .cursor
            .map(|token| {
                paging::verify_token::<CountAnchor<BadgeStatId>>(&token, &state.token_key)
            })
            .transpose()
            .context(BadCursorSnafu)?;
        let page = badge_page(state, &TeamId::from_raw(team_id), cursor, page_size).await?;
        let next_cursor = page
            .next
            .map(|cursor| paging::sign_token(&cursor, &state.token_key))
            .transpose()
            .context(TokenSignSnafu)?;
        Ok(BadgesRsp {
            data: page.items,
            meta: BadgesMeta {
                next_cursor,
                has_next: page.has_next,
            },
        })
    }

    match badges1(&state, team_id, query).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "badges.pages", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "badges.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the badges API
pub fn make_router(state: Arc<Plaudit>) -> Router<Arc<Plaudit>> {
    Router::new()
        .route("/teams/{team_id}/badges", get(badges))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
