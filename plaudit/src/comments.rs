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

//! # Comment listings
//!
//! A project's comments, newest first, through the standard keyset cursor contract (time
//! strategy). Nothing clever here-- which is the point: the comments listing pages against the
//! live table under concurrent writes & stays gap- and duplicate-free purely on the strength of
//! the keyset predicate.

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
    entities::{CommentId, MemberId, ProjectId},
    http::{ErrorResponseBody, Plaudit},
    metrics::{self, Sort},
    paging::{self, fetch_page, CommentRecency, TimeAnchor},
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
//                                          comment cards                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A comment's author, as displayed alongside it
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Author {
    pub id: MemberId,
    pub name: String,
    pub nickname: Option<String>,
    pub profile_image_url: Option<Url>,
}

/// A comment as it appears in a listing
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommentCard {
    pub id: CommentId,
    pub project_id: ProjectId,
    /// None if the author's member row has since gone away
    pub author: Option<Author>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One time-ordered page of a project's comments
#[derive(Clone, Debug)]
pub struct CommentPage {
    pub items: Vec<CommentCard>,
    pub next: Option<TimeAnchor<CommentId>>,
    pub has_next: bool,
}

/// Serve one newest-first page of `project`'s comments
pub async fn comment_page(
    state: &Plaudit,
    project: &ProjectId,
    cursor: Option<TimeAnchor<CommentId>>,
    page_size: paging::PageSize,
) -> Result<CommentPage> {
    let storage = state.storage.clone();
    let project = *project;
    let page = fetch_page(&CommentRecency, cursor, page_size, |anchor, limit| {
        let storage = storage.clone();
        async move { storage.comments_for_project(&project, &anchor, limit).await }
    })
    .await
    .context(StorageSnafu)?;

    let author_ids = page
        .items
        .iter()
        .map(|c| c.author_id)
        .collect::<Vec<MemberId>>();
    let authors = state
        .storage
        .members_by_ids(&author_ids)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .map(|member| (member.id, member))
        .collect::<HashMap<MemberId, _>>();

    let items = page
        .items
        .into_iter()
        .map(|comment| CommentCard {
            id: comment.id,
            project_id: comment.project_id,
            author: authors.get(&comment.author_id).map(|member| Author {
                id: member.id,
                name: member.name.clone(),
                nickname: member.nickname.clone(),
                profile_image_url: member.profile_image_url.clone(),
            }),
            content: comment.content,
            created_at: comment.created_at,
            modified_at: comment.modified_at,
        })
        .collect();

    Ok(CommentPage {
        items,
        next: page.next,
        has_next: page.has_next,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("comments.pages", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("comments.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct CommentsQuery {
    cursor: Option<String>,
    #[serde(rename = "page-size")]
    page_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct CommentsMeta {
    next_cursor: Option<String>,
    has_next: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CommentsRsp {
    data: Vec<CommentCard>,
    meta: CommentsMeta,
}

/// GET `/projects/{project_id}/comments`
async fn comments(
    State(state): State<Arc<Plaudit>>,
    Path(project_id): Path<i64>,
    Query(query): Query<CommentsQuery>,
) -> axum::response::Response {
    async fn comments1(
        state: &Plaudit,
        project_id: i64,
        query: CommentsQuery,
    ) -> Result<CommentsRsp> {
        let page_size = match query.page_size {
            Some(size) => paging::PageSize::new(size).context(BadPageSizeSnafu)?,
            None => state.default_page_size,
        };
        let cursor = query
            .cursor
            .map(|token| {
                paging::verify_token::<TimeAnchor<CommentId>>(&token, &state.token_key)
            })
            .transpose()
            .context(BadCursorSnafu)?;
        let page = comment_page(
            state,
            &ProjectId::from_raw(project_id),
            cursor,
            page_size,
        )
        .await?;
        let next_cursor = page
            .next
            .map(|cursor| paging::sign_token(&cursor, &state.token_key))
            .transpose()
            .context(TokenSignSnafu)?;
        Ok(CommentsRsp {
            data: page.items,
            meta: CommentsMeta {
                next_cursor,
                has_next: page.has_next,
            },
        })
    }

    match comments1(&state, project_id, query).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "comments.pages", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "comments.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the comments API
pub fn make_router(state: Arc<Plaudit>) -> Router<Arc<Plaudit>> {
    Router::new()
        .route("/projects/{project_id}/comments", get(comments))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
