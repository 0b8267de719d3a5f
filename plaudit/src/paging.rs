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

//! # Keyset Pagination
//!
//! ## Introduction
//!
//! Every list plaudit serves (latest projects, a project's comments, a team's badges, the ranking
//! itself) is paginated the same way: the client holds an opaque *cursor* naming the last row it
//! saw, and each request returns the next page after that row. We page by *keyset*, never by
//! offset: the cursor encodes the last row's sort-key value & id, and the next page is "rows
//! strictly less than that pair" in descending `(key, id)` order. Anchoring to values already
//! returned (rather than to a row count) is what makes a pagination walk immune to concurrent
//! inserts-- a row created mid-walk with a higher sort key than anything already paged simply
//! doesn't satisfy the predicate, so it can neither duplicate nor shift what the walk yields.
//!
//! ## The Model
//!
//! Two orderings cover all of our listings:
//!
//! 1. *time*: most-recent first (comments, latest projects); the secondary key is a creation
//!    timestamp
//! 2. *count*: highest-count first (badges); the secondary key is an integral tally
//!
//! In both, the row id breaks ties (ids are unique, so the ordering is total). Rather than
//! reaching for runtime reflection to read "the id" & "the sort key" off arbitrary rows, each
//! pageable collection supplies an [OrderStrategy]: a zero-sized type whose accessors are resolved
//! at compile time. The ranking page is the odd one out-- its order lives in an immutable
//! snapshot, not in any sortable column-- so its cursor ([RankCursor]) carries an id alone and is
//! resolved by scanning the snapshot (see [`projects`](crate::projects)).
//!
//! ## Tokens
//!
//! On the wire a cursor is `base64(hmac-sha-256(json)).json`. No state is kept server-side; the
//! MAC just keeps clients from handing us positions we never issued. Malformed or tampered tokens
//! are rejected up front, before any store access-- never silently coerced into "first page".

use std::future::Future;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use snafu::{prelude::*, Backtrace};

use crate::{
    entities::{BadgeStat, BadgeStatId, Comment, CommentId, Project, ProjectId},
    util::{exactly_two, Key},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While deserializing a cursor from JSON, {source}"))]
    AnchorDe {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While serializing a cursor to JSON, {source}"))]
    AnchorSer {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Page sizes must be between {} and {}; got {size}", PageSize::MIN, PageSize::MAX))]
    BadPageSize { size: usize, backtrace: Backtrace },
    #[snafu(display("When base64-decoding the token's HMAC, {source}"))]
    Base64De {
        token: String,
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad HMAC: {source}"))]
    Hmac {
        source: hmac::digest::MacError,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid key length for HMAC-SHA-256"))]
    KeyLength {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("{token} is not a valid pagination token"))]
    TokenFormat { token: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            PageSize                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing a page size; clamps nothing, rejects everything outside [1, 100]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageSize(usize);

impl PageSize {
    pub const MIN: usize = 1;
    pub const MAX: usize = 100;

    pub fn new(size: usize) -> Result<PageSize> {
        ((Self::MIN..=Self::MAX).contains(&size))
            .then_some(PageSize(size))
            .ok_or(BadPageSizeSnafu { size }.build())
    }
    pub fn get(&self) -> usize {
        self.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      cursors & strategies                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The keyset position after which the next page begins: the last-seen row's sort key & id.
///
/// The derived ascending [Ord] on pairs would be the wrong order for us (we serve most-recent /
/// highest-count first), so the descending comparisons live in [keyset_slice] and [admits] rather
/// than in an `Ord` impl that would surprise.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Anchor<K, I> {
    pub key: K,
    pub id: I,
}

/// Time-ordered cursor position
pub type TimeAnchor<I> = Anchor<DateTime<Utc>, I>;

/// Count-ordered cursor position
pub type CountAnchor<I> = Anchor<u64, I>;

/// Ranking cursor position: the last-seen entry's project id, nothing more. The snapshot already
/// holds the order; there is no secondary key to anchor on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RankCursor {
    pub id: ProjectId,
}

/// Typed accessors for a pageable row: its unique id and its secondary sort key.
///
/// Implementations are zero-sized & resolved at compile time; this is the whole of the machinery
/// the source system bought with runtime method lookup.
pub trait OrderStrategy<T> {
    type Key: Copy + Ord;
    type Id: Copy + Ord;
    fn key(&self, row: &T) -> Self::Key;
    fn id(&self, row: &T) -> Self::Id;
}

/// Projects, newest first
pub struct ProjectRecency;

impl OrderStrategy<Project> for ProjectRecency {
    type Key = DateTime<Utc>;
    type Id = ProjectId;
    fn key(&self, row: &Project) -> Self::Key {
        row.created_at
    }
    fn id(&self, row: &Project) -> Self::Id {
        row.id
    }
}

/// Comments, newest first
pub struct CommentRecency;

impl OrderStrategy<Comment> for CommentRecency {
    type Key = DateTime<Utc>;
    type Id = CommentId;
    fn key(&self, row: &Comment) -> Self::Key {
        row.created_at
    }
    fn id(&self, row: &Comment) -> Self::Id {
        row.id
    }
}

/// Badge tallies, most-acquired first
pub struct BadgeAcquisition;

impl OrderStrategy<BadgeStat> for BadgeAcquisition {
    type Key = u64;
    type Id = BadgeStatId;
    fn key(&self, row: &BadgeStat) -> Self::Key {
        row.acquired_count
    }
    fn id(&self, row: &BadgeStat) -> Self::Id {
        row.id
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the page engine                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The keyset predicate: does a row at `(key, id)` come strictly after `anchor` in our descending
/// order? Ties on the sort key fall to the id; ties on the id can't occur (ids are unique).
pub fn admits<K: Ord, I: Ord>(anchor: &Anchor<K, I>, key: &K, id: &I) -> bool {
    *key < anchor.key || (*key == anchor.key && *id < anchor.id)
}

/// Filter `rows` to those admitted by `anchor`, sort descending by `(key, id)`, and keep at most
/// `limit`.
///
/// This is the reference evaluation of the compound predicate + ordering that a SQL-backed
/// [Backend] would push into a WHERE/ORDER BY/LIMIT; the in-memory backend evaluates it here so
/// that every backend agrees on the semantics.
///
/// [Backend]: crate::storage::Backend
pub fn keyset_slice<T, S: OrderStrategy<T>>(
    rows: impl IntoIterator<Item = T>,
    strategy: &S,
    anchor: &Option<Anchor<S::Key, S::Id>>,
    limit: usize,
) -> Vec<T> {
    let mut rows = rows
        .into_iter()
        .filter(|row| match anchor {
            Some(anchor) => admits(anchor, &strategy.key(row), &strategy.id(row)),
            None => true,
        })
        .collect::<Vec<T>>();
    rows.sort_by(|a, b| {
        (strategy.key(b), strategy.id(b)).cmp(&(strategy.key(a), strategy.id(a)))
    });
    rows.truncate(limit);
    rows
}

/// One page of `T`s, along with where the next page would begin
///
/// `next` is derived from the last row of `items` (never from the probe row), whenever the page is
/// non-empty. `has_next` is true iff a `page_size + 1`-th row existed server-side at fetch time;
/// it, not `next`'s presence, is the client's walk-termination signal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CursorPage<T, A> {
    pub items: Vec<T>,
    pub next: Option<A>,
    pub has_next: bool,
}

/// Fetch the next page of rows
///
/// The one place the `page_size + 1` probe trick lives: `fetch` is handed the anchor & a limit,
/// and must return up to `limit` rows in descending `(key, id)` order, already filtered by the
/// anchor (see [keyset_slice]). We trim the probe row off, note whether it existed, and derive the
/// next anchor from the last row actually kept.
pub async fn fetch_page<T, S, F, Fut, E>(
    strategy: &S,
    anchor: Option<Anchor<S::Key, S::Id>>,
    page_size: PageSize,
    fetch: F,
) -> std::result::Result<CursorPage<T, Anchor<S::Key, S::Id>>, E>
where
    S: OrderStrategy<T>,
    F: FnOnce(Option<Anchor<S::Key, S::Id>>, usize) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<T>, E>>,
{
    let mut items = fetch(anchor, page_size.get() + 1).await?;
    let has_next = items.len() > page_size.get();
    if has_next {
        items.truncate(page_size.get());
    }
    let next = items.last().map(|last| Anchor {
        key: strategy.key(last),
        id: strategy.id(last),
    });
    Ok(CursorPage {
        items,
        next,
        has_next,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          token codec                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Should really version this structure, tho cursors are expected to be so short-lived as to
// probably not be worth it.

/// Render a cursor position as an opaque, tamper-evident transport token: "base64(mac).json"
pub fn sign_token<A: Serialize>(anchor: &A, key: &Key) -> Result<String> {
    let json = serde_json::to_string(anchor).context(AnchorSerSnafu)?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_ref().expose_secret()).context(KeyLengthSnafu)?;
    mac.update(json.as_bytes());
    let mac = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("{mac}.{json}"))
}

/// Parse & verify a transport token produced by [sign_token]; anything that doesn't round-trip
/// exactly is an error, never coerced.
pub fn verify_token<A: DeserializeOwned>(token: &str, key: &Key) -> Result<A> {
    // The JSON side may itself contain '.' (fractional-second timestamps, e.g.), so split off the
    // MAC only.
    let (mac, json) = exactly_two(token.splitn(2, '.')).map_err(|_| {
        TokenFormatSnafu {
            token: token.to_owned(),
        }
        .build()
    })?;

    let mac = BASE64_STANDARD.decode(mac).context(Base64DeSnafu {
        token: token.to_owned(),
    })?;

    let mut verifier =
        Hmac::<Sha256>::new_from_slice(key.as_ref().expose_secret()).context(KeyLengthSnafu)?;
    verifier.update(json.as_bytes());
    verifier.verify_slice(&mac).context(HmacSnafu)?;

    serde_json::from_str::<A>(json).context(AnchorDeSnafu)
}

#[cfg(test)]
mod check_tokens {
    use super::*;

    use chrono::TimeZone;

    fn key() -> Key {
        Key::from((0u8..32).collect::<Vec<u8>>())
    }

    #[test]
    fn round_trip() {
        // Deliberately pick a timestamp with sub-second precision; its JSON rendering contains a
        // '.' and the token parse has to cope.
        let anchor = TimeAnchor::<CommentId> {
            key: Utc.with_ymd_and_hms(2025, 7, 1, 9, 30, 0).unwrap()
                + chrono::Duration::milliseconds(137),
            id: CommentId::from_raw(42),
        };
        let token = sign_token(&anchor, &key()).unwrap();
        let got: TimeAnchor<CommentId> = verify_token(&token, &key()).unwrap();
        assert_eq!(anchor, got);

        let anchor = CountAnchor::<BadgeStatId> {
            key: 11,
            id: BadgeStatId::from_raw(7),
        };
        let token = sign_token(&anchor, &key()).unwrap();
        let got: CountAnchor<BadgeStatId> = verify_token(&token, &key()).unwrap();
        assert_eq!(anchor, got);
    }

    #[test]
    fn tampered() {
        let anchor = RankCursor {
            id: ProjectId::from_raw(3),
        };
        let token = sign_token(&anchor, &key()).unwrap();

        // Twiddle the JSON half; the MAC no longer matches.
        let tampered = token.replace(":3", ":4");
        assert!(matches!(
            verify_token::<RankCursor>(&tampered, &key()),
            Err(Error::Hmac { .. })
        ));

        // A token signed under some other key is just as bad.
        let other = Key::from(vec![0xffu8; 32]);
        assert!(verify_token::<RankCursor>(&token, &other).is_err());

        // And plain garbage fails the format check before anything else.
        assert!(matches!(
            verify_token::<RankCursor>("no-dot-here", &key()),
            Err(Error::TokenFormat { .. })
        ));
    }

    #[test]
    fn page_sizes() {
        assert!(PageSize::new(0).is_err());
        assert_eq!(PageSize::new(1).unwrap().get(), 1);
        assert_eq!(PageSize::new(100).unwrap().get(), 100);
        assert!(PageSize::new(101).is_err());
    }
}

#[cfg(test)]
mod check_keyset {
    use super::*;

    use chrono::TimeZone;

    use crate::entities::ProjectTitle;

    fn project(id: i64, at: DateTime<Utc>) -> Project {
        Project {
            id: ProjectId::from_raw(id),
            team_id: None,
            title: ProjectTitle::new("p").unwrap(/* known good */),
            introduction: None,
            detailed_description: None,
            representative_image_url: None,
            deployment_url: None,
            github_url: None,
            tags: vec![],
            created_at: at,
            modified_at: at,
        }
    }

    #[test]
    fn predicate() {
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        let anchor = TimeAnchor::<ProjectId> {
            key: t0,
            id: ProjectId::from_raw(10),
        };
        // Strictly-earlier key: in.
        assert!(admits(
            &anchor,
            &(t0 - chrono::Duration::seconds(1)),
            &ProjectId::from_raw(99)
        ));
        // Tied key: only lower ids.
        assert!(admits(&anchor, &t0, &ProjectId::from_raw(9)));
        assert!(!admits(&anchor, &t0, &ProjectId::from_raw(10)));
        assert!(!admits(&anchor, &t0, &ProjectId::from_raw(11)));
        // Later key: out, no matter the id.
        assert!(!admits(
            &anchor,
            &(t0 + chrono::Duration::seconds(1)),
            &ProjectId::from_raw(1)
        ));
    }

    #[test]
    fn slice_orders_and_limits() {
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        // Three rows sharing a timestamp, one newer; descending (key, id) puts the newest first
        // and breaks the tie by id, highest first.
        let rows = vec![
            project(1, t0),
            project(2, t0),
            project(3, t0),
            project(4, t0 + chrono::Duration::seconds(5)),
        ];
        let got = keyset_slice(rows.clone(), &ProjectRecency, &None, 10)
            .into_iter()
            .map(|p| p.id.as_raw())
            .collect::<Vec<i64>>();
        assert_eq!(got, vec![4, 3, 2, 1]);

        // An anchor at (t0, 3) admits only ids 1 & 2.
        let anchor = Some(TimeAnchor::<ProjectId> {
            key: t0,
            id: ProjectId::from_raw(3),
        });
        let got = keyset_slice(rows, &ProjectRecency, &anchor, 1)
            .into_iter()
            .map(|p| p.id.as_raw())
            .collect::<Vec<i64>>();
        assert_eq!(got, vec![2]);
    }

    #[tokio::test]
    async fn page_assembly() {
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        let rows = (1..=5)
            .map(|i| project(i, t0 + chrono::Duration::seconds(i)))
            .collect::<Vec<Project>>();

        let page_size = PageSize::new(2).unwrap();
        let page = fetch_page(&ProjectRecency, None, page_size, |anchor, limit| {
            let rows = rows.clone();
            async move {
                assert_eq!(limit, 3); // page_size + 1
                Ok::<Vec<Project>, std::convert::Infallible>(keyset_slice(
                    rows,
                    &ProjectRecency,
                    &anchor,
                    limit,
                ))
            }
        })
        .await
        .unwrap();

        assert_eq!(
            page.items.iter().map(|p| p.id.as_raw()).collect::<Vec<_>>(),
            vec![5, 4]
        );
        assert!(page.has_next);
        // The next anchor names the last *kept* row, not the probe row.
        assert_eq!(page.next.unwrap().id, ProjectId::from_raw(4));

        // Walk to the end: the final page reports has_next = false.
        let page = fetch_page(
            &ProjectRecency,
            Some(TimeAnchor {
                key: t0 + chrono::Duration::seconds(2),
                id: ProjectId::from_raw(2),
            }),
            page_size,
            |anchor, limit| {
                let rows = rows.clone();
                async move {
                    Ok::<Vec<Project>, std::convert::Infallible>(keyset_slice(
                        rows,
                        &ProjectRecency,
                        &anchor,
                        limit,
                    ))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(
            page.items.iter().map(|p| p.id.as_raw()).collect::<Vec<_>>(),
            vec![1]
        );
        assert!(!page.has_next);
        assert_eq!(page.next.unwrap().id, ProjectId::from_raw(1));
    }
}
