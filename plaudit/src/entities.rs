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

//! # plaudit models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: teams, the projects they showcase, the comments left on those projects, and the
//! badge tallies teams trade back & forth. Everything else in the crate traffics in them.

use std::{fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use url::Url;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text:?} is not a valid project title"))]
    BadTitle { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// # Introduction
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity.
///
/// # Background
///
/// Our datastore hands out numeric identifiers, monotonically, at insertion time (the snapshot
/// store's contract *depends* on that monotonicity). A bare `i64` would do, but I just couldn't
/// bring myself to use the same type to represent identifiers for teams, projects, comments &
/// snapshots all at the same time-- mixing them up should be a compile-time error, not a 3 a.m.
/// page.
///
/// This macro will define a newtype struct wrapping [i64] implementing [Display] along with the
/// obvious conversions. I thought to use a type alias, but those don't work very well with newtype
/// structs (in particular, you can't access the type's constructor through the alias (not sure
/// why)).
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(i64);
        impl $type_name {
            pub fn from_raw(raw: i64) -> $type_name {
                $type_name(raw)
            }
            pub fn as_raw(&self) -> i64 {
                self.0
            }
            /// The store never assigns zero or negative identifiers; anything else arriving from
            /// the outside world is treated as "absent" by callers.
            pub fn is_positive(&self) -> bool {
                self.0 > 0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl From<i64> for $type_name {
            fn from(raw: i64) -> Self {
                $type_name(raw)
            }
        }
    };
}

define_id!(TeamId);
define_id!(MemberId);
define_id!(ProjectId);
define_id!(CommentId);
define_id!(BadgeStatId);
define_id!(SnapshotId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ProjectTitle                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Project titles may be arbitrary UTF-8 text, from one to sixty-four characters in length, and may
// not be entirely whitespace.
const MAX_TITLE_LENGTH: usize = 64;

fn check_title(s: &str) -> bool {
    let n = s.chars().count();
    n >= 1 && n <= MAX_TITLE_LENGTH && !s.trim().is_empty()
}

/// A refined type representing a project title
// Boy... writing refined types in Rust involves a *lot* of boilerplate. I have to wonder if there
// isn't a better way...
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ProjectTitle(String);

impl ProjectTitle {
    /// Construct a [ProjectTitle] from a `&str`, copying. To *move* a [String] into a
    /// [ProjectTitle] (with validity checking) use [TryFrom::try_from()].
    pub fn new(text: &str) -> Result<ProjectTitle> {
        check_title(text)
            .then_some(ProjectTitle(text.to_owned()))
            .ok_or(
                BadTitleSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for ProjectTitle {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for ProjectTitle {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `ProjectTitle`
impl<'de> Deserialize<'de> for ProjectTitle {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        ProjectTitle::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for ProjectTitle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectTitle {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProjectTitle::new(s)
    }
}

impl TryFrom<String> for ProjectTitle {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if check_title(&text) {
            Ok(ProjectTitle(text))
        } else {
            BadTitleSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         domain entities                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A team in some term of the program; at most one showcased project per team.
///
/// The plaudit counts live here, not on the project: encouragement is traded team-to-team, and the
/// ranking is computed over the *given* count (generosity ranks, hoarding doesn't).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Team {
    pub id: TeamId,
    pub term: u32,
    pub number: u32,
    pub given_plaudit_count: u64,
    pub received_plaudit_count: u64,
    pub badge_image_url: Option<Url>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A member of a team; only the fields comment hydration needs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub nickname: Option<String>,
    pub profile_image_url: Option<Url>,
}

/// A showcased project
///
/// `team_id` is optional: a project can exist briefly before its team association is recorded, and
/// such projects are omitted from rankings (they have no score) rather than ranked last.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub team_id: Option<TeamId>,
    pub title: ProjectTitle,
    pub introduction: Option<String>,
    pub detailed_description: Option<String>,
    pub representative_image_url: Option<Url>,
    pub deployment_url: Option<Url>,
    pub github_url: Option<Url>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A comment left on a project
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub project_id: ProjectId,
    pub author_id: MemberId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One giver-team's badge tally as seen by one receiver team
///
/// Every time `giver_team_id` awards its badge to `receiver_team_id`, `acquired_count` ticks up.
/// The badge listing for a team is these rows, most-acquired first.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BadgeStat {
    pub id: BadgeStatId,
    pub giver_team_id: TeamId,
    pub receiver_team_id: TeamId,
    pub acquired_count: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[cfg(test)]
mod check_titles {
    use super::*;

    #[test]
    fn smoke() {
        assert!(ProjectTitle::new("Night Market").is_ok());
        assert!(ProjectTitle::new("").is_err());
        assert!(ProjectTitle::new("   ").is_err());
        assert!(ProjectTitle::new(&"x".repeat(64)).is_ok());
        assert!(ProjectTitle::new(&"x".repeat(65)).is_err());
    }

    #[test]
    fn ids_are_typed() {
        let team = TeamId::from_raw(1);
        assert_eq!(team.as_raw(), 1);
        assert!(team.is_positive());
        assert!(!ProjectId::from_raw(0).is_positive());
        assert_eq!(format!("{}", SnapshotId::from_raw(42)), "42");
    }
}
