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

//! # Ranking Computation
//!
//! The ranking is a total order over showcased projects: descending by the owning team's
//! given-plaudit count (generosity ranks), ties broken by ascending project id so the order is
//! stable run-to-run. Ranks are dense & 1-based-- 1, 2, 3, ... with no gaps, even through ties.
//!
//! A project without a team has no score. Such projects are silently omitted from the ranking
//! (they'll appear once their team association is recorded), *not* ranked last; ranking them last
//! would misrepresent "unknown" as "worst".
//!
//! [compute] is a pure function over whatever slice of state it's handed; deciding *when* to run
//! it (and making sure only one caller does) is the [coordinator](crate::coordinator)'s problem.
//! The computed table is serialized under a `{"projects": [...]}` envelope to leave room for
//! siblings in the persisted form without breaking old readers.

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

use crate::entities::{Project, ProjectId, Team};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While deserializing a ranking table, {source}"))]
    De {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While serializing a ranking table, {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// One row of a computed ranking
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RankingEntry {
    pub project_id: ProjectId,
    /// 1-based, dense; strictly increasing by one down the table
    pub rank: u32,
    pub given_plaudit_count: u64,
    pub received_plaudit_count: u64,
}

/// The persisted envelope; "projects" today, perhaps more tomorrow
#[derive(Clone, Debug, Deserialize, Serialize)]
struct RankingTable {
    projects: Vec<RankingEntry>,
}

/// Compute the full ranking over the given projects & their teams
///
/// Rows whose team is absent are skipped. The remainder are ordered by given-plaudit count
/// descending, project id ascending, and assigned ranks 1..=K.
pub fn compute(rows: &[(Project, Option<Team>)]) -> Vec<RankingEntry> {
    let mut scored = rows
        .iter()
        .filter_map(|(project, team)| {
            team.as_ref().map(|team| {
                (
                    project.id,
                    team.given_plaudit_count,
                    team.received_plaudit_count,
                )
            })
        })
        .collect::<Vec<(ProjectId, u64, u64)>>();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .zip(1u32..)
        .map(|((project_id, given, received), rank)| RankingEntry {
            project_id,
            rank,
            given_plaudit_count: given,
            received_plaudit_count: received,
        })
        .collect()
}

/// Serialize a computed ranking to its persisted form
pub fn serialize(entries: Vec<RankingEntry>) -> Result<String> {
    serde_json::to_string(&RankingTable { projects: entries }).context(SerSnafu)
}

/// Parse a snapshot's `ranking_data` back into entries
///
/// Failure here means the persisted data is corrupt; callers surface that, they do *not* quietly
/// recompute from live data (which would mask the corruption & break snapshot immutability).
pub fn parse(ranking_data: &str) -> Result<Vec<RankingEntry>> {
    serde_json::from_str::<RankingTable>(ranking_data)
        .map(|table| table.projects)
        .context(DeSnafu)
}

#[cfg(test)]
mod check_ranking {
    use super::*;

    use chrono::{TimeZone, Utc};

    use crate::entities::{ProjectTitle, TeamId};

    fn fixture(ids_and_teams: &[(i64, Option<(i64, u64, u64)>)]) -> Vec<(Project, Option<Team>)> {
        let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        ids_and_teams
            .iter()
            .map(|(id, team)| {
                (
                    Project {
                        id: ProjectId::from_raw(*id),
                        team_id: team.map(|(tid, _, _)| TeamId::from_raw(tid)),
                        title: ProjectTitle::new("p").unwrap(/* known good */),
                        introduction: None,
                        detailed_description: None,
                        representative_image_url: None,
                        deployment_url: None,
                        github_url: None,
                        tags: vec![],
                        created_at: t0,
                        modified_at: t0,
                    },
                    team.map(|(tid, given, received)| Team {
                        id: TeamId::from_raw(tid),
                        term: 1,
                        number: tid as u32,
                        given_plaudit_count: given,
                        received_plaudit_count: received,
                        badge_image_url: None,
                        created_at: t0,
                        modified_at: t0,
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn dense_and_ordered() {
        // Scores 7, 7, 3, 9; the teamless project 5 is simply absent.
        let rows = fixture(&[
            (1, Some((10, 7, 0))),
            (2, Some((11, 7, 1))),
            (3, Some((12, 3, 2))),
            (4, Some((13, 9, 3))),
            (5, None),
        ]);
        let entries = compute(&rows);
        assert_eq!(
            entries
                .iter()
                .map(|e| (e.project_id.as_raw(), e.rank))
                .collect::<Vec<_>>(),
            // 9 first, then the 7-7 tie broken by ascending project id, then 3; ranks dense.
            vec![(4, 1), (1, 2), (2, 3), (3, 4)]
        );
        assert!(entries
            .iter()
            .zip(entries.iter().skip(1))
            .all(|(a, b)| b.rank == a.rank + 1));
    }

    #[test]
    fn empty() {
        assert!(compute(&fixture(&[(1, None)])).is_empty());
        assert!(compute(&[]).is_empty());
    }

    #[test]
    fn envelope_round_trip() {
        let entries = compute(&fixture(&[(1, Some((10, 2, 5))), (2, Some((11, 8, 0)))]));
        let json = serialize(entries.clone()).unwrap();
        // The persisted form is the forward-compatible envelope...
        assert!(json.starts_with(r#"{"projects":"#));
        // ...and parses back to exactly what went in.
        assert_eq!(parse(&json).unwrap(), entries);

        assert!(parse("alas, not json").is_err());
        assert!(parse(r#"{"no-projects-here": true}"#).is_err());
    }
}
