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

//! Pagination walks, end-to-end: completeness, insert-safety, & the ranking page adapter.

use chrono::{Duration, TimeZone, Utc};

use plaudit::{
    badges::badge_page,
    comments::comment_page,
    coordinator::Config,
    entities::{ProjectId, SnapshotId},
    memory::Memory,
    paging::{sign_token, verify_token, PageSize, RankCursor},
    projects::{self, ranking_page},
    storage::Backend,
};

use plaudit_test::{make_state, seed_team_with_project, seed_teamless_project, token_key};

/// Walking every page of a fixed comment set yields exactly the full set, ordered, no duplicates
/// or omissions-- including through timestamp ties.
#[tokio::test]
async fn comment_walk_is_complete() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let (_, project) = seed_team_with_project(&memory, 1, 1, 0, 0, &t0).await;
    let author = memory.add_member("hana", None, None, &t0).await.unwrap();

    // Nine comments in three timestamp-tied triples, arranged so that creation (= id) order runs
    // *against* time order; walks that confuse the two will scramble.
    //
    //   ids 1,2,3 @ t0+2s; ids 4,5,6 @ t0+1s; ids 7,8,9 @ t0
    for i in 0..9i64 {
        let at = t0 + Duration::seconds(2 - i / 3);
        memory
            .add_comment(&project, &author, &format!("comment {i}"), &at)
            .await
            .unwrap();
    }
    let expected = vec![3, 2, 1, 6, 5, 4, 9, 8, 7];

    let state = make_state(&memory, Config::default());
    let page_size = PageSize::new(4).unwrap();

    let mut walked: Vec<i64> = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = comment_page(&state, &project, cursor, page_size).await.unwrap();
        assert!(page.items.len() <= page_size.get());
        walked.extend(page.items.iter().map(|c| c.id.as_raw()));
        pages += 1;
        if !page.has_next {
            break;
        }
        // Round-trip the anchor through the wire codec, as a client would.
        let token = sign_token(&page.next.unwrap(), &token_key()).unwrap();
        cursor = Some(verify_token(&token, &token_key()).unwrap());
    }

    assert_eq!(walked, expected);
    assert_eq!(pages, 3); // 4 + 4 + 1
}

/// A row inserted mid-walk with a sort key *newer* than the walk's position neither appears in
/// the remainder of the walk nor disturbs it; a fresh walk picks it up first.
#[tokio::test]
async fn comment_walk_is_insert_safe() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let (_, project) = seed_team_with_project(&memory, 1, 1, 0, 0, &t0).await;
    let author = memory.add_member("hana", None, None, &t0).await.unwrap();

    for i in 0..6i64 {
        let at = t0 + Duration::seconds(i);
        memory
            .add_comment(&project, &author, &format!("comment {i}"), &at)
            .await
            .unwrap();
    }
    // Descending: ids 6,5,4,3,2,1.

    let state = make_state(&memory, Config::default());
    let page_size = PageSize::new(3).unwrap();

    let first = comment_page(&state, &project, None, page_size).await.unwrap();
    assert_eq!(
        first.items.iter().map(|c| c.id.as_raw()).collect::<Vec<_>>(),
        vec![6, 5, 4]
    );

    // Mid-walk, someone comments; newer than anything already paged.
    memory
        .add_comment(&project, &author, "breaking news", &(t0 + Duration::seconds(60)))
        .await
        .unwrap();

    let second = comment_page(&state, &project, first.next, page_size)
        .await
        .unwrap();
    assert_eq!(
        second
            .items
            .iter()
            .map(|c| c.id.as_raw())
            .collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
    assert!(!second.has_next);

    // A fresh walk leads with the new row.
    let fresh = comment_page(&state, &project, None, page_size).await.unwrap();
    assert_eq!(fresh.items[0].id.as_raw(), 7);
}

/// `has_next` is true iff a page_size+1-th row existed; pages never exceed their size.
#[tokio::test]
async fn page_size_bound() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let (_, project) = seed_team_with_project(&memory, 1, 1, 0, 0, &t0).await;
    let author = memory.add_member("hana", None, None, &t0).await.unwrap();

    for i in 0..5i64 {
        memory
            .add_comment(&project, &author, "c", &(t0 + Duration::seconds(i)))
            .await
            .unwrap();
    }

    let state = make_state(&memory, Config::default());

    // Exactly page_size rows: a full page, but no next.
    let page = comment_page(&state, &project, None, PageSize::new(5).unwrap())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 5);
    assert!(!page.has_next);

    // One fewer than the total: the probe row exists, so has_next.
    let page = comment_page(&state, &project, None, PageSize::new(4).unwrap())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 4);
    assert!(page.has_next);
}

/// The count strategy: most-acquired first, ties broken by id descending, walk complete.
#[tokio::test]
async fn badge_walk_is_complete() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let (receiver, _) = seed_team_with_project(&memory, 1, 1, 0, 0, &t0).await;

    // Six giver teams; their stat rows get ids 1..=6 in this order.
    let mut givers = Vec::new();
    for number in 2..=7 {
        let (giver, _) = seed_team_with_project(&memory, 1, number, 0, 0, &t0).await;
        memory.record_badge(&giver, &receiver, &t0).await.unwrap();
        givers.push(giver);
    }
    // Bump tallies to: stat 1 -> 3, stat 4 -> 2, stat 6 -> 3; the rest stay at 1.
    for _ in 0..2 {
        memory.record_badge(&givers[0], &receiver, &t0).await.unwrap();
        memory.record_badge(&givers[5], &receiver, &t0).await.unwrap();
    }
    memory.record_badge(&givers[3], &receiver, &t0).await.unwrap();

    // Descending (count, id): 3 -> stats 6, 1; 2 -> stat 4; 1 -> stats 5, 3, 2.
    let expected = vec![6, 1, 4, 5, 3, 2];

    let state = make_state(&memory, Config::default());
    let page_size = PageSize::new(2).unwrap();

    let mut walked: Vec<i64> = Vec::new();
    let mut cursor = None;
    loop {
        let page = badge_page(&state, &receiver, cursor, page_size).await.unwrap();
        assert!(page.items.len() <= page_size.get());
        walked.extend(page.items.iter().map(|b| b.id.as_raw()));
        if !page.has_next {
            break;
        }
        cursor = page.next;
    }
    assert_eq!(walked, expected);
}

/// The ranking page adapter: order from the snapshot, entities from the live store, cursor by
/// linear scan.
#[tokio::test]
async fn ranking_walk() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();

    // Five teams/projects with given counts 5, 5, 2, 0, 7 (project ids 1..=5), plus a teamless
    // project that must not appear at all.
    seed_team_with_project(&memory, 1, 1, 5, 0, &t0).await;
    seed_team_with_project(&memory, 1, 2, 5, 1, &t0).await;
    seed_team_with_project(&memory, 1, 3, 2, 2, &t0).await;
    seed_team_with_project(&memory, 1, 4, 0, 3, &t0).await;
    seed_team_with_project(&memory, 1, 5, 7, 4, &t0).await;
    seed_teamless_project(&memory, &t0).await;

    // Ranking: 7 first, then the 5-5 tie by ascending project id, then 2, then 0.
    let expected = vec![5, 1, 2, 3, 4];

    let state = make_state(&memory, Config::default());
    let page_size = PageSize::new(2).unwrap();

    let mut walked: Vec<i64> = Vec::new();
    let mut cursor: Option<RankCursor> = None;
    let mut context: Option<SnapshotId> = None;
    loop {
        let page = ranking_page(&state, context, cursor, page_size).await.unwrap();
        // Every caller in the walk stays pinned to the snapshot the first page resolved.
        match context {
            Some(id) => assert_eq!(id, page.context_id),
            None => context = Some(page.context_id),
        }
        walked.extend(page.items.iter().map(|card| card.id.as_raw()));
        if !page.has_next {
            assert!(page.next.is_none());
            break;
        }
        cursor = page.next;
    }
    assert_eq!(walked, expected);

    // Hydration pulls live team counts alongside the snapshot's order.
    let page = ranking_page(&state, context, None, PageSize::new(5).unwrap())
        .await
        .unwrap();
    assert_eq!(page.items[0].given_plaudit_count, Some(7));
    assert_eq!(page.items[0].team_number, Some(5));
    assert!(!page.has_next);
}

/// A cursor minted against a rotated snapshot names no entry; the walk restarts from the top
/// rather than erroring.
#[tokio::test]
async fn ranking_stale_cursor_restarts() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    seed_team_with_project(&memory, 1, 1, 5, 0, &t0).await;
    seed_team_with_project(&memory, 1, 2, 3, 0, &t0).await;

    let state = make_state(&memory, Config::default());
    let first = ranking_page(&state, None, None, PageSize::new(1).unwrap())
        .await
        .unwrap();

    let stale = Some(RankCursor {
        id: ProjectId::from_raw(999),
    });
    let restarted = ranking_page(&state, Some(first.context_id), stale, PageSize::new(1).unwrap())
        .await
        .unwrap();
    assert_eq!(
        restarted.items[0].id.as_raw(),
        first.items[0].id.as_raw()
    );
}

/// Context resolution: absent & non-positive ids fall back to a fresh registration; an explicit
/// unknown id is the caller's error.
#[tokio::test]
async fn ranking_context_resolution() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    seed_team_with_project(&memory, 1, 1, 1, 0, &t0).await;

    let state = make_state(&memory, Config::default());
    let page_size = PageSize::new(10).unwrap();

    // Absent: register & serve.
    let page = ranking_page(&state, None, None, page_size).await.unwrap();
    assert_eq!(page.items.len(), 1);

    // Non-positive: same fallback (no store ever assigns such an id).
    let fallback = ranking_page(&state, Some(SnapshotId::from_raw(-3)), None, page_size)
        .await
        .unwrap();
    assert_eq!(fallback.context_id, page.context_id);

    // Explicit but unknown: 404-equivalent.
    assert!(matches!(
        ranking_page(&state, Some(SnapshotId::from_raw(999)), None, page_size).await,
        Err(projects::Error::SnapshotNotFound { .. })
    ));
}

/// Comments on one project never bleed into another's listing (the partition key is always in
/// the filter).
#[tokio::test]
async fn comment_partitioning() {
    let memory = Memory::new();
    let t0 = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let (_, ours) = seed_team_with_project(&memory, 1, 1, 0, 0, &t0).await;
    let (_, theirs) = seed_team_with_project(&memory, 1, 2, 0, 0, &t0).await;
    let author = memory.add_member("hana", None, None, &t0).await.unwrap();

    memory.add_comment(&ours, &author, "ours", &t0).await.unwrap();
    memory
        .add_comment(&theirs, &author, "theirs", &t0)
        .await
        .unwrap();

    let state = make_state(&memory, Config::default());
    let page = comment_page(&state, &ours, None, PageSize::new(10).unwrap())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].content, "ours");
    assert_eq!(page.items[0].author.as_ref().unwrap().name, "hana");
}
