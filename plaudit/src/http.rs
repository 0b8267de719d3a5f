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

//! # plaudit application state & shared HTTP bits

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    coordinator::Coordinator,
    metrics::Instruments,
    paging::PageSize,
    snapshot,
    storage,
    util::Key,
};

/// Application state available to all handlers
pub struct Plaudit {
    pub storage: Arc<dyn storage::Backend + Send + Sync>,
    pub snapshots: Arc<dyn snapshot::Store + Send + Sync>,
    pub coordinator: Coordinator,
    /// Signs & verifies pagination tokens
    pub token_key: Key,
    /// Page size used when the caller doesn't name one
    pub default_page_size: PageSize,
    pub instruments: Arc<Instruments>,
}

/// Uniform body for error responses across all plaudit APIs
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

/// Trivial handler backing `/healthcheck`
pub async fn healthcheck() -> &'static str {
    "GOOD"
}
