/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// One post as returned by a remote timeline endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimelineItem {
    #[serde(alias = "id")]
    pub item_id: String,
    #[serde(alias = "author_id")]
    pub account_id: String,
    #[serde(alias = "timestamp")]
    pub created_at_ms: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A page of a per-account timeline.
///
/// `top_cursor` points at content newer than this page, `bottom_cursor` at
/// content older than it. Both are opaque and owned by the remote side.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TimelinePage {
    #[serde(default)]
    pub items: Vec<TimelineItem>,
    #[serde(default, alias = "newTopToken")]
    pub top_cursor: Option<String>,
    #[serde(default, alias = "newBottomToken")]
    pub bottom_cursor: Option<String>,
    #[serde(default, alias = "hasMore")]
    pub has_more: bool,
}

impl TimelinePage {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
