/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod api;
pub mod cache_store;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod kv;
pub mod rate_limiter;
pub mod scheduler;
pub mod worker;

pub use feedmirror_protocol::{TimelineItem, TimelinePage};
