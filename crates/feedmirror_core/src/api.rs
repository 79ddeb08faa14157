/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedmirror_protocol::TimelinePage;
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use urlencoding::encode;

/// Source of per-account timeline pages.
///
/// `cursor` is `None` for the head of the timeline. Implementations signal a
/// remote rate-limit rejection by returning (or wrapping) [`RateLimited`].
#[async_trait]
pub trait TimelineApi: Send + Sync {
    async fn fetch_page(&self, account_id: &str, page_size: u32, cursor: Option<&str>) -> Result<TimelinePage>;
}

#[derive(Debug, Clone, Default)]
pub struct RateLimited {
    pub retry_after_secs: Option<u64>,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after_secs {
            Some(s) => write!(f, "remote rate limit (retry after {s}s)"),
            None => f.write_str("remote rate limit"),
        }
    }
}

impl std::error::Error for RateLimited {}

/// The [`RateLimited`] marker anywhere in the error chain.
pub fn rate_limit_of(err: &anyhow::Error) -> Option<&RateLimited> {
    err.chain().find_map(|c| c.downcast_ref::<RateLimited>())
}

/// JSON timeline endpoint: `GET {base}/timeline/{account}?limit=N&cursor=TOKEN`.
#[derive(Clone)]
pub struct HttpTimelineApi {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTimelineApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self::with_client(http, base_url, token))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        }
    }

    fn page_url(&self, account_id: &str, page_size: u32, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/timeline/{}?limit={}",
            self.base_url,
            encode(account_id),
            page_size.max(1)
        );
        if let Some(c) = cursor.filter(|c| !c.is_empty()) {
            url.push_str("&cursor=");
            url.push_str(&encode(c));
        }
        url
    }
}

#[async_trait]
impl TimelineApi for HttpTimelineApi {
    async fn fetch_page(&self, account_id: &str, page_size: u32, cursor: Option<&str>) -> Result<TimelinePage> {
        let url = self.page_url(account_id, page_size, cursor);
        let mut req = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, format!("feedmirror/{}", env!("CARGO_PKG_VERSION")));
        if let Some(tok) = self.token.as_ref() {
            req = req.header(AUTHORIZATION, format!("Bearer {tok}"));
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("fetch timeline: {account_id}"))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(anyhow::Error::new(RateLimited { retry_after_secs }).context(format!("timeline {account_id}")));
        }
        if !status.is_success() {
            anyhow::bail!("timeline {account_id}: http {status}");
        }
        resp.json::<TimelinePage>()
            .await
            .with_context(|| format!("parse timeline json: {account_id}"))
    }
}
