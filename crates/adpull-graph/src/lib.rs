//! Reporting API client: report submission, bounded completion polling, and
//! cursor-paged result retrieval.

use std::fmt;
use std::time::Duration;

use adpull_core::{insight_field_names, RawRow};
use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "adpull-graph";

/// Rows requested per result page.
pub const PAGE_LIMIT: u32 = 500;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com";

/// Server-issued handle for an asynchronous report job. Transient: held only
/// for the duration of one pull, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportId(String);

impl ReportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-interval polling bounds for report completion checks.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_checks: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_checks: 240,
        }
    }
}

/// Delay abstraction so polling tests can simulate time without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// One page of report rows plus its continuation cursor.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightsPage {
    #[serde(default)]
    pub data: Vec<RawRow>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    report_run_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    async_percent_completion: u8,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("report {report_id} is at {percent}% after {checks} status checks")]
    PollTimeout {
        report_id: String,
        percent: u8,
        checks: u32,
    },
}

/// The three reporting-API operations the pipeline depends on.
#[async_trait]
pub trait InsightsApi: Send + Sync {
    /// Start server-side report computation for one account.
    async fn submit_report(&self, account_id: &str) -> Result<ReportId, GraphError>;

    /// Current completion percentage of an in-progress report.
    async fn report_status(&self, report: &ReportId) -> Result<u8, GraphError>;

    /// One page of a completed report's rows, from the given cursor.
    async fn fetch_page(
        &self,
        report: &ReportId,
        after: Option<&str>,
    ) -> Result<InsightsPage, GraphError>;
}

#[derive(Debug, Clone)]
pub struct InsightsClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    access_token: String,
}

impl InsightsClient {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;

        let base_url = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            access_token: access_token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.api_version, path)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GraphError> {
        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl InsightsApi for InsightsClient {
    async fn submit_report(&self, account_id: &str) -> Result<ReportId, GraphError> {
        let url = self.endpoint(&format!("{account_id}/insights"));
        let fields = insight_field_names().join(",");
        let response = self
            .client
            .post(&url)
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("fields", fields.as_str()),
                ("level", "ad"),
                ("time_increment", "1"),
            ])
            .send()
            .await?;

        let submitted: SubmitResponse = self.read_json(response).await?;
        debug!(account_id, report_id = %submitted.report_run_id, "report submitted");
        Ok(ReportId::new(submitted.report_run_id))
    }

    async fn report_status(&self, report: &ReportId) -> Result<u8, GraphError> {
        let url = self.endpoint(report.as_str());
        let response = self
            .client
            .get(&url)
            .query(&[("access_token", self.access_token.as_str())])
            .send()
            .await?;

        let status: StatusResponse = self.read_json(response).await?;
        debug!(report_id = %report, percent = status.async_percent_completion, "report status");
        Ok(status.async_percent_completion)
    }

    async fn fetch_page(
        &self,
        report: &ReportId,
        after: Option<&str>,
    ) -> Result<InsightsPage, GraphError> {
        let url = self.endpoint(&format!("{}/insights", report.as_str()));
        let limit = PAGE_LIMIT.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("access_token", self.access_token.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(cursor) = after {
            query.push(("after", cursor));
        }

        let response = self.client.get(&url).query(&query).send().await?;
        self.read_json(response).await
    }
}

/// Poll a report's completion percentage until it reaches 100%.
///
/// Fixed interval, no backoff. The check happens before the sleep, so an
/// already-complete report costs one check and zero sleeps. Gives up with
/// [`GraphError::PollTimeout`] after `policy.max_checks` status checks,
/// with no sleep after the final one.
pub async fn await_report_ready(
    api: &dyn InsightsApi,
    report: &ReportId,
    policy: &PollPolicy,
    sleeper: &dyn Sleeper,
) -> Result<(), GraphError> {
    let mut last_percent = 0u8;

    for check in 1..=policy.max_checks {
        let percent = api.report_status(report).await?;
        if percent >= 100 {
            debug!(report_id = %report, checks = check, "report ready");
            return Ok(());
        }
        last_percent = percent;
        if check < policy.max_checks {
            sleeper.sleep(policy.interval).await;
        }
    }

    Err(GraphError::PollTimeout {
        report_id: report.to_string(),
        percent: last_percent,
        checks: policy.max_checks,
    })
}

/// Fetch every page of a completed report, following `paging.next` cursors
/// until the final page carries none. A zero-row report yields an empty
/// collection.
pub async fn fetch_all_rows(
    api: &dyn InsightsApi,
    report: &ReportId,
) -> Result<Vec<RawRow>, GraphError> {
    let mut rows = Vec::new();
    let mut after: Option<String> = None;

    loop {
        let page = api.fetch_page(report, after.as_deref()).await?;
        rows.extend(page.data);
        match page.paging.and_then(|p| p.next) {
            Some(cursor) => after = Some(cursor),
            None => break,
        }
    }

    debug!(report_id = %report, rows = rows.len(), "report rows fetched");
    Ok(rows)
}

/// Submit, await, and fully page one account's report.
pub async fn run_report(
    api: &dyn InsightsApi,
    account_id: &str,
    policy: &PollPolicy,
    sleeper: &dyn Sleeper,
) -> Result<Vec<RawRow>, GraphError> {
    let report = api.submit_report(account_id).await?;
    await_report_ready(api, &report, policy, sleeper).await?;
    fetch_all_rows(api, &report).await
}
