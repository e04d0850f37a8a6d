//! Postgres persistence for normalized ad insights: schema setup and natural-key bulk upserts.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use adpull_core::{key_field_names, value_field_names, AdInsight, InsightKey};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "adpull-store";

/// Rows per INSERT statement. 44 binds each keeps a chunk well below the
/// Postgres parameter limit.
const CHUNK_ROWS: usize = 500;

/// Idempotent DDL for the insight table. The natural-key constraint treats
/// NULL name columns as equal so re-pulled rows with missing names still
/// collapse onto their earlier copy.
const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS ad_insights (
    date_start DATE NOT NULL,
    date_stop DATE NOT NULL,
    account_id BIGINT NOT NULL,
    campaign_id BIGINT NOT NULL,
    adset_id BIGINT NOT NULL,
    ad_id BIGINT NOT NULL,
    account_name TEXT,
    campaign_name TEXT,
    adset_name TEXT,
    ad_name TEXT,
    account_currency TEXT,
    actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    action_values JSONB NOT NULL DEFAULT '[]'::jsonb,
    clicks BIGINT,
    conversion_rate_ranking TEXT,
    conversion_values JSONB NOT NULL DEFAULT '[]'::jsonb,
    conversions JSONB NOT NULL DEFAULT '[]'::jsonb,
    cost_per_action_type JSONB NOT NULL DEFAULT '[]'::jsonb,
    cost_per_conversion JSONB NOT NULL DEFAULT '[]'::jsonb,
    cost_per_unique_action_type JSONB NOT NULL DEFAULT '[]'::jsonb,
    cost_per_unique_click DOUBLE PRECISION,
    cpc DOUBLE PRECISION,
    cpm DOUBLE PRECISION,
    ctr DOUBLE PRECISION,
    engagement_rate_ranking TEXT,
    frequency DOUBLE PRECISION,
    impressions BIGINT,
    inline_link_click_ctr DOUBLE PRECISION,
    inline_link_clicks BIGINT,
    objective TEXT,
    optimization_goal TEXT,
    quality_ranking TEXT,
    reach BIGINT,
    spend DOUBLE PRECISION,
    unique_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    unique_clicks BIGINT,
    unique_ctr DOUBLE PRECISION,
    unique_link_clicks_ctr DOUBLE PRECISION,
    video_30_sec_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_p100_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_p25_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_p50_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_p75_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_p95_watched_actions JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT ad_insights_natural_key UNIQUE NULLS NOT DISTINCT
        (date_start, date_stop, account_id, campaign_id, adset_id, ad_id,
         account_name, campaign_name, adset_name, ad_name)
)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What a bulk upsert did with one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub key: InsightKey,
    pub action: UpsertAction,
}

/// Result of one bulk upsert: separate insert/update counters plus the
/// per-row outcomes behind them.
#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub inserted: u64,
    pub updated: u64,
    pub outcomes: Vec<RowOutcome>,
}

impl UpsertReport {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }

    fn absorb(&mut self, outcome: RowOutcome) {
        match outcome.action {
            UpsertAction::Inserted => self.inserted += 1,
            UpsertAction::Updated => self.updated += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Write seam for the pull pipeline. Tests swap in an in-memory sink.
#[async_trait]
pub trait InsightSink: Send + Sync {
    async fn upsert_many(&self, rows: &[AdInsight]) -> anyhow::Result<UpsertReport>;
}

/// Connection pool scoped to a single run. Callers open it right before
/// writing and close it on every exit path.
pub struct InsightStore {
    pool: PgPool,
}

impl InsightStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the insight table and its natural-key constraint if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Upsert rows keyed by the ten identity columns. Re-running the same
    /// batch updates rows in place instead of inserting duplicates.
    pub async fn bulk_upsert(&self, rows: &[AdInsight]) -> Result<UpsertReport, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertReport::default());
        }

        let unique = dedupe_by_key(rows);
        let mut report = UpsertReport::default();
        for chunk in unique.chunks(CHUNK_ROWS) {
            let mut query = build_upsert_query(chunk);
            let returned = query.build().fetch_all(&self.pool).await?;
            for row in &returned {
                report.absorb(decode_outcome(row)?);
            }
        }

        info!(
            rows = rows.len(),
            unique = unique.len(),
            inserted = report.inserted,
            updated = report.updated,
            "bulk upsert complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl InsightSink for InsightStore {
    async fn upsert_many(&self, rows: &[AdInsight]) -> anyhow::Result<UpsertReport> {
        Ok(self.bulk_upsert(rows).await?)
    }
}

/// Collapse duplicate natural keys within a batch, keeping the last
/// occurrence at the position of the first. A multi-row INSERT may not touch
/// the same row twice, and last-wins matches what sequential per-row upserts
/// would leave behind.
fn dedupe_by_key(rows: &[AdInsight]) -> Vec<&AdInsight> {
    let mut seen: HashMap<InsightKey, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<&AdInsight> = Vec::with_capacity(rows.len());
    for row in rows {
        match seen.entry(row.key()) {
            Entry::Occupied(slot) => unique[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

/// Multi-row INSERT .. ON CONFLICT DO UPDATE over the full column table.
/// The RETURNING clause reports each row's key plus whether it was freshly
/// inserted (xmax = 0) or replaced an existing row.
fn build_upsert_query<'a>(rows: &[&'a AdInsight]) -> QueryBuilder<'a, Postgres> {
    let key_columns = key_field_names().join(", ");
    let value_columns = value_field_names().join(", ");
    let assignments = value_field_names()
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query: QueryBuilder<'a, Postgres> = QueryBuilder::new("INSERT INTO ad_insights (");
    query.push(&key_columns);
    query.push(", ");
    query.push(value_columns);
    query.push(") ");

    query.push_values(rows.iter().copied(), |mut binds, row| {
        binds.push_bind(row.date_start);
        binds.push_bind(row.date_stop);
        binds.push_bind(row.account_id);
        binds.push_bind(row.campaign_id);
        binds.push_bind(row.adset_id);
        binds.push_bind(row.ad_id);
        binds.push_bind(row.account_name.as_deref());
        binds.push_bind(row.campaign_name.as_deref());
        binds.push_bind(row.adset_name.as_deref());
        binds.push_bind(row.ad_name.as_deref());
        binds.push_bind(row.account_currency.as_deref());
        binds.push_bind(Json(&row.actions));
        binds.push_bind(Json(&row.action_values));
        binds.push_bind(row.clicks);
        binds.push_bind(row.conversion_rate_ranking.as_deref());
        binds.push_bind(Json(&row.conversion_values));
        binds.push_bind(Json(&row.conversions));
        binds.push_bind(Json(&row.cost_per_action_type));
        binds.push_bind(Json(&row.cost_per_conversion));
        binds.push_bind(Json(&row.cost_per_unique_action_type));
        binds.push_bind(row.cost_per_unique_click);
        binds.push_bind(row.cpc);
        binds.push_bind(row.cpm);
        binds.push_bind(row.ctr);
        binds.push_bind(row.engagement_rate_ranking.as_deref());
        binds.push_bind(row.frequency);
        binds.push_bind(row.impressions);
        binds.push_bind(row.inline_link_click_ctr);
        binds.push_bind(row.inline_link_clicks);
        binds.push_bind(row.objective.as_deref());
        binds.push_bind(row.optimization_goal.as_deref());
        binds.push_bind(row.quality_ranking.as_deref());
        binds.push_bind(row.reach);
        binds.push_bind(row.spend);
        binds.push_bind(Json(&row.unique_actions));
        binds.push_bind(row.unique_clicks);
        binds.push_bind(row.unique_ctr);
        binds.push_bind(row.unique_link_clicks_ctr);
        binds.push_bind(Json(&row.video_30_sec_watched_actions));
        binds.push_bind(Json(&row.video_p100_watched_actions));
        binds.push_bind(Json(&row.video_p25_watched_actions));
        binds.push_bind(Json(&row.video_p50_watched_actions));
        binds.push_bind(Json(&row.video_p75_watched_actions));
        binds.push_bind(Json(&row.video_p95_watched_actions));
    });

    query.push(" ON CONFLICT (");
    query.push(&key_columns);
    query.push(") DO UPDATE SET ");
    query.push(assignments);
    query.push(", updated_at = now() RETURNING ");
    query.push(&key_columns);
    query.push(", (xmax = 0) AS was_inserted");
    query
}

fn decode_outcome(row: &PgRow) -> Result<RowOutcome, StoreError> {
    let key = InsightKey {
        date_start: row.try_get("date_start")?,
        date_stop: row.try_get("date_stop")?,
        account_id: row.try_get("account_id")?,
        campaign_id: row.try_get("campaign_id")?,
        adset_id: row.try_get("adset_id")?,
        ad_id: row.try_get("ad_id")?,
        account_name: row.try_get("account_name")?,
        campaign_name: row.try_get("campaign_name")?,
        adset_name: row.try_get("adset_name")?,
        ad_name: row.try_get("ad_name")?,
    };
    let was_inserted: bool = row.try_get("was_inserted")?;
    let action = if was_inserted {
        UpsertAction::Inserted
    } else {
        UpsertAction::Updated
    };
    Ok(RowOutcome { key, action })
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpull_core::{normalize_row, INSIGHT_FIELDS};
    use serde_json::json;

    fn insight(ad_id: u64, clicks: u64) -> AdInsight {
        let value = json!({
            "date_start": "2021-11-01",
            "date_stop": "2021-11-01",
            "account_id": "901",
            "campaign_id": "902",
            "adset_id": "903",
            "ad_id": ad_id.to_string(),
            "ad_name": format!("ad {ad_id}"),
            "clicks": clicks.to_string(),
        });
        let raw = value.as_object().expect("raw row object").clone();
        normalize_row(&raw).expect("sample row normalizes")
    }

    #[test]
    fn dedupe_keeps_the_last_duplicate_at_the_first_position() {
        let rows = vec![insight(1, 10), insight(2, 5), insight(1, 99)];
        let unique = dedupe_by_key(&rows);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].ad_id, 1);
        assert_eq!(unique[0].clicks, Some(99));
        assert_eq!(unique[1].ad_id, 2);
    }

    #[test]
    fn dedupe_leaves_distinct_keys_untouched() {
        let rows = vec![insight(1, 10), insight(2, 5)];
        let unique = dedupe_by_key(&rows);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].ad_id, 1);
        assert_eq!(unique[1].ad_id, 2);
    }

    #[test]
    fn upsert_query_targets_the_natural_key() {
        let rows = vec![insight(7, 3)];
        let refs: Vec<&AdInsight> = rows.iter().collect();
        let query = build_upsert_query(&refs);
        let sql = query.sql();

        assert!(sql.starts_with("INSERT INTO ad_insights (date_start, date_stop, account_id"));
        assert!(sql.contains(
            "ON CONFLICT (date_start, date_stop, account_id, campaign_id, adset_id, ad_id, \
             account_name, campaign_name, adset_name, ad_name) DO UPDATE SET"
        ));
        assert!(sql.contains("clicks = EXCLUDED.clicks"));
        assert!(sql.contains("spend = EXCLUDED.spend"));
        assert!(sql.contains("updated_at = now()"));
        assert!(sql.contains("(xmax = 0) AS was_inserted"));
    }

    #[test]
    fn upsert_query_never_rewrites_key_columns() {
        let rows = vec![insight(7, 3)];
        let refs: Vec<&AdInsight> = rows.iter().collect();
        let query = build_upsert_query(&refs);
        let sql = query.sql();

        for key_column in key_field_names() {
            assert!(
                !sql.contains(&format!("{key_column} = EXCLUDED.{key_column}")),
                "key column {key_column} must not appear in the update set"
            );
        }
    }

    #[test]
    fn schema_declares_every_insight_column() {
        for field in INSIGHT_FIELDS {
            assert!(
                CREATE_TABLE_SQL.contains(&format!("\n    {} ", field.name)),
                "missing column {}",
                field.name
            );
        }
    }

    #[test]
    fn report_counts_follow_row_outcomes() {
        let mut report = UpsertReport::default();
        report.absorb(RowOutcome {
            key: insight(1, 1).key(),
            action: UpsertAction::Inserted,
        });
        report.absorb(RowOutcome {
            key: insight(2, 1).key(),
            action: UpsertAction::Updated,
        });
        report.absorb(RowOutcome {
            key: insight(3, 1).key(),
            action: UpsertAction::Inserted,
        });

        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.total(), 3);
        assert_eq!(report.outcomes.len(), 3);
    }
}
