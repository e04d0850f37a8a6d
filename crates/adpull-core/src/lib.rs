//! Canonical ad-insight domain model and wire-row normalization for adpull.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "adpull-core";

/// One raw result row as returned by the reporting API, before coercion.
pub type RawRow = JsonMap<String, Value>;

/// How a declared field is shaped on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    ScalarInt,
    ScalarFloat,
    ScalarString,
    ScalarDate,
    BreakdownList,
}

/// One entry of the declared stored schema.
#[derive(Debug, Clone, Copy)]
pub struct InsightField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub key: bool,
}

const fn decl(name: &'static str, kind: FieldKind, required: bool, key: bool) -> InsightField {
    InsightField {
        name,
        kind,
        required,
        key,
    }
}

/// The full stored schema. Drives request field selection, normalization,
/// and the storage column layout. The ten `key` fields form the natural key.
pub static INSIGHT_FIELDS: &[InsightField] = &[
    decl("date_start", FieldKind::ScalarDate, true, true),
    decl("date_stop", FieldKind::ScalarDate, true, true),
    decl("account_id", FieldKind::ScalarInt, true, true),
    decl("campaign_id", FieldKind::ScalarInt, true, true),
    decl("adset_id", FieldKind::ScalarInt, true, true),
    decl("ad_id", FieldKind::ScalarInt, true, true),
    decl("account_name", FieldKind::ScalarString, false, true),
    decl("campaign_name", FieldKind::ScalarString, false, true),
    decl("adset_name", FieldKind::ScalarString, false, true),
    decl("ad_name", FieldKind::ScalarString, false, true),
    decl("account_currency", FieldKind::ScalarString, false, false),
    decl("actions", FieldKind::BreakdownList, false, false),
    decl("action_values", FieldKind::BreakdownList, false, false),
    decl("clicks", FieldKind::ScalarInt, false, false),
    decl("conversion_rate_ranking", FieldKind::ScalarString, false, false),
    decl("conversion_values", FieldKind::BreakdownList, false, false),
    decl("conversions", FieldKind::BreakdownList, false, false),
    decl("cost_per_action_type", FieldKind::BreakdownList, false, false),
    decl("cost_per_conversion", FieldKind::BreakdownList, false, false),
    decl("cost_per_unique_action_type", FieldKind::BreakdownList, false, false),
    decl("cost_per_unique_click", FieldKind::ScalarFloat, false, false),
    decl("cpc", FieldKind::ScalarFloat, false, false),
    decl("cpm", FieldKind::ScalarFloat, false, false),
    decl("ctr", FieldKind::ScalarFloat, false, false),
    decl("engagement_rate_ranking", FieldKind::ScalarString, false, false),
    decl("frequency", FieldKind::ScalarFloat, false, false),
    decl("impressions", FieldKind::ScalarInt, false, false),
    decl("inline_link_click_ctr", FieldKind::ScalarFloat, false, false),
    decl("inline_link_clicks", FieldKind::ScalarInt, false, false),
    decl("objective", FieldKind::ScalarString, false, false),
    decl("optimization_goal", FieldKind::ScalarString, false, false),
    decl("quality_ranking", FieldKind::ScalarString, false, false),
    decl("reach", FieldKind::ScalarInt, false, false),
    decl("spend", FieldKind::ScalarFloat, false, false),
    decl("unique_actions", FieldKind::BreakdownList, false, false),
    decl("unique_clicks", FieldKind::ScalarInt, false, false),
    decl("unique_ctr", FieldKind::ScalarFloat, false, false),
    decl("unique_link_clicks_ctr", FieldKind::ScalarFloat, false, false),
    decl("video_30_sec_watched_actions", FieldKind::BreakdownList, false, false),
    decl("video_p100_watched_actions", FieldKind::BreakdownList, false, false),
    decl("video_p25_watched_actions", FieldKind::BreakdownList, false, false),
    decl("video_p50_watched_actions", FieldKind::BreakdownList, false, false),
    decl("video_p75_watched_actions", FieldKind::BreakdownList, false, false),
    decl("video_p95_watched_actions", FieldKind::BreakdownList, false, false),
];

pub fn insight_field_names() -> Vec<&'static str> {
    INSIGHT_FIELDS.iter().map(|f| f.name).collect()
}

pub fn key_field_names() -> Vec<&'static str> {
    INSIGHT_FIELDS.iter().filter(|f| f.key).map(|f| f.name).collect()
}

pub fn value_field_names() -> Vec<&'static str> {
    INSIGHT_FIELDS.iter().filter(|f| !f.key).map(|f| f.name).collect()
}

/// One (action_type, value) pair inside a breakdown metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub action_type: String,
    pub value: f64,
}

/// The ten fields that together uniquely identify one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InsightKey {
    pub date_start: NaiveDate,
    pub date_stop: NaiveDate,
    pub account_id: i64,
    pub campaign_id: i64,
    pub adset_id: i64,
    pub ad_id: i64,
    pub account_name: Option<String>,
    pub campaign_name: Option<String>,
    pub adset_name: Option<String>,
    pub ad_name: Option<String>,
}

/// Normalized, fully typed ad-level daily performance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdInsight {
    pub date_start: NaiveDate,
    pub date_stop: NaiveDate,
    pub account_id: i64,
    pub campaign_id: i64,
    pub adset_id: i64,
    pub ad_id: i64,
    pub account_name: Option<String>,
    pub campaign_name: Option<String>,
    pub adset_name: Option<String>,
    pub ad_name: Option<String>,
    pub account_currency: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub action_values: Vec<ActionEntry>,
    pub clicks: Option<i64>,
    pub conversion_rate_ranking: Option<String>,
    #[serde(default)]
    pub conversion_values: Vec<ActionEntry>,
    #[serde(default)]
    pub conversions: Vec<ActionEntry>,
    #[serde(default)]
    pub cost_per_action_type: Vec<ActionEntry>,
    #[serde(default)]
    pub cost_per_conversion: Vec<ActionEntry>,
    #[serde(default)]
    pub cost_per_unique_action_type: Vec<ActionEntry>,
    pub cost_per_unique_click: Option<f64>,
    pub cpc: Option<f64>,
    pub cpm: Option<f64>,
    pub ctr: Option<f64>,
    pub engagement_rate_ranking: Option<String>,
    pub frequency: Option<f64>,
    pub impressions: Option<i64>,
    pub inline_link_click_ctr: Option<f64>,
    pub inline_link_clicks: Option<i64>,
    pub objective: Option<String>,
    pub optimization_goal: Option<String>,
    pub quality_ranking: Option<String>,
    pub reach: Option<i64>,
    pub spend: Option<f64>,
    #[serde(default)]
    pub unique_actions: Vec<ActionEntry>,
    pub unique_clicks: Option<i64>,
    pub unique_ctr: Option<f64>,
    pub unique_link_clicks_ctr: Option<f64>,
    #[serde(default)]
    pub video_30_sec_watched_actions: Vec<ActionEntry>,
    #[serde(default)]
    pub video_p100_watched_actions: Vec<ActionEntry>,
    #[serde(default)]
    pub video_p25_watched_actions: Vec<ActionEntry>,
    #[serde(default)]
    pub video_p50_watched_actions: Vec<ActionEntry>,
    #[serde(default)]
    pub video_p75_watched_actions: Vec<ActionEntry>,
    #[serde(default)]
    pub video_p95_watched_actions: Vec<ActionEntry>,
}

impl AdInsight {
    pub fn key(&self) -> InsightKey {
        InsightKey {
            date_start: self.date_start,
            date_stop: self.date_stop,
            account_id: self.account_id,
            campaign_id: self.campaign_id,
            adset_id: self.adset_id,
            ad_id: self.ad_id,
            account_name: self.account_name.clone(),
            campaign_name: self.campaign_name.clone(),
            adset_name: self.adset_name.clone(),
            ad_name: self.ad_name.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid numeric value: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{field}` is not a YYYY-MM-DD date: {value}")]
    InvalidDate { field: &'static str, value: String },
    #[error("field `{field}` is not a string value")]
    InvalidText { field: &'static str },
    #[error("field `{field}` is not a breakdown list")]
    InvalidBreakdown { field: &'static str },
    #[error("normalized row does not fit the stored schema: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Normalize one raw API row into a typed [`AdInsight`].
///
/// Every declared field is rewritten according to its [`FieldKind`]: numeric
/// strings become numbers (integer-typed fields take whole numbers only),
/// date strings are validated, breakdown element values become numbers, and
/// a missing breakdown field becomes the empty list. Raw fields outside the
/// declared schema are dropped. A missing required field is an error naming
/// the field.
pub fn normalize_row(raw: &RawRow) -> Result<AdInsight, NormalizeError> {
    let mut rewritten = JsonMap::with_capacity(INSIGHT_FIELDS.len());

    for field in INSIGHT_FIELDS {
        match raw.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(NormalizeError::MissingField(field.name));
                }
                if field.kind == FieldKind::BreakdownList {
                    rewritten.insert(field.name.to_string(), Value::Array(Vec::new()));
                }
            }
            Some(value) => {
                rewritten.insert(field.name.to_string(), coerce_value(field, value)?);
            }
        }
    }

    serde_json::from_value(Value::Object(rewritten)).map_err(NormalizeError::from)
}

fn coerce_value(field: &InsightField, value: &Value) -> Result<Value, NormalizeError> {
    match field.kind {
        FieldKind::ScalarInt => coerce_integer(field.name, value),
        FieldKind::ScalarFloat => coerce_number(field.name, value),
        FieldKind::ScalarString => coerce_text(field.name, value),
        FieldKind::ScalarDate => coerce_date(field.name, value),
        FieldKind::BreakdownList => coerce_breakdown(field.name, value),
    }
}

fn coerce_integer(field: &'static str, value: &Value) -> Result<Value, NormalizeError> {
    match value {
        Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
        Value::String(text) => match text.trim().parse::<i64>() {
            Ok(int) => Ok(Value::Number(Number::from(int))),
            Err(_) => Err(NormalizeError::InvalidNumber {
                field,
                value: text.clone(),
            }),
        },
        other => Err(NormalizeError::InvalidNumber {
            field,
            value: other.to_string(),
        }),
    }
}

fn coerce_number(field: &'static str, value: &Value) -> Result<Value, NormalizeError> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Ok(Value::Number(Number::from(int)));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| NormalizeError::InvalidNumber {
                    field,
                    value: text.clone(),
                })
        }
        other => Err(NormalizeError::InvalidNumber {
            field,
            value: other.to_string(),
        }),
    }
}

fn coerce_text(field: &'static str, value: &Value) -> Result<Value, NormalizeError> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        _ => Err(NormalizeError::InvalidText { field }),
    }
}

fn coerce_date(field: &'static str, value: &Value) -> Result<Value, NormalizeError> {
    let Some(text) = value.as_str() else {
        return Err(NormalizeError::InvalidDate {
            field,
            value: value.to_string(),
        });
    };
    match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        Ok(_) => Ok(value.clone()),
        Err(_) => Err(NormalizeError::InvalidDate {
            field,
            value: text.to_string(),
        }),
    }
}

fn coerce_breakdown(field: &'static str, value: &Value) -> Result<Value, NormalizeError> {
    let Value::Array(entries) = value else {
        return Err(NormalizeError::InvalidBreakdown { field });
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let action_type = entry
            .get("action_type")
            .and_then(Value::as_str)
            .ok_or(NormalizeError::InvalidBreakdown { field })?;
        let value_raw = entry
            .get("value")
            .ok_or(NormalizeError::InvalidBreakdown { field })?;
        let value_num = coerce_number(field, value_raw)?;
        out.push(serde_json::json!({
            "action_type": action_type,
            "value": value_num,
        }));
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> RawRow {
        value.as_object().cloned().expect("raw row must be an object")
    }

    fn sample_row() -> RawRow {
        raw(serde_json::json!({
            "date_start": "2021-11-01",
            "date_stop": "2021-11-01",
            "account_id": "1010101",
            "campaign_id": "2020202",
            "adset_id": "3030303",
            "ad_id": "4040404",
            "account_name": "Acme",
            "campaign_name": "Holiday Push",
            "adset_name": "US Broad",
            "ad_name": "Video A",
        }))
    }

    #[test]
    fn field_table_matches_declared_schema() {
        assert_eq!(INSIGHT_FIELDS.len(), 44);
        assert_eq!(key_field_names().len(), 10);
        assert_eq!(
            INSIGHT_FIELDS.iter().filter(|f| f.required).count(),
            6,
            "dates and the four hierarchy ids are required"
        );
        assert_eq!(key_field_names()[0], "date_start");
        assert_eq!(key_field_names()[9], "ad_name");
        assert_eq!(value_field_names().len(), 34);
    }

    #[test]
    fn numeric_strings_and_breakdown_values_are_coerced() {
        let mut row = sample_row();
        row.insert("clicks".into(), serde_json::json!("42"));
        row.insert("spend".into(), serde_json::json!("3.50"));
        row.insert(
            "actions".into(),
            serde_json::json!([{ "action_type": "like", "value": "7" }]),
        );

        let insight = normalize_row(&row).expect("normalizes");
        assert_eq!(insight.clicks, Some(42));
        assert_eq!(insight.spend, Some(3.5));
        assert_eq!(
            insight.actions,
            vec![ActionEntry {
                action_type: "like".into(),
                value: 7.0,
            }]
        );
    }

    #[test]
    fn hierarchy_ids_parse_to_integers() {
        let insight = normalize_row(&sample_row()).expect("normalizes");
        assert_eq!(insight.account_id, 1010101);
        assert_eq!(insight.campaign_id, 2020202);
        assert_eq!(insight.adset_id, 3030303);
        assert_eq!(insight.ad_id, 4040404);
        assert_eq!(insight.date_start, NaiveDate::from_ymd_opt(2021, 11, 1).unwrap());
    }

    #[test]
    fn missing_breakdown_field_becomes_empty_list() {
        let row = sample_row();
        assert!(!row.contains_key("conversions"));

        let insight = normalize_row(&row).expect("normalizes");
        assert!(insight.conversions.is_empty());
        assert!(insight.video_p95_watched_actions.is_empty());
    }

    #[test]
    fn conversions_and_conversion_values_come_from_their_own_fields() {
        let mut row = sample_row();
        row.insert(
            "conversion_values".into(),
            serde_json::json!([{ "action_type": "purchase", "value": "12.5" }]),
        );

        let insight = normalize_row(&row).expect("normalizes");
        assert_eq!(insight.conversion_values.len(), 1);
        assert_eq!(insight.conversion_values[0].value, 12.5);
        assert!(insight.conversions.is_empty());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut row = sample_row();
        row.remove("ad_id");

        let err = normalize_row(&row).expect_err("must fail");
        assert!(matches!(err, NormalizeError::MissingField("ad_id")));
    }

    #[test]
    fn non_numeric_metric_is_an_error() {
        let mut row = sample_row();
        row.insert("clicks".into(), serde_json::json!("not-a-number"));

        let err = normalize_row(&row).expect_err("must fail");
        assert!(matches!(err, NormalizeError::InvalidNumber { field: "clicks", .. }));
    }

    #[test]
    fn fractional_count_is_rejected_naming_the_field() {
        let mut row = sample_row();
        row.insert("clicks".into(), serde_json::json!("42.5"));

        let err = normalize_row(&row).expect_err("must fail");
        assert!(matches!(err, NormalizeError::InvalidNumber { field: "clicks", .. }));

        let mut row = sample_row();
        row.insert("impressions".into(), serde_json::json!(7.25));

        let err = normalize_row(&row).expect_err("must fail");
        assert!(matches!(
            err,
            NormalizeError::InvalidNumber { field: "impressions", .. }
        ));
    }

    #[test]
    fn malformed_date_is_an_error() {
        let mut row = sample_row();
        row.insert("date_stop".into(), serde_json::json!("2021-13-40"));

        let err = normalize_row(&row).expect_err("must fail");
        assert!(matches!(err, NormalizeError::InvalidDate { field: "date_stop", .. }));
    }

    #[test]
    fn undeclared_raw_fields_are_dropped() {
        let mut row = sample_row();
        row.insert("attribution_setting".into(), serde_json::json!("7d_click"));

        let insight = normalize_row(&row).expect("normalizes");
        let serialized = serde_json::to_value(&insight).expect("serializes");
        assert!(serialized.get("attribution_setting").is_none());
    }

    #[test]
    fn natural_key_covers_the_ten_identity_fields() {
        let a = normalize_row(&sample_row()).expect("normalizes");
        let mut second = sample_row();
        second.insert("clicks".into(), serde_json::json!("99"));
        let b = normalize_row(&second).expect("normalizes");

        assert_eq!(a.key(), b.key());

        let mut other_ad = sample_row();
        other_ad.insert("ad_id".into(), serde_json::json!("5050505"));
        let c = normalize_row(&other_ad).expect("normalizes");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn ranking_strings_pass_through_untouched() {
        let mut row = sample_row();
        row.insert("quality_ranking".into(), serde_json::json!("ABOVE_AVERAGE"));
        row.insert("objective".into(), serde_json::json!("OUTCOME_SALES"));

        let insight = normalize_row(&row).expect("normalizes");
        assert_eq!(insight.quality_ranking.as_deref(), Some("ABOVE_AVERAGE"));
        assert_eq!(insight.objective.as_deref(), Some("OUTCOME_SALES"));
    }
}
