//! Batch planner
//!
//! Turns one [`BatchRequest`] into the chunk tasks that will load it:
//!
//! 1. Build the filter clause (caller clause, recency window)
//! 2. Rewrite prefixed column aliases (`w_chgdate` -> `w.chgdate`)
//! 3. Run the identifier query and normalise the keys
//! 4. Chunk the keys without splitting compound-key groups
//! 5. Render one selector per chunk

pub mod chunking;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

use crate::bus::{BatchRequest, ChunkTask, Project};
use crate::codec::scalar::EXCEL_UNIX_EPOCH_DAY;
use crate::definition::AssetDefinition;
use crate::error::{WorkerError, WorkerResult};
use crate::source::{SourceRow, SourceStore};
pub use chunking::{chunk_ids, in_clause, IdKey};

/// Output of planning one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub batch_id: String,
    pub chunks: Vec<ChunkTask>,
}

/// Deterministic batch id: digest of the request's lowercased JSON
pub fn batch_id(request: &BatchRequest) -> WorkerResult<String> {
    let json = serde_json::to_string(request)?;
    Ok(purr_common::hashify(&json))
}

/// Current time as a spreadsheet day number
pub fn excel_now() -> f64 {
    to_excel_days(Utc::now())
}

/// Spreadsheet day number of `at`, fractional part included
pub fn to_excel_days(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 86_400_000.0 + EXCEL_UNIX_EPOCH_DAY
}

/// `WHERE 1=1 [AND <caller clause>] [AND <recency window>]`.
///
/// The recency window compares `recency_column` against spreadsheet day
/// numbers; the store's `1E30` "no date" sentinel is excluded as an upper
/// bound.
pub fn make_where_clause(request: &BatchRequest, recency_column: &str, now_excel: f64) -> String {
    let mut parts = vec!["WHERE 1=1".to_string()];
    if !request.where_clause.trim().is_empty() {
        parts.push(request.where_clause.clone());
    }
    if request.recency > 0 {
        let since = now_excel - f64::from(request.recency);
        parts.push(format!(
            "{col} >= {since} AND {col} < 1E30",
            col = recency_column,
            since = since
        ));
    }
    parts.join(" AND ")
}

/// Replace the first `_` of a leading declared prefix with `.` in every
/// whitespace-separated token, so select-list aliases resolve to joined
/// table columns in the identifier query.
pub fn dotify_columns<'a>(prefixes: impl IntoIterator<Item = &'a String>, clause: &str) -> WorkerResult<String> {
    let alternatives: Vec<String> = prefixes.into_iter().map(|p| regex::escape(p)).collect();
    if alternatives.is_empty() {
        return Ok(clause.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    let pattern = Regex::new(&format!("^({})", alternatives.join("|")))
        .map_err(|e| WorkerError::config(format!("bad prefix pattern: {}", e)))?;

    let tokens: Vec<String> = clause
        .split_whitespace()
        .map(|token| {
            pattern
                .replace(token, |caps: &regex::Captures<'_>| caps[0].replacen('_', ".", 1))
                .into_owned()
        })
        .collect();
    Ok(tokens.join(" "))
}

/// Normalise identifier-query results.
///
/// Either one row with a comma-separated `keylist`, or one `key` per row.
pub fn parse_id_rows(rows: &[SourceRow]) -> Vec<IdKey> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    if let Some(keylist) = first.get("keylist") {
        if keylist.is_null() {
            return Vec::new();
        }
        return keylist
            .key_text()
            .split(',')
            .filter(|k| !k.trim().is_empty())
            .map(IdKey::parse)
            .collect();
    }

    if first.get("key").is_some() {
        return rows
            .iter()
            .filter_map(|row| row.get("key"))
            .filter(|v| !v.is_null())
            .map(IdKey::from_source)
            .collect();
    }

    warn!(
        columns = ?first.columns().collect::<Vec<_>>(),
        "identifier query returned neither key nor keylist"
    );
    Vec::new()
}

fn require_placeholder(template: &str, placeholder: &str, which: &str) -> WorkerResult<()> {
    if !template.contains(placeholder) {
        return Err(WorkerError::config(format!(
            "{} template does not contain placeholder '{}'",
            which, placeholder
        )));
    }
    Ok(())
}

/// Plan the chunk tasks of one batch.
///
/// Zero identifiers yields a plan with no chunks; the caller treats that as a
/// no-op batch.
pub async fn plan(
    store: &dyn SourceStore,
    request: &BatchRequest,
    definition: &AssetDefinition,
    project: &Project,
    now_excel: f64,
) -> WorkerResult<BatchPlan> {
    if request.chunk == 0 {
        return Err(WorkerError::config("chunk size must be greater than zero"));
    }
    if definition.identifier_keys.is_empty() {
        return Err(WorkerError::config(format!("{} declares no identifier keys", request.asset)));
    }
    let placeholder = definition.purr_where.as_str();
    if placeholder.is_empty() {
        return Err(WorkerError::config(format!("{} declares an empty placeholder", request.asset)));
    }
    require_placeholder(&definition.identifier, placeholder, "identifier")?;
    require_placeholder(&definition.select, placeholder, "select")?;

    let batch_id = batch_id(request)?;

    let filter = make_where_clause(request, &definition.recency_column, now_excel);
    let filter = dotify_columns(definition.prefixes.keys(), &filter)?;

    let id_sql = definition.identifier.replace(placeholder, &filter);
    let rows = store.query(&project.conn, &id_sql).await?;
    let ids = parse_id_rows(&rows);
    let chunked = chunk_ids(&ids, request.chunk);

    let tag = if request.tag.is_empty() {
        project.tag.clone().unwrap_or_default()
    } else {
        request.tag.clone()
    };

    let chunks: Vec<ChunkTask> = chunked
        .iter()
        .map(|ids| {
            let chunk_filter = format!("{} AND {}", filter, in_clause(&definition.identifier_keys, ids));
            let selector = format!("{} {}", definition.select.replace(placeholder, &chunk_filter), definition.order);

            ChunkTask {
                asset: request.asset.clone(),
                tag: tag.clone(),
                batch_id: batch_id.clone(),
                project_id: project.id.clone(),
                project_name: project.name.clone(),
                suite: project.suite.clone(),
                conn: project.conn.clone(),
                selector: selector.trim_end().to_string(),
                prefixes: definition.prefixes.clone(),
                asset_id_keys: definition.asset_id_keys.clone(),
                well_id_keys: definition.well_id_keys.clone(),
                xforms: definition.xforms.clone(),
                purr_delimiter: definition.purr_delimiter.clone(),
                purr_null: definition.purr_null.clone(),
                post_process: definition.post_process.clone(),
            }
        })
        .collect();

    info!(
        batch_id = %batch_id,
        asset = %request.asset,
        project_id = %project.id,
        ids = ids.len(),
        chunks = chunks.len(),
        "planned batch"
    );

    Ok(BatchPlan { batch_id, chunks })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::SourceValue;

    fn request() -> BatchRequest {
        BatchRequest {
            asset: "well".into(),
            chunk: 4,
            recency: 0,
            where_clause: String::new(),
            project_id: "p1".into(),
            suite: "petra".into(),
            tag: "nightly".into(),
            cron: None,
        }
    }

    #[test]
    fn test_excel_days() {
        let epoch = DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(to_excel_days(epoch), 25569.0);

        let noon = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(to_excel_days(noon), 45292.5);

        let now = excel_now();
        assert!((now - to_excel_days(Utc::now())).abs() < 1.0 / 24.0);
    }

    #[test]
    fn test_where_clause_plain() {
        assert_eq!(make_where_clause(&request(), "w.chgdate", 45000.0), "WHERE 1=1");
    }

    #[test]
    fn test_where_clause_with_caller_clause_and_recency() {
        let mut req = request();
        req.where_clause = "w_county = 'WELD'".into();
        req.recency = 14;
        assert_eq!(
            make_where_clause(&req, "w.chgdate", 45000.5),
            "WHERE 1=1 AND w_county = 'WELD' AND w.chgdate >= 44986.5 AND w.chgdate < 1E30"
        );
    }

    #[test]
    fn test_blank_caller_clause_is_skipped() {
        let mut req = request();
        req.where_clause = "   ".into();
        assert_eq!(make_where_clause(&req, "w.chgdate", 1.0), "WHERE 1=1");
    }

    #[test]
    fn test_dotify_columns() {
        let prefixes = vec!["w_".to_string(), "f_".to_string()];
        let out = dotify_columns(&prefixes, "WHERE 1=1 AND w_county = 'WELD' AND f_test_num > 2").unwrap();
        assert_eq!(out, "WHERE 1=1 AND w.county = 'WELD' AND f.test_num > 2");
    }

    #[test]
    fn test_dotify_only_rewrites_leading_prefix() {
        let prefixes = vec!["w_".to_string()];
        let out = dotify_columns(&prefixes, "xw_county = 1").unwrap();
        assert_eq!(out, "xw_county = 1");
    }

    #[test]
    fn test_parse_keylist() {
        let rows = vec![SourceRow::new().with("keylist", SourceValue::Text("1-62,1-82,2-83".into()))];
        assert_eq!(
            parse_id_rows(&rows),
            vec![IdKey::from("1-62"), IdKey::from("1-82"), IdKey::from("2-83")]
        );
    }

    #[test]
    fn test_parse_key_rows() {
        let rows = vec![
            SourceRow::new().with("key", SourceValue::Int(621)),
            SourceRow::new().with("key", SourceValue::Int(826)),
        ];
        assert_eq!(parse_id_rows(&rows), vec![IdKey::Int(621), IdKey::Int(826)]);
    }

    #[test]
    fn test_parse_missing_key_column() {
        let rows = vec![SourceRow::new().with("wsn", SourceValue::Int(1))];
        assert!(parse_id_rows(&rows).is_empty());
        assert!(parse_id_rows(&[]).is_empty());
    }

    #[test]
    fn test_batch_id_is_deterministic_and_content_sensitive() {
        let a = batch_id(&request()).unwrap();
        assert_eq!(a, batch_id(&request()).unwrap());
        assert_eq!(a.len(), 32);

        let mut other = request();
        other.chunk = 5;
        assert_ne!(a, batch_id(&other).unwrap());
    }

    #[test]
    fn test_batch_id_ignores_case() {
        let mut upper = request();
        upper.asset = "WELL".into();
        assert_eq!(batch_id(&upper).unwrap(), batch_id(&request()).unwrap());
    }
}
