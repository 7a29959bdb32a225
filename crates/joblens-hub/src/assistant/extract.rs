//! # Plan Extraction & Normalization
//!
//! Turns raw model text into an executable [`QueryPlan`]. The text is
//! untrusted: models wrap structured output in prose and code fences despite
//! instructions not to, so extraction tries a fenced block first and falls
//! back to parsing the whole text. Nothing unparsed ever reaches the store.

use joblens_store::aggregate::{date_value, parse_instant};
use joblens_store::QueryPlan;
use regex::Regex;
use serde_json::Value;

const BOUND_KEYS: [&str; 4] = ["$gte", "$gt", "$lte", "$lt"];

/// Extract a query plan from raw model text, or fail with the parser
/// diagnostic. The returned plan has date bounds normalized.
pub fn extract_plan(raw: &str) -> Result<QueryPlan, String> {
    let candidate = fenced_block(raw).unwrap_or_else(|| raw.trim().to_string());
    let value: Value = serde_json::from_str(&candidate).map_err(|e| e.to_string())?;
    let plan = QueryPlan::from_value(value)?;
    Ok(normalize_timestamps(plan))
}

/// The contents of the first fenced code block, optionally tagged `json`.
fn fenced_block(raw: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").ok()?;
    re.captures(raw).map(|caps| caps[1].to_string())
}

/// Convert ISO-8601 string bounds under a `$match` stage's `timestamp`
/// comparison object into native timestamps. Every match stage is scanned,
/// not just the first. Non-string bounds and absent keys pass through, which
/// makes the conversion idempotent.
pub fn normalize_timestamps(mut plan: QueryPlan) -> QueryPlan {
    for stage in &mut plan.stages {
        let Some(Value::Object(match_spec)) = stage.get_mut("$match") else {
            continue;
        };
        let Some(Value::Object(ts)) = match_spec.get_mut("timestamp") else {
            continue;
        };
        for key in BOUND_KEYS {
            let Some(bound) = ts.get_mut(key) else { continue };
            if let Value::String(s) = bound {
                if let Some(instant) = parse_instant(s) {
                    *bound = date_value(instant);
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblens_store::aggregate::date_literal;
    use serde_json::json;

    #[test]
    fn test_fenced_block_with_json_tag() {
        let raw = "Here is the pipeline:\n```json\n[{\"$limit\": 5}]\n```\nHope that helps!";
        let plan = extract_plan(raw).unwrap();
        assert_eq!(plan.to_value(), json!([{"$limit": 5}]));
    }

    #[test]
    fn test_fenced_block_without_tag() {
        let raw = "```\n[{\"$count\": \"n\"}]\n```";
        let plan = extract_plan(raw).unwrap();
        assert_eq!(plan.to_value(), json!([{"$count": "n"}]));
    }

    #[test]
    fn test_bare_json_fallback() {
        let plan = extract_plan("  [{\"$limit\": 1}]  ").unwrap();
        assert_eq!(plan.to_value(), json!([{"$limit": 1}]));
    }

    #[test]
    fn test_prose_without_fence_fails() {
        let err = extract_plan("I cannot answer that question.").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_non_array_fails() {
        assert!(extract_plan("{\"$match\": {}}").is_err());
        assert!(extract_plan("[42]").is_err());
    }

    #[test]
    fn test_first_stage_bounds_become_native() {
        let raw = r#"[{"$match": {"timestamp": {"$gte": "2025-07-01T00:00:00Z"}}}]"#;
        let plan = extract_plan(raw).unwrap();
        let bound = &plan.stages[0]["$match"]["timestamp"]["$gte"];
        let expected = parse_instant("2025-07-01T00:00:00Z").unwrap();
        assert_eq!(date_literal(bound), Some(expected));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let raw = r#"[{"$match": {"timestamp": {"$gte": "2025-07-01T00:00:00Z", "$lt": "2025-08-01T00:00:00Z"}}}]"#;
        let once = extract_plan(raw).unwrap();
        let twice = normalize_timestamps(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_later_match_stages_are_normalized_too() {
        let raw = r#"[{"$sort": {"timestamp": 1}}, {"$match": {"timestamp": {"$lt": "2025-07-01T00:00:00Z"}}}]"#;
        let plan = extract_plan(raw).unwrap();
        let bound = &plan.stages[1]["$match"]["timestamp"]["$lt"];
        assert!(date_literal(bound).is_some());
    }

    #[test]
    fn test_non_string_and_absent_bounds_untouched() {
        let raw = r#"[{"$match": {"timestamp": {"$gte": 1751328000000}, "status": "completed"}}]"#;
        let plan = extract_plan(raw).unwrap();
        assert_eq!(
            plan.stages[0]["$match"]["timestamp"]["$gte"],
            json!(1751328000000u64)
        );
        assert_eq!(plan.stages[0]["$match"]["status"], json!("completed"));
    }

    #[test]
    fn test_unparseable_string_bound_left_as_is() {
        let raw = r#"[{"$match": {"timestamp": {"$gte": "last month"}}}]"#;
        let plan = extract_plan(raw).unwrap();
        assert_eq!(
            plan.stages[0]["$match"]["timestamp"]["$gte"],
            json!("last month")
        );
    }
}
