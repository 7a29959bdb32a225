//! # Aggregation Pipeline Executor
//!
//! Runs a [`QueryPlan`] — an ordered sequence of stage objects — over the
//! store's records. Stages execute sequentially, each consuming the previous
//! stage's output. Plans stay dynamic JSON: operator names and parameter
//! shapes are judged here, at execution time, so a malformed plan surfaces
//! as an [`AggregateError`] rather than a parse failure upstream.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

/// One stage object: a single operator name mapped to its parameters.
pub type Stage = Map<String, Value>;

/// An ordered sequence of stage objects.
///
/// Construction via [`QueryPlan::from_value`] validates structure only
/// (a JSON array of objects); everything deeper is an execution concern.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub stages: Vec<Stage>,
}

impl QueryPlan {
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Array(items) = value else {
            return Err(format!(
                "expected a JSON array of stage objects, got {}",
                json_type(&value)
            ));
        };
        let mut stages = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(map) => stages.push(map),
                other => {
                    return Err(format!(
                        "stage {} is not an object, got {}",
                        i,
                        json_type(&other)
                    ))
                }
            }
        }
        Ok(Self { stages })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.stages.iter().cloned().map(Value::Object).collect())
    }
}

/// A plan rejected at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateError {
    UnknownStage(String),
    UnknownOperator { operator: String, context: String },
    BadStage { operator: String, reason: String },
    Internal(String),
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStage(op) => write!(f, "unrecognized pipeline stage '{}'", op),
            Self::UnknownOperator { operator, context } => {
                write!(f, "unrecognized operator '{}' in {}", operator, context)
            }
            Self::BadStage { operator, reason } => {
                write!(f, "invalid {} stage: {}", operator, reason)
            }
            Self::Internal(msg) => write!(f, "internal aggregation failure: {}", msg),
        }
    }
}

impl std::error::Error for AggregateError {}

/// Execute a plan over a batch of documents.
pub fn execute_plan(docs: Vec<Value>, plan: &QueryPlan) -> Result<Vec<Value>, AggregateError> {
    let mut docs = docs;
    for stage in &plan.stages {
        let mut entries = stage.iter();
        let (op, params) = match (entries.next(), entries.next()) {
            (Some((op, params)), None) => (op.as_str(), params),
            (None, _) => {
                return Err(AggregateError::BadStage {
                    operator: "(empty)".into(),
                    reason: "stage object has no operator".into(),
                })
            }
            (Some((op, _)), Some(_)) => {
                return Err(AggregateError::BadStage {
                    operator: op.clone(),
                    reason: "a stage object must hold exactly one operator".into(),
                })
            }
        };

        docs = match op {
            "$match" => {
                let spec = object_params(op, params)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if eval_match(&doc, spec)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$group" => eval_group(&docs, object_params(op, params)?)?,
            "$sort" => eval_sort(docs, object_params(op, params)?)?,
            "$project" => {
                let spec = object_params(op, params)?;
                let mut projected = Vec::with_capacity(docs.len());
                for doc in &docs {
                    projected.push(eval_project(doc, spec)?);
                }
                projected
            }
            "$limit" => {
                let n = count_params(op, params)?;
                docs.into_iter().take(n).collect()
            }
            "$skip" => {
                let n = count_params(op, params)?;
                docs.into_iter().skip(n).collect()
            }
            "$count" => {
                let name = params.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                    AggregateError::BadStage {
                        operator: "$count".into(),
                        reason: "parameter must be a non-empty field name".into(),
                    }
                })?;
                let mut row = Map::new();
                row.insert(name.to_string(), json!(docs.len()));
                vec![Value::Object(row)]
            }
            other => return Err(AggregateError::UnknownStage(other.to_string())),
        };
    }
    Ok(docs)
}

// =============================================================================
// Native timestamps
// =============================================================================

/// Decode the `{"$date": "<RFC-3339>"}` native timestamp encoding.
pub fn date_literal(value: &Value) -> Option<DateTime<Utc>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let raw = map.get("$date")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Encode an instant as the native timestamp form used inside plans.
pub fn date_value(ts: DateTime<Utc>) -> Value {
    json!({ "$date": ts.to_rfc3339_opts(SecondsFormat::AutoSi, true) })
}

/// Parse a model- or caller-supplied instant. RFC-3339 first, then the
/// common date-only and naive-datetime shorthands, read as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

// =============================================================================
// Value coercion
// =============================================================================

enum Comparable {
    Null,
    Bool(bool),
    Num(f64),
    Time(DateTime<Utc>),
    Str(String),
}

fn comparable(value: &Value) -> Comparable {
    match value {
        Value::Null => Comparable::Null,
        Value::Bool(b) => Comparable::Bool(*b),
        Value::Number(n) => Comparable::Num(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Comparable::Time(dt.with_timezone(&Utc)),
            Err(_) => Comparable::Str(s.clone()),
        },
        Value::Object(_) => match date_literal(value) {
            Some(dt) => Comparable::Time(dt),
            None => Comparable::Str(value.to_string()),
        },
        Value::Array(_) => Comparable::Str(value.to_string()),
    }
}

fn partial_cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (comparable(a), comparable(b)) {
        (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
        (Comparable::Bool(x), Comparable::Bool(y)) => Some(x.cmp(&y)),
        (Comparable::Num(x), Comparable::Num(y)) => x.partial_cmp(&y),
        (Comparable::Time(x), Comparable::Time(y)) => Some(x.cmp(&y)),
        (Comparable::Str(x), Comparable::Str(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    partial_cmp_values(a, b) == Some(Ordering::Equal)
}

/// Total order for sorting: same-type comparisons first, then a fixed
/// type rank (null < bool < number < timestamp < string).
pub(crate) fn total_cmp_values(a: &Value, b: &Value) -> Ordering {
    if let Some(ord) = partial_cmp_values(a, b) {
        return ord;
    }
    fn rank(c: &Comparable) -> u8 {
        match c {
            Comparable::Null => 0,
            Comparable::Bool(_) => 1,
            Comparable::Num(_) => 2,
            Comparable::Time(_) => 3,
            Comparable::Str(_) => 4,
        }
    }
    rank(&comparable(a)).cmp(&rank(&comparable(b)))
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Emit whole results as integers so counters stay counters in JSON.
fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Value::from(v as i64)
    } else {
        json!(v)
    }
}

/// Dotted-path field lookup (`progress.TOTAL_JOBS_SENT_TO_INDEX` → pointer).
pub(crate) fn field_path(doc: &Value, path: &str) -> Option<Value> {
    let pointer = format!("/{}", path.replace('.', "/"));
    doc.pointer(&pointer).cloned()
}

// =============================================================================
// Stage evaluators
// =============================================================================

fn object_params<'a>(op: &str, params: &'a Value) -> Result<&'a Stage, AggregateError> {
    params.as_object().ok_or_else(|| AggregateError::BadStage {
        operator: op.to_string(),
        reason: format!("parameters must be an object, got {}", json_type(params)),
    })
}

fn count_params(op: &str, params: &Value) -> Result<usize, AggregateError> {
    params
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| AggregateError::BadStage {
            operator: op.to_string(),
            reason: "parameter must be a non-negative integer".into(),
        })
}

fn eval_match(doc: &Value, spec: &Stage) -> Result<bool, AggregateError> {
    for (field, cond) in spec {
        let actual = field_path(doc, field).unwrap_or(Value::Null);
        let operator_doc = cond
            .as_object()
            .filter(|map| map.keys().any(|k| k.starts_with('$')) && date_literal(cond).is_none());

        match operator_doc {
            Some(ops) => {
                for (op, operand) in ops {
                    let holds = match op.as_str() {
                        "$eq" => values_equal(&actual, operand),
                        "$ne" => !values_equal(&actual, operand),
                        "$gte" => matches!(
                            partial_cmp_values(&actual, operand),
                            Some(Ordering::Greater) | Some(Ordering::Equal)
                        ),
                        "$gt" => {
                            partial_cmp_values(&actual, operand) == Some(Ordering::Greater)
                        }
                        "$lte" => matches!(
                            partial_cmp_values(&actual, operand),
                            Some(Ordering::Less) | Some(Ordering::Equal)
                        ),
                        "$lt" => partial_cmp_values(&actual, operand) == Some(Ordering::Less),
                        "$in" => {
                            let options =
                                operand.as_array().ok_or_else(|| AggregateError::BadStage {
                                    operator: "$match".into(),
                                    reason: format!("$in on '{}' requires an array", field),
                                })?;
                            options.iter().any(|o| values_equal(&actual, o))
                        }
                        other => {
                            return Err(AggregateError::UnknownOperator {
                                operator: other.to_string(),
                                context: format!("$match on field '{}'", field),
                            })
                        }
                    };
                    if !holds {
                        return Ok(false);
                    }
                }
            }
            None => {
                if !values_equal(&actual, cond) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

fn eval_group(docs: &[Value], spec: &Stage) -> Result<Vec<Value>, AggregateError> {
    let id_expr = spec.get("_id").ok_or_else(|| AggregateError::BadStage {
        operator: "$group".into(),
        reason: "missing _id".into(),
    })?;

    // Buckets keep first-seen order so output is deterministic.
    let mut keys: Vec<Value> = Vec::new();
    let mut buckets: Vec<Vec<&Value>> = Vec::new();
    for doc in docs {
        let key = eval_expr(doc, id_expr)?;
        match keys.iter().position(|k| k == &key) {
            Some(i) => buckets[i].push(doc),
            None => {
                keys.push(key);
                buckets.push(vec![doc]);
            }
        }
    }

    let mut out = Vec::with_capacity(keys.len());
    for (key, bucket) in keys.into_iter().zip(buckets) {
        let mut row = Map::new();
        row.insert("_id".into(), key);
        for (name, acc) in spec {
            if name == "_id" {
                continue;
            }
            row.insert(name.clone(), eval_accumulator(&bucket, acc, name)?);
        }
        out.push(Value::Object(row));
    }
    Ok(out)
}

fn eval_accumulator(
    bucket: &[&Value],
    acc: &Value,
    field: &str,
) -> Result<Value, AggregateError> {
    let map = acc.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
        AggregateError::BadStage {
            operator: "$group".into(),
            reason: format!(
                "accumulator for '{}' must be an object with exactly one operator",
                field
            ),
        }
    })?;
    let (op, expr) = map.iter().next().unwrap();

    let mut values = Vec::with_capacity(bucket.len());
    for doc in bucket {
        values.push(eval_expr(doc, expr)?);
    }

    match op.as_str() {
        "$sum" => {
            let total: f64 = values.iter().filter_map(value_to_f64).sum();
            Ok(number_value(total))
        }
        "$avg" => {
            let nums: Vec<f64> = values.iter().filter_map(value_to_f64).collect();
            if nums.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(number_value(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        "$min" => Ok(values
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| total_cmp_values(a, b))
            .cloned()
            .unwrap_or(Value::Null)),
        "$max" => Ok(values
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| total_cmp_values(a, b))
            .cloned()
            .unwrap_or(Value::Null)),
        "$first" => Ok(values.first().cloned().unwrap_or(Value::Null)),
        "$last" => Ok(values.last().cloned().unwrap_or(Value::Null)),
        other => Err(AggregateError::UnknownOperator {
            operator: other.to_string(),
            context: format!("$group accumulator '{}'", field),
        }),
    }
}

/// Value expression: `"$field.path"` reference, arithmetic operator object,
/// native timestamp, or literal.
fn eval_expr(doc: &Value, expr: &Value) -> Result<Value, AggregateError> {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            Ok(field_path(doc, &s[1..]).unwrap_or(Value::Null))
        }
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            if date_literal(expr).is_some() {
                return Ok(expr.clone());
            }
            if map.len() != 1 {
                return Err(AggregateError::BadStage {
                    operator: "$expression".into(),
                    reason: "expression object must hold exactly one operator".into(),
                });
            }
            let (op, operands) = map.iter().next().unwrap();
            let operands = operands.as_array().ok_or_else(|| AggregateError::BadStage {
                operator: op.clone(),
                reason: "arithmetic operators take an array of operands".into(),
            })?;

            let mut nums = Vec::with_capacity(operands.len());
            for operand in operands {
                nums.push(value_to_f64(&eval_expr(doc, operand)?));
            }
            if nums.iter().any(Option::is_none) {
                return Ok(Value::Null);
            }
            let nums: Vec<f64> = nums.into_iter().flatten().collect();

            match op.as_str() {
                "$add" => Ok(number_value(nums.iter().sum())),
                "$subtract" => {
                    if nums.len() != 2 {
                        return Err(AggregateError::BadStage {
                            operator: "$subtract".into(),
                            reason: "takes exactly two operands".into(),
                        });
                    }
                    Ok(number_value(nums[0] - nums[1]))
                }
                "$multiply" => Ok(number_value(nums.iter().product())),
                "$divide" => {
                    if nums.len() != 2 {
                        return Err(AggregateError::BadStage {
                            operator: "$divide".into(),
                            reason: "takes exactly two operands".into(),
                        });
                    }
                    if nums[1] == 0.0 {
                        Ok(Value::Null)
                    } else {
                        Ok(number_value(nums[0] / nums[1]))
                    }
                }
                other => Err(AggregateError::UnknownOperator {
                    operator: other.to_string(),
                    context: "value expression".into(),
                }),
            }
        }
        literal => Ok(literal.clone()),
    }
}

fn eval_project(doc: &Value, spec: &Stage) -> Result<Value, AggregateError> {
    let mut out = Map::new();

    // _id rides along unless the projection says otherwise.
    if !spec.contains_key("_id") {
        if let Some(id) = field_path(doc, "_id") {
            out.insert("_id".into(), id);
        }
    }

    for (name, rule) in spec {
        match include_flag(rule) {
            Some(false) => continue,
            Some(true) => {
                if let Some(v) = field_path(doc, name) {
                    out.insert(name.clone(), v);
                }
            }
            None => {
                out.insert(name.clone(), eval_expr(doc, rule)?);
            }
        }
    }
    Ok(Value::Object(out))
}

fn include_flag(rule: &Value) -> Option<bool> {
    match rule {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64() != Some(0.0)),
        _ => None,
    }
}

fn eval_sort(mut docs: Vec<Value>, spec: &Stage) -> Result<Vec<Value>, AggregateError> {
    let mut keys: Vec<(String, bool)> = Vec::with_capacity(spec.len());
    for (field, dir) in spec {
        let ascending = match dir.as_i64() {
            Some(1) => true,
            Some(-1) => false,
            _ => {
                return Err(AggregateError::BadStage {
                    operator: "$sort".into(),
                    reason: format!("direction for '{}' must be 1 or -1", field),
                })
            }
        };
        keys.push((field.clone(), ascending));
    }

    docs.sort_by(|a, b| {
        for (field, ascending) in &keys {
            let av = field_path(a, field).unwrap_or(Value::Null);
            let bv = field_path(b, field).unwrap_or(Value::Null);
            let ord = total_cmp_values(&av, &bv);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(value: Value) -> QueryPlan {
        QueryPlan::from_value(value).unwrap()
    }

    fn docs() -> Vec<Value> {
        vec![
            json!({"transactionSourceName": "ClientA", "timestamp": "2025-06-10T12:00:00Z",
                   "progress": {"TOTAL_JOBS_SENT_TO_INDEX": 1200}, "recordCount": 10}),
            json!({"transactionSourceName": "ClientA", "timestamp": "2025-06-20T12:00:00Z",
                   "progress": {"TOTAL_JOBS_SENT_TO_INDEX": 3000}, "recordCount": 30}),
            json!({"transactionSourceName": "ClientB", "timestamp": "2025-07-02T12:00:00Z",
                   "progress": {"TOTAL_JOBS_SENT_TO_INDEX": 500}, "recordCount": 20}),
        ]
    }

    #[test]
    fn test_from_value_rejects_non_array() {
        assert!(QueryPlan::from_value(json!({"$match": {}})).is_err());
        assert!(QueryPlan::from_value(json!([1, 2])).is_err());
        assert!(QueryPlan::from_value(json!([{"$match": {}}])).is_ok());
    }

    #[test]
    fn test_match_equality_and_range() {
        let p = plan(json!([{"$match": {
            "transactionSourceName": "ClientA",
            "timestamp": {"$gte": {"$date": "2025-06-01T00:00:00Z"},
                           "$lt": {"$date": "2025-07-01T00:00:00Z"}}
        }}]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_match_string_bound_still_compares_as_instant() {
        // An un-normalized string bound must behave chronologically too.
        let p = plan(json!([{"$match": {"timestamp": {"$gte": "2025-07-01T00:00:00Z"}}}]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_group_sum_over_nested_counter() {
        let p = plan(json!([
            {"$match": {"transactionSourceName": "ClientA"}},
            {"$group": {"_id": null, "total": {"$sum": "$progress.TOTAL_JOBS_SENT_TO_INDEX"}}}
        ]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out, vec![json!({"_id": null, "total": 4200})]);
    }

    #[test]
    fn test_group_by_field_with_avg_and_count() {
        let p = plan(json!([{"$group": {
            "_id": "$transactionSourceName",
            "count": {"$sum": 1},
            "average": {"$avg": "$recordCount"}
        }}]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], json!({"_id": "ClientA", "count": 2, "average": 20}));
        assert_eq!(out[1], json!({"_id": "ClientB", "count": 1, "average": 20}));
    }

    #[test]
    fn test_delta_pipeline_first_last_subtract() {
        let p = plan(json!([
            {"$sort": {"timestamp": 1}},
            {"$group": {
                "_id": "$transactionSourceName",
                "first": {"$first": "$progress.TOTAL_JOBS_SENT_TO_INDEX"},
                "last": {"$last": "$progress.TOTAL_JOBS_SENT_TO_INDEX"},
                "count": {"$sum": 1}
            }},
            {"$project": {"delta": {"$subtract": ["$last", "$first"]},
                           "first": 1, "last": 1, "count": 1}},
            {"$sort": {"delta": -1}}
        ]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out[0]["_id"], json!("ClientA"));
        assert_eq!(out[0]["delta"], json!(1800));
        assert_eq!(out[1]["delta"], json!(0));
    }

    #[test]
    fn test_sort_limit_skip_count() {
        let p = plan(json!([
            {"$sort": {"recordCount": -1}},
            {"$skip": 1},
            {"$limit": 1},
            {"$count": "n"}
        ]));
        let out = execute_plan(docs(), &p).unwrap();
        assert_eq!(out, vec![json!({"n": 1})]);
    }

    #[test]
    fn test_project_preserves_group_id_and_suppresses_on_zero() {
        let rows = vec![json!({"_id": "ClientA", "total": 5})];
        let keep = plan(json!([{"$project": {"total": 1}}]));
        assert_eq!(
            execute_plan(rows.clone(), &keep).unwrap(),
            vec![json!({"_id": "ClientA", "total": 5})]
        );
        let drop = plan(json!([{"$project": {"_id": 0, "total": 1}}]));
        assert_eq!(
            execute_plan(rows, &drop).unwrap(),
            vec![json!({"total": 5})]
        );
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let p = plan(json!([{"$facet": {"a": []}}]));
        let err = execute_plan(docs(), &p).unwrap_err();
        assert_eq!(err, AggregateError::UnknownStage("$facet".into()));
    }

    #[test]
    fn test_unknown_match_operator_is_rejected() {
        let p = plan(json!([{"$match": {"recordCount": {"$regexx": "x"}}}]));
        let err = execute_plan(docs(), &p).unwrap_err();
        assert!(matches!(err, AggregateError::UnknownOperator { .. }));
    }

    #[test]
    fn test_multi_operator_stage_is_rejected() {
        let p = plan(json!([{"$match": {}, "$limit": 1}]));
        assert!(matches!(
            execute_plan(docs(), &p),
            Err(AggregateError::BadStage { .. })
        ));
    }

    #[test]
    fn test_date_literal_roundtrip() {
        let ts = DateTime::parse_from_rfc3339("2025-07-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(date_literal(&date_value(ts)), Some(ts));
        assert_eq!(date_literal(&json!("2025-07-01T00:00:00Z")), None);
        assert_eq!(date_literal(&json!({"$date": "garbage"})), None);
    }
}
