//! Minimal query evaluation for the in-memory source
//!
//! Supports what the dump engine and its tests issue: top-level and dotted
//! field equality, the comparison operators `$eq`, `$ne`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$in`, `$nin`, `$exists`, the logical `$and`, `$or`,
//! `$nor`, and sort specifications including `$natural`. Any other operator
//! is rejected by [`check_filter`] rather than silently matching nothing.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::{DumpError, Result};

const FIELD_OPERATORS: [&str; 9] = [
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists",
];

const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Reject filters using operators [`matches`] cannot evaluate.
pub fn check_filter(filter: &Document) -> Result<()> {
    for (key, condition) in filter {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let subs = as_documents(condition).ok_or_else(|| {
                DumpError::Generic(format!("{key} requires an array of documents"))
            })?;
            for sub in subs {
                check_filter(sub)?;
            }
        } else if key.starts_with('$') {
            return Err(unsupported(key));
        } else if let Bson::Document(ops) = condition {
            if !is_operator_document(ops) {
                continue;
            }
            for (op, operand) in ops {
                if !FIELD_OPERATORS.contains(&op.as_str()) {
                    return Err(unsupported(op));
                }
                if matches!(op.as_str(), "$in" | "$nin") && !matches!(operand, Bson::Array(_)) {
                    return Err(DumpError::Generic(format!("{op} requires an array")));
                }
            }
        }
    }
    Ok(())
}

fn unsupported(op: &str) -> DumpError {
    DumpError::Generic(format!("unsupported query operator {op}"))
}

/// Evaluate `filter` against `doc`.
///
/// The filter must have passed [`check_filter`].
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => as_documents(condition).is_some_and(|subs| subs.iter().all(|f| matches(doc, f))),
        "$or" => as_documents(condition).is_some_and(|subs| subs.iter().any(|f| matches(doc, f))),
        "$nor" => as_documents(condition).is_some_and(|subs| !subs.iter().any(|f| matches(doc, f))),
        path => matches_field(lookup(doc, path), condition),
    })
}

fn as_documents(value: &Bson) -> Option<Vec<&Document>> {
    match value {
        Bson::Array(items) => items.iter().map(|b| b.as_document()).collect(),
        _ => None,
    }
}

fn matches_field(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        Bson::Document(ops) if is_operator_document(ops) => {
            ops.iter().all(|(op, operand)| apply_operator(value, op, operand))
        }
        expected => value.is_some_and(|v| values_equal(v, expected)),
    }
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn apply_operator(value: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$eq" => value.is_some_and(|v| values_equal(v, operand)),
        "$ne" => !value.is_some_and(|v| values_equal(v, operand)),
        "$gt" => compare_op(value, operand, |o| o == Ordering::Greater),
        "$gte" => compare_op(value, operand, |o| o != Ordering::Less),
        "$lt" => compare_op(value, operand, |o| o == Ordering::Less),
        "$lte" => compare_op(value, operand, |o| o != Ordering::Greater),
        "$in" => in_array(value, operand),
        "$nin" => !in_array(value, operand),
        "$exists" => value.is_some() == !crate::source::bson_is_falsy(Some(operand)),
        // rejected by check_filter
        _ => false,
    }
}

fn in_array(value: Option<&Bson>, operand: &Bson) -> bool {
    match operand {
        Bson::Array(candidates) => {
            value.is_some_and(|v| candidates.iter().any(|c| values_equal(v, c)))
        }
        _ => false,
    }
}

fn compare_op(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    value
        .and_then(|v| compare_values(v, operand))
        .is_some_and(accept)
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

/// Order two BSON values of comparable types.
///
/// Numbers compare across integer and floating point widths. Values of
/// unrelated types are not ordered.
pub fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Direction requested for `$natural` in a sort document, if any.
pub fn natural_direction(sort: &Document) -> Option<i32> {
    crate::source::bson_as_i32(sort.get("$natural"))
}

/// Order two documents by a sort specification (ignoring `$natural`).
pub fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        if field == "$natural" {
            continue;
        }
        let descending = crate::source::bson_as_i32(Some(direction)).is_some_and(|d| d < 0);
        let ordering = match (lookup(a, field), lookup(b, field)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
