//! Snapshot materialization: the rule by which the cache becomes an
//! ordered item list per view mode.

use concave_proto::JsonObject;
use serde_json::Value;
use std::cmp::Ordering;

use crate::{
    cache::{Cache, CacheEntry},
    options::{OrderBy, SortDirection, SubscriptionMode},
};

pub(crate) fn materialize(cache: &Cache, mode: SubscriptionMode, order_by: &[OrderBy], id_field: &str) -> Vec<JsonObject> {
    let mut entries: Vec<&CacheEntry> = cache.entries().collect();

    match mode {
        SubscriptionMode::Strict | SubscriptionMode::Sorted | SubscriptionMode::Live => {
            sort_entries(&mut entries, order_by, id_field);
            entries.into_iter().map(|entry| entry.object.clone()).collect()
        }
        SubscriptionMode::Append => {
            let (mut appended, mut base): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| entry.appended_at.is_some());
            sort_entries(&mut base, order_by, id_field);
            appended.sort_by_key(|entry| entry.appended_at);
            base.into_iter().chain(appended).map(|entry| entry.object.clone()).collect()
        }
        SubscriptionMode::Prepend => {
            let (mut prepended, mut base): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| entry.prepended_at.is_some());
            sort_entries(&mut base, order_by, id_field);
            prepended.sort_by_key(|entry| std::cmp::Reverse(entry.prepended_at));
            prepended.into_iter().chain(base).map(|entry| entry.object.clone()).collect()
        }
    }
}

fn sort_entries(entries: &mut [&CacheEntry], order_by: &[OrderBy], id_field: &str) {
    entries.sort_by(|a, b| {
        for OrderBy { field, direction } in order_by {
            let ordering = compare_values(a.object.get(field), b.object.get(field));
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        // stable tiebreak so snapshots do not shuffle between rebuilds
        compare_values(a.object.get(id_field), b.object.get(id_field))
    });
}

/// Value comparison for ordering: null/missing sorts last, numbers by
/// numeric value, strings lexicographically, bools false-first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Number(x), Value::Number(y)) => {
                x.as_f64().unwrap_or(f64::NAN).total_cmp(&y.as_f64().unwrap_or(f64::NAN))
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}
