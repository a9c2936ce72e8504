//! `x-death` header helper, §6. Surrounding functionality treated as an
//! external collaborator per spec.md §1, but its contract with the core is
//! small enough to implement directly: sum `count` fields across header
//! entries, optionally filtered by queue/exchange/routing-key membership.
//! Grounded on the teacher's own header-inspection code in
//! `subscriber.rs::retry_count_from_headers`, which reads a custom header
//! out of a `lapin::types::FieldTable` the same way.

use lapin::types::{AMQPValue, FieldTable};

#[derive(Debug, Clone, Default)]
pub struct XDeathEntry {
    pub count: i64,
    pub reason: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_keys: Vec<String>,
}

/// Parses the `x-death` header, which the broker represents as an array of
/// field tables (one per dead-lettering hop).
pub fn parse(headers: &Option<FieldTable>) -> Vec<XDeathEntry> {
    let Some(headers) = headers.as_ref() else {
        return Vec::new();
    };
    let Some(value) = headers.inner().get("x-death") else {
        return Vec::new();
    };
    match value {
        AMQPValue::FieldArray(arr) => arr.as_slice().iter().filter_map(parse_entry).collect(),
        AMQPValue::FieldTable(table) => parse_entry(&AMQPValue::FieldTable(table.clone())).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_entry(value: &AMQPValue) -> Option<XDeathEntry> {
    let AMQPValue::FieldTable(table) = value else {
        return None;
    };
    let inner = table.inner();

    let count = match inner.get("count") {
        Some(AMQPValue::LongLongInt(n)) => *n,
        Some(AMQPValue::LongInt(n)) => *n as i64,
        Some(AMQPValue::LongUInt(n)) => *n as i64,
        _ => 0,
    };
    let reason = match inner.get("reason") {
        Some(AMQPValue::LongString(s)) => Some(s.to_string()),
        _ => None,
    };
    let queue = match inner.get("queue") {
        Some(AMQPValue::LongString(s)) => Some(s.to_string()),
        _ => None,
    };
    let exchange = match inner.get("exchange") {
        Some(AMQPValue::LongString(s)) => Some(s.to_string()),
        _ => None,
    };
    let routing_keys = match inner.get("routing-keys") {
        Some(AMQPValue::FieldArray(arr)) => arr
            .as_slice()
            .iter()
            .filter_map(|v| match v {
                AMQPValue::LongString(s) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(XDeathEntry {
        count,
        reason,
        queue,
        exchange,
        routing_keys,
    })
}

/// Sums `count` across entries, optionally filtered by `queue`, `exchange`,
/// or membership in `routing_keys`.
pub fn total_count(entries: &[XDeathEntry], queue: Option<&str>, exchange: Option<&str>, routing_key: Option<&str>) -> i64 {
    entries
        .iter()
        .filter(|e| queue.map_or(true, |q| e.queue.as_deref() == Some(q)))
        .filter(|e| exchange.map_or(true, |x| e.exchange.as_deref() == Some(x)))
        .filter(|e| routing_key.map_or(true, |rk| e.routing_keys.iter().any(|k| k == rk)))
        .map(|e| e.count)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(count: i64, queue: &str, exchange: &str, routing_keys: &[&str]) -> XDeathEntry {
        XDeathEntry {
            count,
            reason: Some("rejected".into()),
            queue: Some(queue.into()),
            exchange: Some(exchange.into()),
            routing_keys: routing_keys.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn sums_all_entries_without_filter() {
        let entries = vec![entry(1, "q1", "ex", &["rk"]), entry(2, "q2", "ex", &["rk"])];
        assert_eq!(total_count(&entries, None, None, None), 3);
    }

    #[test]
    fn filters_by_queue_and_routing_key() {
        let entries = vec![entry(1, "q1", "ex", &["rk1"]), entry(2, "q2", "ex", &["rk2"])];
        assert_eq!(total_count(&entries, Some("q1"), None, None), 1);
        assert_eq!(total_count(&entries, None, None, Some("rk2")), 2);
        assert_eq!(total_count(&entries, Some("q1"), None, Some("rk2")), 0);
    }
}
