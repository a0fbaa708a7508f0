//! Timestamp-tolerant comparison of golden records.
//!
//! Replay verification compares two event streams event-by-event. With
//! `ignore_timestamps` (the default) the top-level `ts`/`timestamp`
//! fields and any field named `duration_*` are stripped before deep
//! equality, so only semantic differences count. An event-count
//! mismatch is reported as the first structural difference; otherwise
//! the first per-event diff wins and a bounded tail of further diffs is
//! kept for debugging.

use serde_json::Value;

/// Tuning knobs for [`compare_events`].
#[derive(Clone, Copy, Debug)]
pub struct CompareOptions {
    /// Strip timestamps and durations before comparing.
    pub ignore_timestamps: bool,
    /// Upper bound on retained diffs.
    pub max_diffs: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            ignore_timestamps: true,
            max_diffs: 10,
        }
    }
}

/// One detected difference, anchored to an event index and a field
/// path within that event.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDiff {
    pub index: usize,
    /// Dotted path of the differing field, `$` for the event root,
    /// `$.events` for a stream-length mismatch.
    pub path: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
}

/// Outcome of comparing an actual stream against an expected one.
#[derive(Clone, Debug, Default)]
pub struct CompareReport {
    /// Events that compared equal (leading prefix).
    pub matched_events: usize,
    pub first_diff_index: Option<usize>,
    pub diffs: Vec<EventDiff>,
    pub actual_events: usize,
    pub expected_events: usize,
}

impl CompareReport {
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Compare two event streams.
pub fn compare_events(actual: &[Value], expected: &[Value], opts: CompareOptions) -> CompareReport {
    let mut report = CompareReport {
        actual_events: actual.len(),
        expected_events: expected.len(),
        ..Default::default()
    };

    if actual.len() != expected.len() {
        let index = actual.len().min(expected.len());
        report.first_diff_index = Some(index);
        report.diffs.push(EventDiff {
            index,
            path: "$.events".to_string(),
            expected: Some(Value::from(expected.len())),
            actual: Some(Value::from(actual.len())),
        });
    }

    let mut matched = 0usize;
    let mut prefix_matching = true;
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        if report.diffs.len() >= opts.max_diffs {
            break;
        }
        let (a, e) = if opts.ignore_timestamps {
            (strip_for_compare(a), strip_for_compare(e))
        } else {
            (a.clone(), e.clone())
        };
        let before = report.diffs.len();
        diff_value(i, "$", &a, &e, &mut report.diffs, opts.max_diffs);
        if report.diffs.len() == before {
            if prefix_matching {
                matched += 1;
            }
        } else {
            prefix_matching = false;
            if report.first_diff_index.is_none() {
                report.first_diff_index = Some(i);
            }
        }
    }
    report.matched_events = matched;
    report
}

/// Remove bookkeeping noise: top-level `ts`/`timestamp` and the
/// `replay` marker, plus any `duration_*`-named field at any depth.
/// The replay marker is stripped so a replayed run compares equal to
/// the original it reproduces.
#[must_use]
pub fn strip_for_compare(value: &Value) -> Value {
    fn strip(value: &Value, top_level: bool) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    if top_level && (k == "ts" || k == "timestamp" || k == "replay") {
                        continue;
                    }
                    if k.starts_with("duration_") {
                        continue;
                    }
                    out.insert(k.clone(), strip(v, false));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| strip(v, false)).collect()),
            other => other.clone(),
        }
    }
    strip(value, true)
}

fn diff_value(
    index: usize,
    path: &str,
    actual: &Value,
    expected: &Value,
    diffs: &mut Vec<EventDiff>,
    max_diffs: usize,
) {
    if diffs.len() >= max_diffs {
        return;
    }
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            let mut keys: Vec<&String> = a.keys().chain(e.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{path}.{key}");
                match (a.get(key), e.get(key)) {
                    (Some(av), Some(ev)) => {
                        diff_value(index, &child, av, ev, diffs, max_diffs);
                    }
                    (av, ev) => {
                        if diffs.len() < max_diffs {
                            diffs.push(EventDiff {
                                index,
                                path: child,
                                expected: ev.cloned(),
                                actual: av.cloned(),
                            });
                        }
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(e)) => {
            if a.len() != e.len() {
                diffs.push(EventDiff {
                    index,
                    path: format!("{path}.length"),
                    expected: Some(Value::from(e.len())),
                    actual: Some(Value::from(a.len())),
                });
                return;
            }
            for (i, (av, ev)) in a.iter().zip(e.iter()).enumerate() {
                diff_value(index, &format!("{path}[{i}]"), av, ev, diffs, max_diffs);
            }
        }
        (a, e) => {
            if a != e {
                diffs.push(EventDiff {
                    index,
                    path: path.to_string(),
                    expected: Some(e.clone()),
                    actual: Some(a.clone()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_streams_match() {
        let a = vec![json!({"event": "run_start", "ts": "2026-01-01T00:00:00Z"})];
        let e = vec![json!({"event": "run_start", "ts": "2026-02-02T00:00:00Z"})];
        let report = compare_events(&a, &e, CompareOptions::default());
        assert!(report.is_match());
        assert_eq!(report.matched_events, 1);
    }

    #[test]
    fn count_mismatch_is_first_diff() {
        let a = vec![json!({"event": "run_start"})];
        let e = vec![json!({"event": "run_start"}), json!({"event": "run_end"})];
        let report = compare_events(&a, &e, CompareOptions::default());
        assert!(!report.is_match());
        assert_eq!(report.first_diff_index, Some(1));
        assert_eq!(report.diffs[0].path, "$.events");
    }

    #[test]
    fn field_diff_has_path() {
        let a = vec![json!({"event": "step", "output": {"v": 1}})];
        let e = vec![json!({"event": "step", "output": {"v": 2}})];
        let report = compare_events(&a, &e, CompareOptions::default());
        assert_eq!(report.first_diff_index, Some(0));
        assert_eq!(report.diffs[0].path, "$.output.v");
    }

    #[test]
    fn duration_fields_are_stripped_at_depth() {
        let a = vec![json!({"event": "step", "meta": {"duration_ms": 5}})];
        let e = vec![json!({"event": "step", "meta": {"duration_ms": 99}})];
        let report = compare_events(&a, &e, CompareOptions::default());
        assert!(report.is_match());
    }

    #[test]
    fn timestamps_count_when_not_ignored() {
        let a = vec![json!({"event": "run_start", "ts": "a"})];
        let e = vec![json!({"event": "run_start", "ts": "b"})];
        let opts = CompareOptions {
            ignore_timestamps: false,
            ..Default::default()
        };
        assert!(!compare_events(&a, &e, opts).is_match());
    }
}
