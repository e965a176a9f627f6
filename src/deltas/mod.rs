use crate::models::{FieldValue, OutputRecord};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};

/// delta field -> cumulative counter field
pub type DeltaSpec = BTreeMap<String, String>;

/// Last seen total per cumulative counter
#[derive(Debug, Clone, Default)]
pub struct CounterState {
    totals: HashMap<String, f64>,
}

impl CounterState {
    pub fn new() -> Self {
        CounterState { totals: HashMap::new() }
    }

    pub fn get(&self, counter: &str) -> Option<f64> {
        self.totals.get(counter).copied()
    }

    pub fn set(&mut self, counter: &str, total: f64) {
        self.totals.insert(counter.to_string(), total);
    }
}

/// Turns cumulative counters like `rain_total` into per record deltas
pub struct DeltaEngine {
    deltas: DeltaSpec,
    counters: CounterState,
}

impl DeltaEngine {
    pub fn new(deltas: DeltaSpec) -> Self {
        DeltaEngine { deltas, counters: CounterState::new() }
    }

    pub fn counters(&self) -> &CounterState {
        &self.counters
    }

    /// Adds a delta field for every configured counter present in the record.
    /// The first value of a counter and any decrement only move the baseline.
    pub fn apply(&mut self, pkt: &mut OutputRecord) {
        for (field, label) in &self.deltas {
            let new_total = match pkt.get(label) {
                Some(v) => v.as_f64(),
                None => continue,
            };

            let new_total = match new_total {
                Some(t) => t,
                None => {
                    warn!("{label} is not a number, no delta for {field}");
                    continue;
                }
            };

            if let Some(delta) = calculate_delta(label, new_total, self.counters.get(label)) {
                pkt.insert(field, FieldValue::Number(delta));
            }
            self.counters.set(label, new_total);
        }
    }
}

fn calculate_delta(label: &str, new_total: f64, old_total: Option<f64>) -> Option<f64> {
    let old_total = old_total?;
    if new_total >= old_total {
        return Some(new_total - old_total);
    }
    info!("{label} decrement ignored: new: {new_total} old: {old_total}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::deltas_default;

    fn record(rain_total: f64) -> OutputRecord {
        let mut r = OutputRecord::new();
        r.insert("dateTime", FieldValue::Timestamp(1));
        r.insert("rain_total", FieldValue::Number(rain_total));
        r
    }

    #[test]
    fn test_first_value_is_baseline() {
        let mut engine = DeltaEngine::new(deltas_default());
        let mut r = record(10.0);
        engine.apply(&mut r);
        assert!(!r.contains_key("rain"));
        assert_eq!(engine.counters().get("rain_total"), Some(10.0));
    }

    #[test]
    fn test_monotonic_sequence() {
        let mut engine = DeltaEngine::new(deltas_default());
        let totals = [1.0, 1.5, 1.5, 4.0, 10.25];
        let mut seen = Vec::new();
        for t in totals {
            let mut r = record(t);
            engine.apply(&mut r);
            seen.push(r.get("rain").cloned());
        }
        assert_eq!(
            seen,
            vec![
                None,
                Some(FieldValue::Number(0.5)),
                Some(FieldValue::Number(0.0)),
                Some(FieldValue::Number(2.5)),
                Some(FieldValue::Number(6.25)),
            ]
        );
    }

    #[test]
    fn test_decrement_resets_baseline() {
        let mut engine = DeltaEngine::new(deltas_default());
        for (total, expected) in [(5.0, None), (7.0, Some(2.0)), (1.0, None), (3.0, Some(2.0))] {
            let mut r = record(total);
            engine.apply(&mut r);
            assert_eq!(r.get("rain").and_then(|v| v.as_f64()), expected);
            assert_eq!(engine.counters().get("rain_total"), Some(total));
        }
    }

    #[test]
    fn test_counter_not_in_record() {
        let mut engine = DeltaEngine::new(deltas_default());
        let mut r = OutputRecord::new();
        r.insert("temp3", FieldValue::Number(20.0));
        engine.apply(&mut r);
        assert_eq!(r.len(), 1);
        assert_eq!(engine.counters().get("strikes_total"), None);
    }

    #[test]
    fn test_custom_spec_replaces_default() {
        let mut spec = DeltaSpec::new();
        spec.insert("pulses".to_string(), "pulse_count".to_string());
        let mut engine = DeltaEngine::new(spec);

        let mut r = OutputRecord::new();
        r.insert("pulse_count", FieldValue::Integer(100));
        r.insert("rain_total", FieldValue::Number(3.0));
        engine.apply(&mut r);

        let mut r = OutputRecord::new();
        r.insert("pulse_count", FieldValue::Integer(104));
        r.insert("rain_total", FieldValue::Number(4.0));
        engine.apply(&mut r);

        assert_eq!(r.get("pulses"), Some(&FieldValue::Number(4.0)));
        assert!(!r.contains_key("rain"));
    }

    #[test]
    fn test_text_counter_is_skipped() {
        let mut engine = DeltaEngine::new(deltas_default());
        let mut r = OutputRecord::new();
        r.insert("rain_total", FieldValue::Text("n/a".to_string()));
        engine.apply(&mut r);
        assert!(!r.contains_key("rain"));
        assert_eq!(engine.counters().get("rain_total"), None);
    }
}
