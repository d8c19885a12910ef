//! Fill sequencing.
//!
//! Venues report fills as individual executions that may arrive out of order
//! and may be corrected (same base id, higher revision). The order machine
//! only ever sees cumulative [`FillProgress`], built here from the canonical
//! executions in venue timestamp order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trade::vwap_micros;

/// Cumulative fill state reported for one order at venue time `at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillProgress {
    pub cumulative_quantity: i64,
    pub avg_price_micros: Option<i64>,
    pub at: DateTime<Utc>,
}

/// One execution as seen by fill sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFill {
    pub exec_id_base: String,
    pub exec_revision: i32,
    pub quantity: i64,
    pub price_micros: i64,
    pub executed_at: DateTime<Utc>,
}

/// Keeps only the highest revision per base.
pub fn canonical_fills(execs: &[ExecutionFill]) -> Vec<ExecutionFill> {
    let mut by_base: BTreeMap<&str, &ExecutionFill> = BTreeMap::new();
    for e in execs {
        match by_base.get(e.exec_id_base.as_str()) {
            Some(cur) if cur.exec_revision >= e.exec_revision => {}
            _ => {
                by_base.insert(e.exec_id_base.as_str(), e);
            }
        }
    }
    by_base.into_values().cloned().collect()
}

/// Cumulative progress after each canonical execution, ordered by
/// `(executed_at, exec_id_base)`.
pub fn progress_from_executions(execs: &[ExecutionFill]) -> Vec<FillProgress> {
    let mut canon = canonical_fills(execs);
    canon.sort_by(|a, b| {
        a.executed_at
            .cmp(&b.executed_at)
            .then_with(|| a.exec_id_base.cmp(&b.exec_id_base))
    });

    let mut out = Vec::with_capacity(canon.len());
    let mut seen: Vec<(i64, i64)> = Vec::with_capacity(canon.len());
    let mut cumulative = 0_i64;
    for e in canon {
        cumulative += e.quantity;
        seen.push((e.quantity, e.price_micros));
        out.push(FillProgress {
            cumulative_quantity: cumulative,
            avg_price_micros: vwap_micros(&seen),
            at: e.executed_at,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ex(base: &str, rev: i32, qty: i64, px: i64, sec: u32) -> ExecutionFill {
        ExecutionFill {
            exec_id_base: base.into(),
            exec_revision: rev,
            quantity: qty,
            price_micros: px,
            executed_at: Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, sec).unwrap(),
        }
    }

    #[test]
    fn corrections_replace_earlier_revisions() {
        let fills = vec![ex("E1", 0, 5, 100_000_000, 1), ex("E1", 1, 4, 101_000_000, 2)];
        let canon = canonical_fills(&fills);
        assert_eq!(canon.len(), 1);
        assert_eq!(canon[0].exec_revision, 1);

        // Arrival order does not matter.
        let rev: Vec<_> = fills.into_iter().rev().collect();
        assert_eq!(canonical_fills(&rev), canon);
    }

    #[test]
    fn progress_is_cumulative_in_venue_time_order() {
        let fills = vec![
            ex("E2", 0, 7, 110_000_000, 20),
            ex("E1", 0, 3, 100_000_000, 10),
        ];
        let p = progress_from_executions(&fills);
        assert_eq!(p.len(), 2);
        assert_eq!(p[0].cumulative_quantity, 3);
        assert_eq!(p[0].avg_price_micros, Some(100_000_000));
        assert_eq!(p[1].cumulative_quantity, 10);
        assert_eq!(p[1].avg_price_micros, Some(107_000_000));
        assert!(p[0].at < p[1].at);
    }

    #[test]
    fn empty_input_has_no_progress() {
        assert!(progress_from_executions(&[]).is_empty());
    }
}
