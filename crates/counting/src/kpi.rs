//! Progress and accuracy metrics over a snapshot of items.

use serde::{Deserialize, Serialize};

use crate::item::Item;

/// Restricts aggregation to items of one product line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineFilter {
    #[default]
    All,
    Line(String),
}

impl LineFilter {
    pub fn line(line: impl Into<String>) -> Self {
        LineFilter::Line(line.into())
    }

    pub fn accepts(&self, item: &Item) -> bool {
        match self {
            LineFilter::All => true,
            LineFilter::Line(line) => item.line.eq_ignore_ascii_case(line),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiReport {
    pub total: usize,
    pub counted: usize,
    pub pending: usize,
    pub progress_pct: f64,
    pub exact: usize,
    pub accuracy_pct: f64,
    pub shortages: usize,
    pub overages: usize,
    pub total_with_stock: usize,
}

impl KpiReport {
    /// Recompute every metric from scratch.
    pub fn compute<'a, I>(items: I, filter: &LineFilter) -> KpiReport
    where
        I: IntoIterator<Item = &'a Item>,
    {
        let mut report = KpiReport::default();
        for item in items.into_iter().filter(|i| filter.accepts(i)) {
            report.total += 1;
            if item.has_stock() {
                report.total_with_stock += 1;
            }
            if !item.is_counted() {
                continue;
            }
            report.counted += 1;
            let diff = item.difference();
            if diff == 0.0 {
                report.exact += 1;
            } else if diff < 0.0 {
                report.shortages += 1;
            } else {
                report.overages += 1;
            }
        }
        report.pending = report.total - report.counted;
        report.progress_pct = pct(report.counted, report.total);
        report.accuracy_pct = pct(report.exact, report.counted);
        report
    }
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
