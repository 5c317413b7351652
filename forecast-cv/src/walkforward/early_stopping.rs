//! Early stopping on the relative improvement of the aggregated metric.

use serde::{Deserialize, Serialize};

/// Aggregated validation metric after a cumulative number of rounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub rounds: usize,
    pub metric: f64,
}

/// Evaluations collected while fitting, in the order they were made.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rounds: usize, metric: f64) {
        self.entries.push(HistoryEntry { rounds, metric });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Drop entries evaluated after `best` rounds.
    pub fn truncate_to(&mut self, best: usize) {
        self.entries.retain(|e| e.rounds <= best);
    }
}

/// Stop once the metric improved by less than `pct` (relative) over the
/// last `evals` evaluations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStopping {
    pub evals: usize,
    pub pct: f64,
}

impl EarlyStopping {
    pub fn new(evals: usize, pct: f64) -> Self {
        Self { evals, pct }
    }

    /// Compares the latest metric with the one `evals` evaluations earlier.
    pub fn should_stop(&self, history: &History) -> bool {
        let entries = history.entries();
        if entries.len() < self.evals + 1 {
            return false;
        }
        let latest = entries[entries.len() - 1].metric;
        let reference = entries[entries.len() - 1 - self.evals].metric;
        1.0 - latest / reference < self.pct
    }

    /// Round count with the lowest metric among the last `evals + 1`
    /// entries. Ties go to the earliest entry.
    pub fn best_iteration(&self, history: &History) -> Option<usize> {
        let entries = history.entries();
        let start = entries.len().saturating_sub(self.evals + 1);
        let mut best: Option<&HistoryEntry> = None;
        for entry in &entries[start..] {
            if best.map_or(true, |b| entry.metric < b.metric) {
                best = Some(entry);
            }
        }
        best.map(|e| e.rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(points: &[(usize, f64)]) -> History {
        let mut h = History::new();
        for &(rounds, metric) in points {
            h.push(rounds, metric);
        }
        h
    }

    #[test]
    fn test_stops_when_improvement_falls_below_pct() {
        let es = EarlyStopping::new(2, 0.03);
        let metrics = [1.0, 0.96, 0.95, 0.94];
        let mut h = History::new();
        let mut decisions = Vec::new();
        for (i, m) in metrics.iter().enumerate() {
            h.push((i + 1) * 10, *m);
            decisions.push(es.should_stop(&h));
        }
        // 1 - 0.95 / 1.0 = 0.05 keeps going; 1 - 0.94 / 0.96 ~ 0.021 stops.
        assert_eq!(decisions, vec![false, false, false, true]);
    }

    #[test]
    fn test_never_stops_on_short_history() {
        let es = EarlyStopping::new(3, 0.5);
        assert!(!es.should_stop(&history(&[(10, 1.0), (20, 1.0), (30, 1.0)])));
    }

    #[test]
    fn test_best_iteration_ties_go_to_earliest() {
        let es = EarlyStopping::new(3, 0.01);
        let h = history(&[(10, 0.5), (20, 0.4), (30, 0.4), (40, 0.45)]);
        assert_eq!(es.best_iteration(&h), Some(20));
    }

    #[test]
    fn test_best_iteration_only_looks_at_tail() {
        let es = EarlyStopping::new(1, 0.01);
        let h = history(&[(10, 0.1), (20, 0.4), (30, 0.3)]);
        assert_eq!(es.best_iteration(&h), Some(30));
        assert_eq!(es.best_iteration(&History::new()), None);
    }

    #[test]
    fn test_truncate_to_best() {
        let mut h = history(&[(10, 0.5), (20, 0.4), (30, 0.45)]);
        h.truncate_to(20);
        assert_eq!(h.len(), 2);
        assert_eq!(h.last().unwrap().rounds, 20);
    }
}
