//! Subscription ledger
//!
//! Reference counts of live callback bindings per `(table, symbol)`. The
//! ledger decides whether the server has to be asked for a topic: only the
//! 0 → 1 transition sends a subscribe command.

use std::collections::BTreeMap;

use crate::types::Topic;

/// Listener counts keyed by table, then symbol
///
/// Counts are derived from router bindings; only the router mutates them.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLedger {
    counts: BTreeMap<String, BTreeMap<String, usize>>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bindings for `(table, symbol)`, 0 when unseen
    pub fn count(&self, table: &str, symbol: &str) -> usize {
        self.counts
            .get(table)
            .and_then(|symbols| symbols.get(symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Topics with at least one live binding, ordered by table then symbol
    pub fn active_topics(&self) -> Vec<Topic> {
        self.counts
            .iter()
            .flat_map(|(table, symbols)| {
                symbols
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(move |(symbol, _)| Topic::new(table.clone(), symbol.clone()))
            })
            .collect()
    }

    /// Number of topics with live bindings
    pub fn len(&self) -> usize {
        self.counts.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Record one more binding; returns the new count
    pub(crate) fn increment(&mut self, topic: &Topic) -> usize {
        let count = self
            .counts
            .entry(topic.table.clone())
            .or_default()
            .entry(topic.symbol.clone())
            .or_insert(0);
        *count += 1;
        *count
    }
}
