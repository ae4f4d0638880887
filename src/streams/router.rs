//! Topic router
//!
//! Binds user callbacks to `table:*:symbol` patterns and fans inbound frames
//! out to every matching binding. Binding a callback and counting it in the
//! [`SubscriptionLedger`] happen in the same call, so the ledger always
//! mirrors the set of bindings.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CallbackError, Error};
use crate::streams::ledger::SubscriptionLedger;
use crate::types::{FrameKey, Topic, TopicPattern};
use crate::websocket::Frame;

/// Result returned by stream callbacks
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Stream callback: `(data, symbol, table)`
pub type StreamCallback = Arc<dyn Fn(&Value, &str, &str) -> CallbackResult + Send + Sync>;

/// Identifier of one callback binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

struct Binding {
    id: BindingId,
    pattern: TopicPattern,
    callback: StreamCallback,
}

/// Outcome of binding a callback to a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub id: BindingId,
    /// Ledger count for the topic after this binding
    pub count: usize,
}

impl Bound {
    /// True when this binding is the first interested listener (0 → 1)
    pub fn is_first(&self) -> bool {
        self.count == 1
    }
}

/// Outcome of dispatching one frame
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Callbacks that ran to completion
    pub delivered: usize,
    /// Failures raised by callbacks, one per failing binding
    pub errors: Vec<Error>,
}

/// Callback bindings indexed by table
#[derive(Default)]
pub struct TopicRouter {
    bindings: HashMap<String, Vec<Binding>>,
    ledger: SubscriptionLedger,
    next_id: u64,
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("bindings", &self.binding_count())
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to every action of `topic` and count it in the ledger
    pub fn bind(&mut self, topic: &Topic, callback: StreamCallback) -> Bound {
        self.next_id += 1;
        let id = BindingId(self.next_id);
        let pattern = topic.pattern();

        debug!(pattern = %pattern, binding = id.0, "Binding stream callback");
        self.bindings
            .entry(topic.table.clone())
            .or_default()
            .push(Binding {
                id,
                pattern,
                callback,
            });

        let count = self.ledger.increment(topic);
        Bound { id, count }
    }

    /// Listener counts for every bound topic
    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Total number of callback bindings
    pub fn binding_count(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    /// Number of bindings matching a frame key
    pub fn matching(&self, key: &FrameKey) -> usize {
        self.bindings
            .get(&key.table)
            .map_or(0, |bindings| {
                bindings.iter().filter(|b| b.pattern.matches(key)).count()
            })
    }

    /// Invoke every callback whose pattern matches the frame
    ///
    /// Callback failures (returned errors and panics) are collected; they never
    /// stop delivery to the remaining bindings.
    pub fn dispatch(&self, frame: &Frame) -> Dispatch {
        let mut outcome = Dispatch::default();
        let Some(bindings) = self.bindings.get(&frame.key.table) else {
            return outcome;
        };

        for binding in bindings.iter().filter(|b| b.pattern.matches(&frame.key)) {
            let callback = &binding.callback;
            let result = catch_unwind(AssertUnwindSafe(|| {
                callback(&frame.data, &frame.key.symbol, &frame.key.table)
            }));

            let failure: Option<CallbackError> = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(panic_message(panic).into()),
            };

            match failure {
                None => outcome.delivered += 1,
                Some(source) => {
                    debug!(
                        topic = %frame.key,
                        binding = binding.id.0,
                        error = %source,
                        "Stream callback failed"
                    );
                    outcome.errors.push(Error::Callback {
                        table: frame.key.table.clone(),
                        symbol: frame.key.symbol.clone(),
                        source,
                    });
                }
            }
        }

        outcome
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("callback panicked: {msg}")
    } else {
        "callback panicked".to_string()
    }
}
