//! Subscription multiplexing
//!
//! Many callbacks share one connection. The [`TopicRouter`] owns callback
//! bindings and the [`SubscriptionLedger`] counting them; the
//! [`StreamClient`] decides when subscribe commands go out.

mod ledger;
mod multiplexer;
mod router;

pub use ledger::SubscriptionLedger;
pub use multiplexer::{ClientEvent, StreamClient, StreamStatus, Transport};
pub use router::{BindingId, Bound, CallbackResult, Dispatch, StreamCallback, TopicRouter};
