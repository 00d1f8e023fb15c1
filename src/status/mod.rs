//! Operator-visible status surface.
//!
//! History work reports progress through a small event bus: Works emit
//! [`Event`]s, the bus fans them out to pluggable sinks, and the latest
//! status line per category is retained so callers (and tests) can read the
//! current surface without consuming a stream.

mod bus;
mod event;

pub use bus::{ChannelSink, EventBus, EventSink, MemorySink, StatusReporter, StdOutSink};
pub use event::{Event, StatusCategory};
