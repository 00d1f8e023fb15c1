//! Event bus with pluggable sinks and a retained status map.
//!
//! The bus is owned by the application; Works hold a cheap
//! [`StatusReporter`] clone. Sinks are synchronous and must not block: the
//! stdout sink prints, the memory sink appends to a shared vector (handy in
//! tests), and the channel sink forwards into a `flume` channel for
//! streaming consumers.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tracing::debug;

use super::event::{Event, StatusCategory};

/// Destination for bus events.
pub trait EventSink: Send + Sync {
    fn accept(&self, event: &Event);
}

/// Prints every event to stdout.
#[derive(Default)]
pub struct StdOutSink;

impl EventSink for StdOutSink {
    fn accept(&self, event: &Event) {
        println!("{event}");
    }
}

/// Collects events into a shared vector for later inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything accepted so far.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn accept(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards events into a flume channel; disconnected receivers are ignored.
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn accept(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out bus with a retained latest-status line per category.
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink>>,
    retained: RwLock<FxHashMap<StatusCategory, String>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sinks(vec![])
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks,
            retained: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn emit(&self, event: Event) {
        if let Event::Status {
            category, message, ..
        } = &event
        {
            if let Ok(mut retained) = self.retained.write() {
                retained.insert(*category, message.clone());
            }
        }
        debug!(scope = %event.scope_label(), "{}", event.message());
        for sink in &self.sinks {
            sink.accept(&event);
        }
    }

    /// The latest retained status line for a category.
    #[must_use]
    pub fn latest(&self, category: StatusCategory) -> Option<String> {
        self.retained
            .read()
            .ok()
            .and_then(|retained| retained.get(&category).cloned())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap handle Works use to talk to the bus.
#[derive(Clone)]
pub struct StatusReporter {
    bus: Arc<EventBus>,
}

impl StatusReporter {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn set_status(&self, category: StatusCategory, message: impl Into<String>) {
        self.bus.emit(Event::status(category, message));
    }

    pub fn diagnostic(&self, scope: impl Into<String>, message: impl Into<String>) {
        self.bus.emit(Event::diagnostic(scope, message));
    }

    #[must_use]
    pub fn latest(&self, category: StatusCategory) -> Option<String> {
        self.bus.latest(category)
    }
}
