use std::sync::Arc;
#[cfg(any(test, feature = "mocks"))]
use std::sync::Mutex;

use log::Level;

/// A structured log-worthy event raised by one of the core components.
///
/// Components decide *what* is worth reporting and at which severity; how it
/// is rendered is up to the `EventSink` they were constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type Sink = Arc<dyn EventSink>;

// shorthand constructors so call sites read like log macros
pub fn debug(message: impl Into<String>) -> Event {
    Event::new(Level::Debug, message)
}

pub fn info(message: impl Into<String>) -> Event {
    Event::new(Level::Info, message)
}

pub fn warn(message: impl Into<String>) -> Event {
    Event::new(Level::Warn, message)
}

pub fn error(message: impl Into<String>) -> Event {
    Event::new(Level::Error, message)
}

/// Forwards events to the `log` facade, rendering fields as `key=value`.
#[derive(Debug, Clone)]
pub struct LogSink {
    target: &'static str,
}

impl LogSink {
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }

    pub fn shared(target: &'static str) -> Sink {
        Arc::new(Self::new(target))
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("growatt_bridge")
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        if event.fields.is_empty() {
            log::log!(target: self.target, event.level, "{}", event.message);
        } else {
            let fields: Vec<String> = event
                .fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            log::log!(
                target: self.target,
                event.level,
                "{} {}",
                event.message,
                fields.join(" ")
            );
        }
    }
}

/// Keeps every event in memory. Used by tests to assert on what a component
/// reported.
#[cfg(any(test, feature = "mocks"))]
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

#[cfg(any(test, feature = "mocks"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, level: Level) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

#[cfg(any(test, feature = "mocks"))]
impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
