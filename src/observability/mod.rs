//! Observability for the sender and the call stack
//!
//! - Structured JSON logging
//! - Typed lifecycle events
//! - Shared sender counters
//!
//! Observability never changes behavior. A failed log write is dropped.
//!
//! ```ignore
//! use aerorepl::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::CatchupComplete, &[("sent", "0/3000000")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsSnapshot, SenderMetrics};

/// Log a lifecycle event at its own severity.
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields.
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_does_not_panic() {
        log_event(Event::ServerListening);
        log_event_with_fields(Event::SenderStart, &[("session", "test")]);
    }
}
