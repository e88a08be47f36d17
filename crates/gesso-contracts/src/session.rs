use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::EventLog;

/// Cooperative cancellation flag shared between a session and the
/// requests it owns.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The session a request is bound to: user identity, interrupt flag,
/// and an optional event log.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
    pub interrupt: InterruptToken,
    pub events: Option<EventLog>,
}

impl Session {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            interrupt: InterruptToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }
}
