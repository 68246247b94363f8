//! Per-phase timeout configuration.

use std::sync::RwLock;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The four network timeout budgets of a server, one per protocol phase.
///
/// Each budget is independently settable at any time. A change applies to
/// connections entering the corresponding phase afterwards; a phase already
/// in progress keeps the budget it was armed with.
#[derive(Debug)]
pub struct TimeoutManager {
    idle_connection: RwLock<Duration>,
    header_wait: RwLock<Duration>,
    entity_body: RwLock<Duration>,
    drain_entity_body: RwLock<Duration>,
}

impl TimeoutManager {
    /// Time a connection may sit idle between requests (or before its first
    /// request) without sending a byte.
    pub fn idle_connection(&self) -> Duration {
        *self.idle_connection.read().unwrap()
    }

    pub fn set_idle_connection(&self, timeout: Duration) {
        *self.idle_connection.write().unwrap() = timeout;
    }

    /// Time allowed between reads once a request's header bytes have started
    /// to arrive but the header block is not yet complete.
    pub fn header_wait(&self) -> Duration {
        *self.header_wait.read().unwrap()
    }

    pub fn set_header_wait(&self, timeout: Duration) {
        *self.header_wait.write().unwrap() = timeout;
    }

    /// Budget for each request-body read. Exceeding it surfaces to the
    /// handler as an I/O failure on the body stream, not as a separate
    /// callback.
    pub fn entity_body(&self) -> Duration {
        *self.entity_body.read().unwrap()
    }

    pub fn set_entity_body(&self, timeout: Duration) {
        *self.entity_body.write().unwrap() = timeout;
    }

    /// Budget for discarding an unread request body before connection reuse,
    /// and for response writes.
    pub fn drain_entity_body(&self) -> Duration {
        *self.drain_entity_body.read().unwrap()
    }

    pub fn set_drain_entity_body(&self, timeout: Duration) {
        *self.drain_entity_body.write().unwrap() = timeout;
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self {
            idle_connection: RwLock::new(DEFAULT_TIMEOUT),
            header_wait: RwLock::new(DEFAULT_TIMEOUT),
            entity_body: RwLock::new(DEFAULT_TIMEOUT),
            drain_entity_body: RwLock::new(DEFAULT_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_five_minutes() {
        let timeouts = TimeoutManager::default();
        assert_eq!(timeouts.idle_connection(), Duration::from_secs(300));
        assert_eq!(timeouts.header_wait(), Duration::from_secs(300));
        assert_eq!(timeouts.entity_body(), Duration::from_secs(300));
        assert_eq!(timeouts.drain_entity_body(), Duration::from_secs(300));
    }

    #[test]
    fn budgets_are_independent() {
        let timeouts = TimeoutManager::default();
        timeouts.set_idle_connection(Duration::from_millis(100));
        assert_eq!(timeouts.idle_connection(), Duration::from_millis(100));
        assert_eq!(timeouts.header_wait(), Duration::from_secs(300));
    }
}
