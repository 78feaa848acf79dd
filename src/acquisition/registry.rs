//! One session per physical port.
//!
//! Input workers name a connector as their source; every worker naming the same
//! connector gets the same [`SerialSession`] from this registry.

use super::session::SerialSession;
use crate::error::AppResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of open sessions keyed by connector name.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SerialSession>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an existing session if one is already open for the given source.
    pub fn get(&self, source: &str) -> Option<Arc<SerialSession>> {
        self.sessions.read().get(source).cloned()
    }

    /// Get or create the session for `source`.
    ///
    /// `open` runs only when no session exists yet.
    pub fn get_or_open<F>(&self, source: &str, open: F) -> AppResult<Arc<SerialSession>>
    where
        F: FnOnce() -> AppResult<SerialSession>,
    {
        if let Some(session) = self.get(source) {
            tracing::debug!(source, "Reusing shared serial session");
            return Ok(session);
        }

        let mut sessions = self.sessions.write();
        // Another caller may have opened it between the two locks.
        if let Some(session) = sessions.get(source) {
            return Ok(session.clone());
        }
        let session = Arc::new(open()?);
        sessions.insert(source.to_string(), session.clone());
        tracing::info!(source, "Registered new serial session");
        Ok(session)
    }

    /// Close every session and empty the registry.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.write();
        for session in sessions.values() {
            session.close();
        }
        let count = sessions.len();
        sessions.clear();
        tracing::info!(count, "Closed all serial sessions");
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::device::MockDevice;
    use crate::acquisition::session::SessionConfig;

    fn open(port: &str) -> AppResult<SerialSession> {
        Ok(SerialSession::new(
            port,
            Box::new(MockDevice::new(port)),
            SessionConfig::default(),
        ))
    }

    #[test]
    fn same_source_shares_session() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_open("bmv", || open("/dev/ttyUSB0")).unwrap();
        let b = registry.get_or_open("bmv", || open("/dev/ttyUSB9")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get_or_open("mppt", || open("/dev/ttyUSB1")).unwrap();
        assert_eq!(registry.len(), 2);

        registry.close_all();
        assert!(registry.is_empty());
    }
}
