//! Live sessions of a listener, keyed by conv.

use crate::error::SessionError;
use crate::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Concurrent conv -> session map with conv allocation
#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<u32, Arc<Session>>,
    next_conv: AtomicU32,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Empty table; the first conv handed out is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Empty table whose first allocated conv is `first`
    pub fn starting_at(first: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            next_conv: AtomicU32::new(first),
        }
    }

    /// Reserve a fresh conv, build its session and insert it atomically.
    ///
    /// Convs wrap around; values still held by a live session are skipped.
    /// If `build` fails nothing is inserted and the conv is not reused
    /// until the counter wraps.
    pub(crate) fn allocate<F>(&self, build: F) -> Result<Arc<Session>, SessionError>
    where
        F: FnOnce(u32) -> Result<Arc<Session>, SessionError>,
    {
        for _ in 0..=u64::from(u32::MAX) {
            let conv = self.next_conv.fetch_add(1, Ordering::Relaxed);
            match self.sessions.entry(conv) {
                Entry::Occupied(_) => debug!("conv {} still in use, skipping", conv),
                Entry::Vacant(slot) => {
                    let session = build(conv)?;
                    slot.insert(session.clone());
                    return Ok(session);
                }
            }
        }
        Err(SessionError::ConvExhausted)
    }

    /// Session registered under `conv`
    pub fn get(&self, conv: u32) -> Option<Arc<Session>> {
        self.sessions.get(&conv).map(|entry| entry.value().clone())
    }

    /// Remove `conv`, but only while it still maps to `session`
    pub fn remove(&self, conv: u32, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(&conv, |_, current| std::ptr::eq(Arc::as_ptr(current), session))
            .is_some();
        if removed {
            debug!("removed session {} ({} left)", conv, self.sessions.len());
        }
        removed
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Convs of all live sessions
    pub fn convs(&self) -> Vec<u32> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of all live sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
