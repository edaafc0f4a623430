//! Section registry
//!
//! Every request the server accepts becomes a section: one transfer with one
//! client, identified by a [`SectionId`] that stays unique among the sections
//! alive at the same time. The registry holds the per-section state the
//! embedder can query from its hooks; an entry disappears once the section's
//! `section_finished` hook has returned.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use crate::file::OpenMode;

/// Longest textual address a section reports (the INET6_ADDRSTRLEN limit)
pub const MAX_ADDRESS_LEN: usize = 46;

/// Identifier of a live section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);

impl SectionId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a section ended, as far as the server knows so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionOutcome {
    /// Still transferring
    Pending,
    /// Every block was exchanged and the file was closed cleanly
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct SectionRecord {
    client: SocketAddr,
    filename: String,
    mode: OpenMode,
    outcome: SectionOutcome,
    error_message: Option<String>,
}

/// Live sections of one server, shared between the listener and its tasks
#[derive(Debug, Default)]
pub struct SectionRegistry {
    next_id: AtomicU32,
    sections: Mutex<HashMap<SectionId, SectionRecord>>,
}

impl SectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SectionId, SectionRecord>> {
        // Records stay consistent even if a holder panicked
        self.sections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_record<T>(&self, id: SectionId, f: impl FnOnce(&mut SectionRecord) -> T) -> Result<T> {
        let mut sections = self.lock();
        let record = sections
            .get_mut(&id)
            .ok_or_else(|| anyhow!("section {} no longer exists", id))?;
        Ok(f(record))
    }

    /// Register a new section and return its id.
    ///
    /// Ids count up from 1, wrap around, and skip any id still in use.
    pub(crate) fn open(&self, client: SocketAddr, filename: String, mode: OpenMode) -> SectionId {
        let mut sections = self.lock();
        let id = loop {
            let candidate = SectionId(self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
            if !sections.contains_key(&candidate) {
                break candidate;
            }
        };

        sections.insert(
            id,
            SectionRecord {
                client,
                filename,
                mode,
                outcome: SectionOutcome::Pending,
                error_message: None,
            },
        );
        id
    }

    /// Record the final outcome of a section
    pub(crate) fn finish(&self, id: SectionId, succeeded: bool) {
        let outcome = if succeeded {
            SectionOutcome::Succeeded
        } else {
            SectionOutcome::Failed
        };
        if self.with_record(id, |record| record.outcome = outcome).is_err() {
            tracing::debug!("Section {} finished after removal", id);
        }
    }

    /// Drop a section; its id becomes invalid
    pub(crate) fn close(&self, id: SectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: SectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Ids of all live sections, in ascending order
    pub fn active(&self) -> Vec<SectionId> {
        let mut ids: Vec<SectionId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn client_addr(&self, id: SectionId) -> Result<SocketAddr> {
        self.with_record(id, |record| record.client)
    }

    pub fn outcome(&self, id: SectionId) -> Result<SectionOutcome> {
        self.with_record(id, |record| record.outcome)
    }

    pub fn filename(&self, id: SectionId) -> Result<String> {
        self.with_record(id, |record| record.filename.clone())
    }

    pub fn mode(&self, id: SectionId) -> Result<OpenMode> {
        self.with_record(id, |record| record.mode)
    }

    /// Message sent to the client if the section is refused or fails to open
    pub fn set_error_message(&self, id: SectionId, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.with_record(id, |record| record.error_message = Some(message))
    }

    pub fn error_message(&self, id: SectionId) -> Result<Option<String>> {
        self.with_record(id, |record| record.error_message.clone())
    }

    /// Borrowed view of one section
    pub fn section(&self, id: SectionId) -> SectionRef<'_> {
        SectionRef { id, registry: self }
    }
}

/// View of one section handed to the server hooks.
///
/// Every query goes back to the registry, so a view outliving its section
/// reports errors instead of stale data.
#[derive(Debug, Clone, Copy)]
pub struct SectionRef<'a> {
    id: SectionId,
    registry: &'a SectionRegistry,
}

impl<'a> SectionRef<'a> {
    /// The id this view was created for, whether or not it is still live
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn get_section_id(&self) -> Result<SectionId> {
        if self.registry.contains(self.id) {
            Ok(self.id)
        } else {
            Err(anyhow!("section {} no longer exists", self.id))
        }
    }

    /// Client address in presentation form (no port)
    pub fn get_client_ip(&self) -> Result<String> {
        let mut ip = self.registry.client_addr(self.id)?.ip().to_string();
        ip.truncate(MAX_ADDRESS_LEN);
        Ok(ip)
    }

    pub fn get_client_addr(&self) -> Result<SocketAddr> {
        self.registry.client_addr(self.id)
    }

    pub fn get_section_status(&self) -> Result<SectionOutcome> {
        self.registry.outcome(self.id)
    }

    pub fn set_error_message(&self, message: impl Into<String>) -> Result<()> {
        self.registry.set_error_message(self.id, message)
    }

    pub fn error_message(&self) -> Result<Option<String>> {
        self.registry.error_message(self.id)
    }

    pub fn filename(&self) -> Result<String> {
        self.registry.filename(self.id)
    }

    pub fn mode(&self) -> Result<OpenMode> {
        self.registry.mode(self.id)
    }
}
