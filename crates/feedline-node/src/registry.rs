//! Registry of in-flight upstream sessions shared by every connection task.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use feedline_core::{FeedtypeDb, ProductClass};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    Exists(u32),
    #[error("session {0} is not registered")]
    NotFound(u32),
}

/// One registered upstream session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: u32,
    pub version: u32,
    /// Address of the downstream being fed.
    pub peer_addr: String,
    pub class: ProductClass,
    pub is_notifier: bool,
    pub is_primary: bool,
    /// Set to ask the session to stop.
    pub cancel: CancelFlag,
}

/// In-flight session registry.
pub trait SessionRegistry: Clone + Send + Sync + 'static {
    /// Registers a session and returns the class it is granted, which may
    /// be narrower than the one it asked for.
    fn add_session(&self, entry: SessionEntry) -> Result<ProductClass, RegistryError>;

    fn remove_session(&self, id: u32) -> Result<(), RegistryError>;

    fn contains(&self, id: u32) -> bool;

    fn delete_all(&self);

    fn sessions(&self) -> Vec<SessionEntry>;
}

/// Whether every spec of `inner` is covered by a spec of `outer` with the
/// same pattern.
fn is_subset(db: &FeedtypeDb, inner: &ProductClass, outer: &ProductClass) -> bool {
    inner.specs.iter().all(|spec| {
        outer.specs.iter().any(|o| {
            o.pattern == spec.pattern && db.covers(o.feedtype, spec.feedtype).unwrap_or(false)
        })
    })
}

/// Removes from `class` the feedtypes that `other` already covers under the
/// same pattern. A difference the table has no entry for leaves the spec
/// as it was.
fn remove_covered(db: &FeedtypeDb, class: &mut ProductClass, other: &ProductClass) {
    for spec in &mut class.specs {
        for covered in other.specs.iter().filter(|o| o.pattern == spec.pattern) {
            match db.difference(spec.feedtype, covered.feedtype) {
                Ok(rest) => spec.feedtype = rest,
                Err(err) => debug!("Keeping {} beside {}: {}", spec, covered, err),
            }
        }
    }
    class.scrunch();
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<u32, SessionEntry>,
}

/// Process-local registry.
///
/// A new session from the same downstream address, protocol version and
/// kind is narrowed by the classes of the sessions already registered for
/// it. With `anti_dos` set, an existing feeder whose class the new one
/// fully covers is told to stop instead.
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
    feedtypes: Arc<FeedtypeDb>,
    anti_dos: bool,
}

impl MemoryRegistry {
    /// Registry comparing classes over the standard feedtypes.
    pub fn new(anti_dos: bool) -> Self {
        Self::with_feedtypes(anti_dos, Arc::new(FeedtypeDb::standard()))
    }

    pub fn with_feedtypes(anti_dos: bool, feedtypes: Arc<FeedtypeDb>) -> Self {
        Self {
            state: Arc::default(),
            feedtypes,
            anti_dos,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionRegistry for MemoryRegistry {
    fn add_session(&self, entry: SessionEntry) -> Result<ProductClass, RegistryError> {
        let mut state = self.lock();
        if state.entries.contains_key(&entry.id) {
            return Err(RegistryError::Exists(entry.id));
        }
        let mut granted = entry.class.clone();
        let mut superseded = Vec::new();
        for existing in state.entries.values().filter(|e| {
            e.version == entry.version
                && e.peer_addr == entry.peer_addr
                && e.is_notifier == entry.is_notifier
        }) {
            if self.anti_dos
                && !existing.is_notifier
                && is_subset(&self.feedtypes, &existing.class, &granted)
            {
                info!(
                    "Terminating redundant upstream session {} to {}",
                    existing.id, existing.peer_addr
                );
                existing.cancel.cancel();
                superseded.push(existing.id);
            } else {
                remove_covered(&self.feedtypes, &mut granted, &existing.class);
            }
        }
        for id in superseded {
            state.entries.remove(&id);
        }
        let mut registered = entry;
        registered.class = granted.clone();
        state.entries.insert(registered.id, registered);
        Ok(granted)
    }

    fn remove_session(&self, id: u32) -> Result<(), RegistryError> {
        match self.lock().entries.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound(id)),
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.lock().entries.contains_key(&id)
    }

    fn delete_all(&self) {
        let mut state = self.lock();
        for entry in state.entries.values() {
            entry.cancel.cancel();
        }
        if !state.entries.is_empty() {
            warn!("Dropping {} registered sessions", state.entries.len());
        }
        state.entries.clear();
    }

    fn sessions(&self) -> Vec<SessionEntry> {
        self.lock().entries.values().cloned().collect()
    }
}
