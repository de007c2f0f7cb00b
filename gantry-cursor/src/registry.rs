//! Cursor registry - keyed store of live merged cursors.
//!
//! The registry is the only cross-request shared mutable state in the
//! router. A registered cursor is owned exclusively by the registry until it
//! is deleted; an operation touches it only through a checked-out
//! [`PinnedCursor`], and the pin is a scoped lease: dropping it returns the
//! cursor, so no code path can leak a pinned entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use gantry_core::{CursorId, Namespace, Principal};
use thiserror::Error;
use tracing::debug;

use crate::merge::MergeCursor;

/// How many shards a registered cursor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// Exactly one shard; skip/limit were applied remotely.
    SingleTarget,
    /// More than one shard; skip/limit are applied at the router.
    MultiTarget,
}

/// Whether the idle reaper may reclaim a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorLifetime {
    /// Reclaimed after sitting unpinned past the idle timeout.
    Mortal,
    /// Only removed by exhaustion or an explicit kill.
    Immortal,
}

/// Outcome of one drain, decided by the operation returning the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// More results may follow; the cursor goes back to the registry.
    NotExhausted,
    /// Nothing more can be returned; the entry is deleted.
    Exhausted,
}

/// Errors from registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No entry with this identifier.
    #[error("cursor {0} not found")]
    CursorNotFound(CursorId),

    /// The entry is pinned by another operation.
    #[error("cursor {0} is already in use")]
    CursorInUse(CursorId),

    /// The authorization predicate rejected the stored principal.
    #[error("not authorized to access cursor {0}")]
    Unauthorized(CursorId),
}

/// One registry record.
struct CursorEntry {
    /// The cursor itself; `None` while an operation holds the pin.
    cursor: Option<MergeCursor>,
    namespace: Namespace,
    cursor_type: CursorType,
    lifetime: CursorLifetime,
    principal: Option<Principal>,
    last_active: Instant,
}

struct Inner {
    entries: HashMap<CursorId, CursorEntry>,
    next_id: CursorId,
}

/// Process-wide keyed store of live merged cursors.
pub struct CursorRegistry {
    inner: Mutex<Inner>,
}

impl CursorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: CursorId::new(1),
            }),
        }
    }

    /// Stores a cursor and returns its fresh, non-zero identifier.
    pub fn register(
        &self,
        cursor: MergeCursor,
        cursor_type: CursorType,
        lifetime: CursorLifetime,
        principal: Option<Principal>,
        now: Instant,
    ) -> CursorId {
        let namespace = cursor.params().namespace.clone();
        let mut inner = self.inner.lock().expect("registry lock");
        let id = inner.next_id;
        inner.next_id = id.next();
        inner.entries.insert(
            id,
            CursorEntry {
                cursor: Some(cursor),
                namespace: namespace.clone(),
                cursor_type,
                lifetime,
                principal,
                last_active: now,
            },
        );
        debug!(cursor_id = %id, namespace = %namespace, "registered cursor");
        id
    }

    /// Checks a cursor out for exclusive use by one operation.
    ///
    /// The `auth` predicate sees the principal stored at registration and
    /// decides whether the requesting operation may touch the cursor.
    ///
    /// # Errors
    ///
    /// [`RegistryError::CursorNotFound`] if the id is absent,
    /// [`RegistryError::Unauthorized`] if the predicate rejects, and
    /// [`RegistryError::CursorInUse`] if another operation holds the pin.
    pub fn checkout(
        &self,
        id: CursorId,
        now: Instant,
        auth: impl FnOnce(Option<&Principal>) -> bool,
    ) -> Result<PinnedCursor<'_>, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock");
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::CursorNotFound(id))?;

        if !auth(entry.principal.as_ref()) {
            return Err(RegistryError::Unauthorized(id));
        }

        let Some(cursor) = entry.cursor.take() else {
            return Err(RegistryError::CursorInUse(id));
        };
        entry.last_active = now;

        Ok(PinnedCursor {
            registry: self,
            id,
            cursor: Some(cursor),
        })
    }

    /// Removes an unpinned cursor, returning it so the caller can close its
    /// remotes. Works for immortal cursors too: this is the client-initiated
    /// kill.
    ///
    /// # Errors
    ///
    /// [`RegistryError::CursorNotFound`] if the id is absent and
    /// [`RegistryError::CursorInUse`] if an operation holds the pin.
    pub fn kill(&self, id: CursorId) -> Result<MergeCursor, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock");
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::CursorNotFound(id))?;
        if entry.cursor.is_none() {
            return Err(RegistryError::CursorInUse(id));
        }
        let mut entry = inner.entries.remove(&id).expect("entry present");
        debug!(cursor_id = %id, "killed cursor");
        Ok(entry.cursor.take().expect("unpinned entry holds cursor"))
    }

    /// Removes every unpinned mortal cursor idle past `idle_timeout`.
    ///
    /// Returns the reclaimed cursors so the caller can close their remotes.
    pub fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<(CursorId, MergeCursor)> {
        let mut inner = self.inner.lock().expect("registry lock");
        let expired: Vec<CursorId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.lifetime == CursorLifetime::Mortal
                    && entry.cursor.is_some()
                    && now.saturating_duration_since(entry.last_active) > idle_timeout
            })
            .map(|(&id, _)| id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(mut entry) = inner.entries.remove(&id) {
                debug!(cursor_id = %id, namespace = %entry.namespace, "reaped idle cursor");
                if let Some(cursor) = entry.cursor.take() {
                    reaped.push((id, cursor));
                }
            }
        }
        reaped
    }

    /// Returns the cursor type recorded for an entry.
    ///
    /// # Errors
    ///
    /// [`RegistryError::CursorNotFound`] if the id is absent.
    pub fn cursor_type(&self, id: CursorId) -> Result<CursorType, RegistryError> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .entries
            .get(&id)
            .map(|entry| entry.cursor_type)
            .ok_or(RegistryError::CursorNotFound(id))
    }

    /// Returns true if the entry exists and is unpinned.
    #[must_use]
    pub fn is_unpinned(&self, id: CursorId) -> bool {
        let inner = self.inner.lock().expect("registry lock");
        inner.entries.get(&id).is_some_and(|entry| entry.cursor.is_some())
    }

    /// Returns the number of registered cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").entries.len()
    }

    /// Returns true if no cursors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Puts a checked-out cursor back. Exhausted cursors are deleted and
    /// handed back to the caller for remote cleanup.
    fn check_in(
        &self,
        id: CursorId,
        cursor: MergeCursor,
        state: CursorState,
        now: Instant,
    ) -> Option<MergeCursor> {
        let mut inner = self.inner.lock().expect("registry lock");
        match state {
            CursorState::NotExhausted => {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.cursor = Some(cursor);
                    entry.last_active = now;
                    None
                } else {
                    // The entry vanished while pinned; hand the cursor back
                    // so its remotes still get closed.
                    Some(cursor)
                }
            }
            CursorState::Exhausted => {
                inner.entries.remove(&id);
                debug!(cursor_id = %id, "deleted exhausted cursor");
                Some(cursor)
            }
        }
    }
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive, temporary ownership of a registered cursor.
///
/// The pin must be resolved on every exit path: either explicitly via
/// [`Self::return_cursor`], or implicitly on drop, which returns the cursor
/// as not exhausted.
pub struct PinnedCursor<'a> {
    registry: &'a CursorRegistry,
    id: CursorId,
    cursor: Option<MergeCursor>,
}

impl PinnedCursor<'_> {
    /// Returns the pinned cursor's identifier.
    #[must_use]
    pub const fn cursor_id(&self) -> CursorId {
        self.id
    }

    /// Returns the pinned cursor.
    #[must_use]
    pub fn cursor(&self) -> &MergeCursor {
        self.cursor.as_ref().expect("pin holds cursor until returned")
    }

    /// Returns the pinned cursor mutably.
    pub fn cursor_mut(&mut self) -> &mut MergeCursor {
        self.cursor.as_mut().expect("pin holds cursor until returned")
    }

    /// Resolves the pin with the drain outcome.
    ///
    /// Returns the cursor when the entry was deleted, so the caller can
    /// close its remotes; `None` when it went back to the registry.
    pub fn return_cursor(mut self, state: CursorState, now: Instant) -> Option<MergeCursor> {
        let cursor = self.cursor.take().expect("pin holds cursor until returned");
        self.registry.check_in(self.id, cursor, state, now)
    }
}

impl Drop for PinnedCursor<'_> {
    fn drop(&mut self) {
        // A pin abandoned on an error path returns its cursor untouched.
        if let Some(cursor) = self.cursor.take() {
            let _ = self
                .registry
                .check_in(self.id, cursor, CursorState::NotExhausted, Instant::now());
        }
    }
}

impl std::fmt::Debug for PinnedCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCursor")
            .field("id", &self.id)
            .field("returned", &self.cursor.is_none())
            .finish()
    }
}
