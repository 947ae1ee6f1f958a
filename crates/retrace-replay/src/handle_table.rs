//! Recorded-to-live handle virtualization.
//!
//! Records live in an append-only arena; `alive` indexes the records whose objects currently
//! exist, and `by_recorded` keeps every record ever bound to a recorded value so that errors can
//! say *why* a handle does not resolve. Records also remember their owner, so destroying a
//! pool or device finalizes the objects it implicitly frees.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use retrace_format::{ObjectType, RecordedHandle};
use tracing::debug;

use crate::driver::LiveHandle;
use crate::shader_cache::ContentHash;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Alive,
    Destroyed { ordinal: u64 },
    /// Freed implicitly when `owner` was destroyed at `ordinal`.
    FreedWithOwner { ordinal: u64, owner: RecordedHandle },
    /// Still alive when the run ended and released during teardown.
    ReleasedAtTeardown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleRecord {
    pub recorded: RecordedHandle,
    pub object_type: ObjectType,
    pub live: LiveHandle,
    pub created_at: u64,
    pub state: HandleState,
    pub parent: Option<RecordedHandle>,
    pub content: Option<ContentHash>,
}

/// Where a created object came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Origin {
    /// Recorded handle of the object that owns it, such as the pool of a command buffer.
    pub parent: Option<RecordedHandle>,
    /// Structural identity of the object, used to key compiled pipelines.
    pub content: Option<ContentHash>,
}

impl HandleRecord {
    pub fn is_alive(&self) -> bool {
        self.state == HandleState::Alive
    }

    pub fn destroyed_at(&self) -> Option<u64> {
        match self.state {
            HandleState::Destroyed { ordinal } | HandleState::FreedWithOwner { ordinal, .. } => {
                Some(ordinal)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionFailure {
    NeverCreated,
    Destroyed { destroyed_at: u64 },
    FreedWithOwner {
        owner: RecordedHandle,
        destroyed_at: u64,
    },
    ReleasedAtTeardown,
    TypeMismatch {
        expected: ObjectType,
        actual: ObjectType,
    },
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverCreated => f.write_str("no creation of this handle was replayed"),
            Self::Destroyed { destroyed_at } => {
                write!(f, "destroyed at ordinal {destroyed_at}")
            }
            Self::FreedWithOwner {
                owner,
                destroyed_at,
            } => write!(
                f,
                "freed at ordinal {destroyed_at} when its owner {owner} was destroyed"
            ),
            Self::ReleasedAtTeardown => f.write_str("released at teardown"),
            Self::TypeMismatch { expected, actual } => {
                write!(f, "handle is a {actual}, expected a {expected}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error(
        "ordinal {ordinal}: recorded {object_type} handle {recorded} is already alive (created at ordinal {existing})"
    )]
    DuplicateHandle {
        recorded: RecordedHandle,
        object_type: ObjectType,
        ordinal: u64,
        existing: u64,
    },

    #[error(
        "ordinal {ordinal}: live handle {live} issued for recorded {recorded} is still bound to recorded {other}"
    )]
    LiveHandleAliased {
        recorded: RecordedHandle,
        live: LiveHandle,
        other: RecordedHandle,
        ordinal: u64,
    },

    #[error("ordinal {ordinal}: cannot resolve {expected} handle {recorded}: {reason}")]
    Unresolved {
        recorded: RecordedHandle,
        expected: ObjectType,
        ordinal: u64,
        reason: ResolutionFailure,
    },
}

#[derive(Debug, Default)]
pub struct HandleTable {
    records: Vec<HandleRecord>,
    alive: HashMap<RecordedHandle, usize>,
    live_index: HashMap<LiveHandle, usize>,
    by_recorded: HashMap<RecordedHandle, Vec<usize>>,
    /// Owner slot to the slots created under it.
    children: HashMap<usize, Vec<usize>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `recorded` to `live`. The null handle is never registered.
    ///
    /// Enumerated objects (physical devices, queues) are retrieved rather than created, so the
    /// same recorded value legitimately shows up again; re-registration rebinds it.
    pub fn register_created(
        &mut self,
        recorded: RecordedHandle,
        object_type: ObjectType,
        live: LiveHandle,
        ordinal: u64,
    ) -> Result<(), HandleError> {
        self.register_with_origin(recorded, object_type, live, Origin::default(), ordinal)
    }

    /// Like [`register_created`](Self::register_created), also recording the owner and content
    /// of the object. An owner that is not alive leaves the object unowned.
    pub fn register_with_origin(
        &mut self,
        recorded: RecordedHandle,
        object_type: ObjectType,
        live: LiveHandle,
        origin: Origin,
        ordinal: u64,
    ) -> Result<(), HandleError> {
        if recorded.is_null() {
            return Ok(());
        }
        let mut rebound = None;
        if let Some(&slot) = self.alive.get(&recorded) {
            let existing = self.records[slot];
            if !(object_type.is_retrieved() && existing.object_type == object_type) {
                return Err(HandleError::DuplicateHandle {
                    recorded,
                    object_type,
                    ordinal,
                    existing: existing.created_at,
                });
            }
            if existing.live == live {
                return Ok(());
            }
            debug!(%recorded, old = %existing.live, new = %live, "rebinding retrieved handle");
            self.live_index.remove(&existing.live);
            self.records[slot].state = HandleState::Destroyed { ordinal };
            self.alive.remove(&recorded);
            rebound = Some(slot);
        }
        if !live.is_null() {
            if let Some(&slot) = self.live_index.get(&live) {
                return Err(HandleError::LiveHandleAliased {
                    recorded,
                    live,
                    other: self.records[slot].recorded,
                    ordinal,
                });
            }
        }

        let parent = origin.parent.filter(|p| !p.is_null());
        let slot = self.records.len();
        self.records.push(HandleRecord {
            recorded,
            object_type,
            live,
            created_at: ordinal,
            state: HandleState::Alive,
            parent,
            content: origin.content,
        });
        self.alive.insert(recorded, slot);
        if !live.is_null() {
            self.live_index.insert(live, slot);
        }
        self.by_recorded.entry(recorded).or_default().push(slot);
        if let Some(&owner) = parent.and_then(|p| self.alive.get(&p)) {
            self.children.entry(owner).or_default().push(slot);
        }
        // A rebound retrieved handle keeps owning what was created under it.
        if let Some(kids) = rebound.and_then(|old| self.children.remove(&old)) {
            self.children.entry(slot).or_default().extend(kids);
        }
        Ok(())
    }

    fn alive_slot(
        &self,
        recorded: RecordedHandle,
        expected: ObjectType,
        ordinal: u64,
    ) -> Result<usize, HandleError> {
        let unresolved = |reason| HandleError::Unresolved {
            recorded,
            expected,
            ordinal,
            reason,
        };
        match self.alive.get(&recorded) {
            Some(&slot) => {
                let actual = self.records[slot].object_type;
                if actual != expected {
                    return Err(unresolved(ResolutionFailure::TypeMismatch { expected, actual }));
                }
                Ok(slot)
            }
            None => {
                let last = self
                    .by_recorded
                    .get(&recorded)
                    .and_then(|slots| slots.last())
                    .map(|&slot| self.records[slot].state);
                Err(unresolved(match last {
                    Some(HandleState::Destroyed { ordinal }) => ResolutionFailure::Destroyed {
                        destroyed_at: ordinal,
                    },
                    Some(HandleState::FreedWithOwner { ordinal, owner }) => {
                        ResolutionFailure::FreedWithOwner {
                            owner,
                            destroyed_at: ordinal,
                        }
                    }
                    Some(HandleState::ReleasedAtTeardown) => ResolutionFailure::ReleasedAtTeardown,
                    Some(HandleState::Alive) | None => ResolutionFailure::NeverCreated,
                }))
            }
        }
    }

    pub fn resolve(
        &self,
        recorded: RecordedHandle,
        expected: ObjectType,
        ordinal: u64,
    ) -> Result<LiveHandle, HandleError> {
        if recorded.is_null() {
            return Ok(LiveHandle::NULL);
        }
        let slot = self.alive_slot(recorded, expected, ordinal)?;
        Ok(self.records[slot].live)
    }

    /// Structural identity recorded for the alive object bound to `recorded`, if any.
    pub fn content_of(&self, recorded: RecordedHandle) -> Option<ContentHash> {
        self.alive
            .get(&recorded)
            .and_then(|&slot| self.records[slot].content)
    }

    /// Finalizes the record for `recorded` and returns the live handle it was bound to.
    /// Destroying the null handle is a no-op.
    pub fn mark_destroyed(
        &mut self,
        recorded: RecordedHandle,
        expected: ObjectType,
        ordinal: u64,
    ) -> Result<LiveHandle, HandleError> {
        let finalized = self.destroy_with_children(recorded, expected, &[], ordinal)?;
        Ok(finalized.first().map_or(LiveHandle::NULL, |record| record.live))
    }

    /// Finalizes `recorded` together with every alive descendant whose type is in `frees`,
    /// following ownership through freed objects only. Returns the finalized records, the named
    /// object first. The descendants are not released: the driver frees them with their owner.
    pub fn destroy_with_children(
        &mut self,
        recorded: RecordedHandle,
        expected: ObjectType,
        frees: &[ObjectType],
        ordinal: u64,
    ) -> Result<Vec<HandleRecord>, HandleError> {
        if recorded.is_null() {
            return Ok(Vec::new());
        }
        let slot = self.alive_slot(recorded, expected, ordinal)?;
        let mut finalized = vec![self.finalize(slot, HandleState::Destroyed { ordinal })];
        let mut owners = vec![slot];
        while let Some(owner) = owners.pop() {
            let Some(children) = self.children.remove(&owner) else {
                continue;
            };
            for child in children {
                let record = self.records[child];
                if !record.is_alive() || !frees.contains(&record.object_type) {
                    continue;
                }
                let state = HandleState::FreedWithOwner {
                    ordinal,
                    owner: recorded,
                };
                finalized.push(self.finalize(child, state));
                owners.push(child);
            }
        }
        Ok(finalized)
    }

    fn finalize(&mut self, slot: usize, state: HandleState) -> HandleRecord {
        let record = &mut self.records[slot];
        record.state = state;
        let record = *record;
        if self.alive.get(&record.recorded) == Some(&slot) {
            self.alive.remove(&record.recorded);
        }
        if self.live_index.get(&record.live) == Some(&slot) {
            self.live_index.remove(&record.live);
        }
        record
    }

    /// Currently alive records in creation order.
    pub fn snapshot_alive(&self) -> Vec<HandleRecord> {
        let mut slots: Vec<usize> = self.alive.values().copied().collect();
        slots.sort_unstable();
        slots.into_iter().map(|slot| self.records[slot]).collect()
    }

    /// Finalizes every alive record and returns them newest first, for release.
    pub fn drain_alive_reverse(&mut self) -> Vec<HandleRecord> {
        let mut slots: Vec<usize> = self.alive.drain().map(|(_, slot)| slot).collect();
        slots.sort_unstable_by(|a, b| b.cmp(a));
        self.live_index.clear();
        self.children.clear();
        slots
            .into_iter()
            .map(|slot| {
                let record = &mut self.records[slot];
                record.state = HandleState::ReleasedAtTeardown;
                *record
            })
            .collect()
    }

    /// Every record ever bound to `recorded`, oldest first.
    pub fn history(&self, recorded: RecordedHandle) -> Vec<HandleRecord> {
        self.by_recorded
            .get(&recorded)
            .map(|slots| slots.iter().map(|&slot| self.records[slot]).collect())
            .unwrap_or_default()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    /// Number of records ever created.
    pub fn total_records(&self) -> usize {
        self.records.len()
    }
}

/// A [`HandleTable`] shared between queue workers.
#[derive(Debug, Default)]
pub struct SharedHandleTable(Mutex<HandleTable>);

impl SharedHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, HandleTable> {
        // A panicking worker aborts the whole run; the table itself is never left half-updated.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
