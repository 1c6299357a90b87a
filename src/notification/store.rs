use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::notification::model::{Notification, NotificationKind};

/// Where the history list stands for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Empty,
    Loading,
    Loaded,
}

/// Issued when a history fetch starts; its result is only applied if the
/// session that issued it is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
    live_mark: u64,
}

#[derive(Debug, Clone)]
pub enum Action {
    LoadStarted,
    LoadCompleted {
        ticket: LoadTicket,
        records: Vec<Notification>,
    },
    LoadFailed {
        ticket: LoadTicket,
    },
    PushLive(Notification),
    MarkRead(String),
    MarkAllRead,
    Remove(String),
    Clear,
    AcknowledgeNew,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    Unchanged,
    /// The action belonged to a session that has since been reset.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    History,
    Live(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    record: Notification,
    origin: Origin,
}

#[derive(Debug, Default)]
pub struct StoreState {
    epoch: u64,
    phase: LoadPhase,
    entries: Vec<Entry>,
    live_seq: u64,
    has_new: bool,
    // Fetches of this epoch that have not yet completed or failed.
    pending_loads: usize,
    // Whether any fetch of this epoch has landed.
    loaded: bool,
}

impl StoreState {
    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            epoch: self.epoch,
            phase: self.phase,
            records: self.entries.iter().map(|e| e.record.clone()).collect(),
            has_new: self.has_new,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.record.id == id)
    }
}

/// Apply one action to the store state.
pub fn reduce(state: &mut StoreState, action: Action) -> DispatchOutcome {
    use DispatchOutcome::{Applied, Stale, Unchanged};

    match action {
        Action::LoadStarted => {
            state.pending_loads += 1;
            if state.phase == LoadPhase::Loading {
                return Unchanged;
            }
            state.phase = LoadPhase::Loading;
            Applied
        }
        Action::LoadCompleted { ticket, records } => {
            if ticket.epoch != state.epoch {
                return Stale;
            }

            let mut seen = HashSet::new();
            let fetched: Vec<Entry> = records
                .into_iter()
                .filter(|record| seen.insert(record.id.clone()))
                .map(|record| Entry {
                    record,
                    origin: Origin::History,
                })
                .collect();

            // Live pushes that raced the fetch survive unless the fetch returned them.
            let mut entries: Vec<Entry> = state
                .entries
                .drain(..)
                .filter(|e| match e.origin {
                    Origin::Live(seq) => seq > ticket.live_mark && !seen.contains(&e.record.id),
                    Origin::History => false,
                })
                .collect();
            entries.extend(fetched);

            state.entries = entries;
            state.pending_loads = state.pending_loads.saturating_sub(1);
            state.loaded = true;
            state.phase = LoadPhase::Loaded;
            Applied
        }
        Action::LoadFailed { ticket } => {
            if ticket.epoch != state.epoch {
                return Stale;
            }
            state.pending_loads = state.pending_loads.saturating_sub(1);

            // Only the last outstanding fetch decides the phase, and never
            // against records an earlier fetch already delivered.
            if state.pending_loads > 0 || state.phase != LoadPhase::Loading {
                return Unchanged;
            }
            state.phase = if state.loaded {
                LoadPhase::Loaded
            } else {
                LoadPhase::Empty
            };
            Applied
        }
        Action::PushLive(record) => {
            state.live_seq += 1;
            if let Some(index) = state.position(&record.id) {
                state.entries.remove(index);
            }
            state.entries.insert(
                0,
                Entry {
                    record,
                    origin: Origin::Live(state.live_seq),
                },
            );
            state.has_new = true;
            Applied
        }
        Action::MarkRead(id) => match state.position(&id) {
            Some(index) if !state.entries[index].record.read => {
                state.entries[index].record.read = true;
                Applied
            }
            _ => Unchanged,
        },
        Action::MarkAllRead => {
            let mut changed = false;
            for entry in state.entries.iter_mut().filter(|e| !e.record.read) {
                entry.record.read = true;
                changed = true;
            }
            if changed {
                Applied
            } else {
                Unchanged
            }
        }
        Action::Remove(id) => match state.position(&id) {
            Some(index) => {
                state.entries.remove(index);
                Applied
            }
            None => Unchanged,
        },
        Action::Clear => {
            if state.entries.is_empty() {
                return Unchanged;
            }
            state.entries.clear();
            Applied
        }
        Action::AcknowledgeNew => {
            if !state.has_new {
                return Unchanged;
            }
            state.has_new = false;
            Applied
        }
        Action::Reset => {
            state.epoch += 1;
            state.phase = LoadPhase::Empty;
            state.entries.clear();
            state.has_new = false;
            state.pending_loads = 0;
            state.loaded = false;
            Applied
        }
    }
}

/// Read-only view of the store handed to consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub phase: LoadPhase,
    pub records: Vec<Notification>,
    pub has_new: bool,
}

impl StoreSnapshot {
    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|r| !r.read).count()
    }

    pub fn unread_of(&self, kind: NotificationKind) -> usize {
        self.records
            .iter()
            .filter(|r| r.kind == kind && !r.read)
            .count()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Shared notification store for one process.
///
/// All mutation goes through [`NotificationStore::dispatch`]; every applied
/// action publishes a fresh [`StoreSnapshot`] to subscribed consumers.
#[derive(Clone)]
pub struct NotificationStore {
    state: Arc<Mutex<StoreState>>,
    tx: Arc<watch::Sender<StoreSnapshot>>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StoreSnapshot::default());
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            tx: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.tx.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn unread_count(&self) -> usize {
        self.tx.borrow().unread_count()
    }

    pub fn dispatch(&self, action: Action) -> DispatchOutcome {
        let mut state = self.lock();
        let outcome = reduce(&mut state, action);
        if outcome == DispatchOutcome::Applied {
            self.tx.send_replace(state.snapshot());
        }
        outcome
    }

    /// Dispatch on behalf of the session identified by `epoch`.
    pub fn dispatch_for(&self, epoch: u64, action: Action) -> DispatchOutcome {
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!(
                "Dropping {:?} from session epoch {} (current {})",
                action, epoch, state.epoch
            );
            return DispatchOutcome::Stale;
        }
        let outcome = reduce(&mut state, action);
        if outcome == DispatchOutcome::Applied {
            self.tx.send_replace(state.snapshot());
        }
        outcome
    }

    /// Mark the start of a history fetch and return the ticket its result must present.
    pub fn begin_load(&self) -> LoadTicket {
        let mut state = self.lock();
        let ticket = LoadTicket {
            epoch: state.epoch,
            live_mark: state.live_seq,
        };
        if reduce(&mut state, Action::LoadStarted) == DispatchOutcome::Applied {
            self.tx.send_replace(state.snapshot());
        }
        ticket
    }
}
