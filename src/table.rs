//! The server's fixed-capacity session table (spec.md §4.3).
//!
//! Each accepted RRQ/WRQ gets its own tokio task and its own ephemeral UDP
//! socket (the "fresh local endpoint" spec.md describes as becoming the
//! transfer's server-side TID). The table's job is demultiplexing by peer,
//! enforcing the capacity ceiling, and sweeping idle sessions — it does not
//! hold the socket or the file itself, those live inside the spawned task.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::session::IDLE_TIMEOUT;

/// A sensible default ceiling on concurrent transfers (spec.md §4.3).
pub const MAX_SESSIONS: usize = 10;

struct Slot {
    peer: SocketAddr,
    last_activity: Arc<Mutex<Instant>>,
    handle: JoinHandle<()>,
}

/// Handle a running session hands back to the table so `sweep` can track
/// liveness without reaching into the transfer loop itself.
#[derive(Clone)]
pub struct ActivityHandle(Arc<Mutex<Instant>>);

impl ActivityHandle {
    pub fn touch(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    /// Mark this session as already idle-expired so the next sweep tick
    /// reclaims its slot immediately, instead of waiting out the full
    /// `IDLE_TIMEOUT` after the session has already finished.
    pub fn expire(&self) {
        *self.0.lock().unwrap() = Instant::now() - IDLE_TIMEOUT - std::time::Duration::from_secs(1);
    }
}

pub struct SessionTable {
    slots: Mutex<Vec<Option<Slot>>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..MAX_SESSIONS).map(|_| None).collect()),
        }
    }

    /// Linear scan for an existing session to this peer.
    pub fn find(&self, peer: SocketAddr) -> Option<usize> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.peer == peer))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a free slot for `peer` and spawn its session task via
    /// `spawn`, which receives this slot's index (to `retire` when the task
    /// finishes on its own) and an `ActivityHandle` to touch on every send
    /// and receive. Returns `None` if the table is at capacity.
    pub fn create(
        &self,
        peer: SocketAddr,
        spawn: impl FnOnce(usize, ActivityHandle) -> JoinHandle<()>,
    ) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|s| s.is_none())?;
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let handle = spawn(idx, ActivityHandle(last_activity.clone()));
        slots[idx] = Some(Slot {
            peer,
            last_activity,
            handle,
        });
        Some(idx)
    }

    /// Abort the session in `idx`, if any, and free its slot.
    pub fn close(&self, idx: usize) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots[idx].take() {
            slot.handle.abort();
        }
    }

    /// Force-close any session idle beyond `IDLE_TIMEOUT`. This runs
    /// independently of each session's own 3s/5-retry retransmit cycle and
    /// only fires if a session genuinely stalls (a healthy retry loop
    /// touches the activity handle every 3s, well under this 5s bound) or
    /// its task panics before reaching `retire`.
    pub fn sweep(&self) {
        let stale: Vec<usize> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    let slot = slot.as_ref()?;
                    let last = *slot.last_activity.lock().unwrap();
                    (last.elapsed() > IDLE_TIMEOUT).then_some(idx)
                })
                .collect()
        };
        for idx in stale {
            self.close(idx);
        }
    }

    /// Drop the slot for a task that finished on its own (no abort needed).
    /// Callers invoke this themselves right after their session loop
    /// returns, so a completed transfer frees its slot immediately instead
    /// of waiting for the next `sweep` tick.
    pub fn retire(&self, idx: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[idx] = None;
    }
}
