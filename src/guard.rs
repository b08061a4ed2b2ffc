//! Process-wide single-connection guard
//!
//! At most one session may be connecting or connected at a time. A session
//! takes a [`GuardTicket`] before dialing and the slot frees itself when the
//! ticket drops, so a panicking or leaked teardown path cannot wedge it.
//!
//! The guard also tracks host visibility: when the host hides the voice
//! surface, whichever session holds the slot is forced to disconnect, and no
//! session may claim it until the host is shown again. Visibility and the
//! slot share one lock so a hide cannot slip between a visibility check and
//! an acquire.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::error::VoiceError;

static GLOBAL_GUARD: OnceCell<Arc<ConnectionGuard>> = OnceCell::new();

/// What the guard needs from a session
pub trait GuardedSession: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Tear down the connection. Must not block on the guard.
    fn force_disconnect(&self);
}

struct ActiveSession {
    id: Uuid,
    session: Weak<dyn GuardedSession>,
}

struct Slot {
    active: Option<ActiveSession>,
    visible: bool,
}

pub struct ConnectionGuard {
    slot: Mutex<Slot>,
}

impl ConnectionGuard {
    /// A standalone guard. Sessions normally share [`ConnectionGuard::global`].
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                active: None,
                visible: true,
            }),
        }
    }

    /// The guard shared by every session in the process
    pub fn global() -> Arc<Self> {
        GLOBAL_GUARD.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Claim the slot for `id`.
    ///
    /// Fails with `InvalidStateTransition` while the host is hidden and with
    /// `AlreadyActive` if a different session holds it. A session that
    /// already holds it gets a fresh ticket.
    pub fn try_acquire(
        self: &Arc<Self>,
        id: Uuid,
        session: Weak<dyn GuardedSession>,
    ) -> Result<GuardTicket, VoiceError> {
        let mut slot = self.lock();
        if !slot.visible {
            log::info!("ConnectionGuard: rejecting session {} while hidden", id);
            return Err(VoiceError::invalid("connect", "hidden"));
        }
        if let Some(current) = slot.active.as_ref() {
            if current.id != id && current.session.strong_count() > 0 {
                log::info!(
                    "ConnectionGuard: rejecting session {} while {} is active",
                    id,
                    current.id
                );
                return Err(VoiceError::AlreadyActive);
            }
        }

        slot.active = Some(ActiveSession { id, session });
        log::debug!("ConnectionGuard: session {} acquired slot", id);
        Ok(GuardTicket {
            guard: self.clone(),
            id,
        })
    }

    /// Host visibility changed. Hiding forces the active session to disconnect.
    pub fn set_visible(&self, visible: bool) {
        let holder = {
            let mut slot = self.lock();
            let was_visible = std::mem::replace(&mut slot.visible, visible);
            if visible || !was_visible {
                return;
            }
            slot.active.as_ref().map(|a| (a.id, a.session.clone()))
        };

        // Upgrade outside the lock: force_disconnect releases the ticket
        if let Some((id, weak)) = holder {
            if let Some(session) = weak.upgrade() {
                log::info!("ConnectionGuard: host hidden, disconnecting session {}", id);
                session.force_disconnect();
            }
        }
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    pub fn is_active(&self) -> bool {
        self.active_session().is_some()
    }

    /// Id of the session holding the slot, if it is still alive
    pub fn active_session(&self) -> Option<Uuid> {
        self.lock()
            .active
            .as_ref()
            .filter(|a| a.session.strong_count() > 0)
            .map(|a| a.id)
    }

    fn release(&self, id: Uuid) {
        let mut slot = self.lock();
        if slot.active.as_ref().is_some_and(|a| a.id == id) {
            slot.active = None;
            log::debug!("ConnectionGuard: session {} released slot", id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the slot until dropped
pub struct GuardTicket {
    guard: Arc<ConnectionGuard>,
    id: Uuid,
}

impl GuardTicket {
    pub fn session_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        self.guard.release(self.id);
    }
}

impl std::fmt::Debug for GuardTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardTicket").field("id", &self.id).finish()
    }
}
