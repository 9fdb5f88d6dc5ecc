//! Broadcast session state machine.
//!
//! ```text
//!   idle ──confirm room──▶ idle(checking) ──is_live──▶ idle(ready) ──start──▶ live
//!     ▲                                                                        │
//!     └───────────────────────────────stop─────────────────────────────────────┘
//! ```
//!
//! Everything here is synchronous.  The core performs the network calls and
//! feeds their results back through the `finish_*` methods.

use avatar_proto::protocol::{Lifecycle, Persona, RoomStatus, SessionRef};
use avatar_proto::room::{RoomId, RoomIdError};
use thiserror::Error;
use tracing::{debug, info};

/// Why a command was refused.  Returned to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("No persona selected")]
    NoPersona,
    #[error("No room confirmed")]
    NoRoom,
    #[error("Room is not live{}", .0.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    RoomNotLive(Option<String>),
    #[error("Room liveness check still running")]
    RoomCheckPending,
    #[error("Broadcast is already live")]
    AlreadyLive,
    #[error("Broadcast start already in progress")]
    StartPending,
    #[error("Persona and room are locked while live")]
    LockedWhileLive,
    #[error(transparent)]
    InvalidRoom(#[from] RoomIdError),
    #[error("A reaction is playing; try again when it ends")]
    ReactionPlaying,
}

/// What the core needs to issue the start call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub room: RoomId,
    pub persona_id: String,
}

#[derive(Debug, Default)]
pub struct Session {
    lifecycle: Lifecycle,
    persona: Option<Persona>,
    room: Option<RoomId>,
    room_status: RoomStatus,
    token: Option<String>,
    starting: bool,
    last_session: Option<SessionRef>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle == Lifecycle::Live
    }

    pub fn persona(&self) -> Option<&Persona> {
        self.persona.as_ref()
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn room_status(&self) -> &RoomStatus {
        &self.room_status
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn last_session(&self) -> Option<&SessionRef> {
        self.last_session.as_ref()
    }

    pub fn select_persona(&mut self, persona: Option<Persona>) -> Result<(), GateError> {
        if self.is_live() {
            return Err(GateError::LockedWhileLive);
        }
        if self.starting {
            return Err(GateError::StartPending);
        }
        debug!(
            "session: persona {:?}",
            persona.as_ref().map(|p| p.id.as_str())
        );
        self.persona = persona;
        Ok(())
    }

    /// Put back a room remembered from a previous run.  It still has to be
    /// confirmed before `start`.
    pub fn restore_room(&mut self, room: RoomId) {
        if self.room.is_none() && !self.is_live() {
            self.room = Some(room);
            self.room_status = RoomStatus::Unconfirmed;
        }
    }

    /// Swap in fresher details for the selected persona (same id only).
    pub fn refresh_persona(&mut self, persona: &Persona) {
        if let Some(current) = self.persona.as_mut() {
            if current.id == persona.id && current != persona {
                *current = persona.clone();
            }
        }
    }

    /// Validate `raw` and mark the room as being checked.  While live only
    /// the current room may be re-checked; that is how the operator gets
    /// the feed back after it dropped.
    pub fn begin_room_check(&mut self, raw: &str) -> Result<RoomId, GateError> {
        let room = RoomId::parse(raw)?;
        if self.starting {
            return Err(GateError::StartPending);
        }
        if self.is_live() && self.room.as_ref() != Some(&room) {
            return Err(GateError::LockedWhileLive);
        }
        info!("session: checking room {}", room);
        self.room = Some(room.clone());
        self.room_status = RoomStatus::Checking;
        Ok(room)
    }

    /// Apply a liveness answer.  Answers for a room that is no longer the
    /// selected one, or that arrive after another check started, are
    /// dropped and `false` is returned.
    pub fn finish_room_check(&mut self, room: &RoomId, status: RoomStatus) -> bool {
        if self.room.as_ref() != Some(room) || self.room_status != RoomStatus::Checking {
            debug!("session: ignoring stale liveness answer for {}", room);
            return false;
        }
        info!("session: room {} -> {:?}", room, status);
        self.room_status = status;
        true
    }

    pub fn begin_start(&mut self) -> Result<StartRequest, GateError> {
        if self.is_live() {
            return Err(GateError::AlreadyLive);
        }
        if self.starting {
            return Err(GateError::StartPending);
        }
        let persona = self.persona.as_ref().ok_or(GateError::NoPersona)?;
        let room = self.room.as_ref().ok_or(GateError::NoRoom)?;
        match &self.room_status {
            RoomStatus::Live => {}
            RoomStatus::Checking => return Err(GateError::RoomCheckPending),
            RoomStatus::NotLive { detail } => return Err(GateError::RoomNotLive(detail.clone())),
            RoomStatus::Unconfirmed => return Err(GateError::NoRoom),
        }
        let request = StartRequest {
            room: room.clone(),
            persona_id: persona.id.clone(),
        };
        self.starting = true;
        Ok(request)
    }

    /// Apply the start call's outcome.  Returns the new session on success.
    pub fn finish_start(&mut self, token: Option<String>) -> Option<SessionRef> {
        if !self.starting {
            return None;
        }
        self.starting = false;
        let token = token?;
        let room = self.room.as_ref()?;
        let session = SessionRef {
            room_id: room.to_string(),
            session_id: token.clone(),
        };
        info!("session: live in room {} ({})", room, token);
        self.token = Some(token);
        self.lifecycle = Lifecycle::Live;
        Some(session)
    }

    /// Clear the session and hand back what the service needs to end it.
    /// Without a token there is nothing to stop and `None` is returned.
    pub fn begin_stop(&mut self) -> Option<SessionRef> {
        let token = self.token.take()?;
        let room_id = self
            .room
            .take()
            .map(|r| r.to_string())
            .unwrap_or_default();
        let session = SessionRef {
            room_id,
            session_id: token,
        };
        info!("session: stopping {:?}", session);
        self.persona = None;
        self.room_status = RoomStatus::Unconfirmed;
        self.lifecycle = Lifecycle::Idle;
        self.last_session = Some(session.clone());
        Some(session)
    }
}
