//! Fakes for the backend and the display, shared by the core tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use avatar_proto::protocol::{Persona, SessionRef};
use avatar_proto::room::RoomId;
use serde_json::Value;

use crate::backend::{Backend, LiveStatus};
use crate::display::{Display, Frame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayCall {
    Show(Frame),
    Hide,
    Play(String, bool),
}

/// Records every call; clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    calls: Arc<Mutex<Vec<DisplayCall>>>,
    fail_next_play: Arc<AtomicBool>,
}

impl RecordingDisplay {
    pub fn calls(&self) -> Vec<DisplayCall> {
        self.calls.lock().unwrap().clone()
    }

    /// URLs passed to `play_clip`, in order.
    pub fn played(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DisplayCall::Play(url, _) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_next_play(&self) {
        self.fail_next_play.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Display for RecordingDisplay {
    async fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        self.calls.lock().unwrap().push(DisplayCall::Show(frame.clone()));
        Ok(())
    }

    async fn hide_frame(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(DisplayCall::Hide);
        Ok(())
    }

    async fn play_clip(&mut self, url: &str, looped: bool) -> Result<()> {
        if self.fail_next_play.swap(false, Ordering::SeqCst) {
            anyhow::bail!("player rejected {}", url);
        }
        self.calls
            .lock()
            .unwrap()
            .push(DisplayCall::Play(url.to_string(), looped));
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

/// Scriptable backend.  Every answer can be swapped between calls.
pub struct FakeBackend {
    pub personas: Mutex<Vec<Persona>>,
    pub listings: Mutex<HashMap<String, Value>>,
    pub live: Mutex<std::result::Result<LiveStatus, String>>,
    pub start: Mutex<std::result::Result<String, String>>,
    pub stop_fails: AtomicBool,
    pub stopped: Mutex<Vec<SessionRef>>,
    pub archive: Mutex<Vec<Value>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            personas: Mutex::new(Vec::new()),
            listings: Mutex::new(HashMap::new()),
            live: Mutex::new(Ok(LiveStatus {
                is_live: true,
                detail: None,
            })),
            start: Mutex::new(Ok("session-1".into())),
            stop_fails: AtomicBool::new(false),
            stopped: Mutex::new(Vec::new()),
            archive: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBackend {
    pub fn with_listing(self, persona_id: &str, listing: Value) -> Self {
        self.listings
            .lock()
            .unwrap()
            .insert(persona_id.to_string(), listing);
        self
    }

    pub fn set_live(&self, is_live: bool, detail: Option<&str>) {
        *self.live.lock().unwrap() = Ok(LiveStatus {
            is_live,
            detail: detail.map(str::to_string),
        });
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn list_personas(&self) -> Result<Vec<Persona>> {
        Ok(self.personas.lock().unwrap().clone())
    }

    async fn clip_listing(&self, persona_id: &str) -> Result<Value> {
        self.listings
            .lock()
            .unwrap()
            .get(persona_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Clip listing returned status: 404 Not Found"))
    }

    async fn room_status(&self, _room: &RoomId) -> Result<LiveStatus> {
        self.live.lock().unwrap().clone().map_err(anyhow::Error::msg)
    }

    async fn start_session(&self, _room: &RoomId, _persona_id: &str) -> Result<String> {
        self.start.lock().unwrap().clone().map_err(anyhow::Error::msg)
    }

    async fn stop_session(&self, session: &SessionRef) -> Result<()> {
        self.stopped.lock().unwrap().push(session.clone());
        if self.stop_fails.load(Ordering::SeqCst) {
            anyhow::bail!("Broadcast stop returned status: 500 Internal Server Error");
        }
        Ok(())
    }

    async fn archived_events(&self, _session: &SessionRef, limit: u32) -> Result<Vec<Value>> {
        let archive = self.archive.lock().unwrap();
        Ok(archive.iter().take(limit as usize).cloned().collect())
    }
}
