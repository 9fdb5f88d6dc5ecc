//! Display port and the stage that keeps it from ever going blank.
//!
//! A swap always goes through the same steps: cover the screen with the
//! last rendered frame (or the fallback image when nothing was playing),
//! ask for the new clip, and drop the cover once the display says the new
//! source can render.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use avatar_proto::protocol::MotionClip;
use tracing::{debug, info, warn};

/// What to put on the overlay while a source swap is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Freeze whatever the display rendered last.
    LastRendered,
    /// A static image used when there is nothing to freeze.
    Fallback(PathBuf),
}

/// Reported back by a display implementation.  `Ended` and `Ready` carry
/// the URL of the source they refer to when the display knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySignal {
    /// The current clip played to its end.
    Ended(Option<String>),
    /// The newly requested source is rendering.
    Ready(Option<String>),
    /// The display could not play the requested source.
    Failed(String),
}

#[async_trait]
pub trait Display: Send + 'static {
    async fn show_frame(&mut self, frame: &Frame) -> Result<()>;
    async fn hide_frame(&mut self) -> Result<()>;
    async fn play_clip(&mut self, url: &str, looped: bool) -> Result<()>;
    async fn shutdown(&mut self);
}

/// Display used when playback happens in a browser overlay.  The overlay
/// reads the state snapshot and reports ended/ready over HTTP, so there is
/// nothing to drive here.
pub struct ExternalDisplay;

#[async_trait]
impl Display for ExternalDisplay {
    async fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        debug!("display: overlay {:?}", frame);
        Ok(())
    }

    async fn hide_frame(&mut self) -> Result<()> {
        debug!("display: overlay hidden");
        Ok(())
    }

    async fn play_clip(&mut self, url: &str, looped: bool) -> Result<()> {
        debug!("display: source {} (loop={})", url, looped);
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

/// Tracks what the display shows and drives source swaps.
pub struct Stage {
    fallback: PathBuf,
    current: Option<MotionClip>,
    looped: bool,
    /// Set by every swap, cleared by the first ready report for it.
    awaiting_ready: bool,
    overlay_visible: bool,
    showing_fallback: bool,
}

impl Stage {
    pub fn new(fallback: PathBuf) -> Self {
        Self {
            fallback,
            current: None,
            looped: false,
            awaiting_ready: false,
            overlay_visible: false,
            showing_fallback: false,
        }
    }

    pub fn current(&self) -> Option<&MotionClip> {
        self.current.as_ref()
    }

    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    pub fn showing_fallback(&self) -> bool {
        self.showing_fallback
    }

    /// Whether an ended report belongs to the clip on screen.  A report
    /// naming its source must name the current clip.  An anonymous one is
    /// only trusted once the current clip has reported ready, since an end
    /// queued by the previous source can still arrive after a swap.
    pub fn owns_end(&self, source: Option<&str>) -> bool {
        match (self.current.as_ref(), source) {
            (None, _) => false,
            (Some(clip), Some(url)) => clip.url == url,
            (Some(_), None) => !self.awaiting_ready,
        }
    }

    /// Whether a ready report belongs to the clip on screen.
    pub fn owns_ready(&self, source: Option<&str>) -> bool {
        match (self.current.as_ref(), source) {
            (None, _) => false,
            (Some(clip), Some(url)) => clip.url == url,
            (Some(_), None) => true,
        }
    }

    /// Switch the display to `clip`.  The overlay stays up until `on_ready`.
    /// A failed request keeps whatever the overlay shows.
    pub async fn swap_to(&mut self, display: &mut dyn Display, clip: MotionClip, looped: bool) {
        let frame = if self.current.is_some() {
            Frame::LastRendered
        } else {
            Frame::Fallback(self.fallback.clone())
        };
        self.cover(display, frame).await;

        info!("display: playing {} (loop={})", clip.name, looped);
        match display.play_clip(&clip.url, looped).await {
            Ok(()) => {
                self.current = Some(clip);
                self.looped = looped;
                self.awaiting_ready = true;
            }
            Err(e) => warn!("display: failed to play {}: {:#}", clip.url, e),
        }
    }

    /// Called when nothing could be resolved.  Shows the fallback image if
    /// the display has no source yet; otherwise leaves it untouched.
    pub async fn ensure_source(&mut self, display: &mut dyn Display) {
        if self.current.is_some() || self.showing_fallback {
            return;
        }
        let frame = Frame::Fallback(self.fallback.clone());
        self.cover(display, frame).await;
    }

    /// The display rendered the new source; drop the overlay.
    pub async fn on_ready(&mut self, display: &mut dyn Display) {
        if self.current.is_none() {
            return;
        }
        self.awaiting_ready = false;
        if !self.overlay_visible {
            return;
        }
        if let Err(e) = display.hide_frame().await {
            warn!("display: failed to hide overlay: {:#}", e);
            return;
        }
        self.overlay_visible = false;
        self.showing_fallback = false;
    }

    async fn cover(&mut self, display: &mut dyn Display, frame: Frame) {
        let is_fallback = matches!(frame, Frame::Fallback(_));
        match display.show_frame(&frame).await {
            Ok(()) => {
                self.overlay_visible = true;
                self.showing_fallback = is_fallback;
            }
            Err(e) => warn!("display: failed to show overlay: {:#}", e),
        }
    }
}
