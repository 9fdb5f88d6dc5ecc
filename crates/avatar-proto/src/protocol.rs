use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client (control UI, scripts) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Select the persona whose motion catalog drives the display.
    /// `None` clears the selection.
    SelectPersona { persona_id: Option<String> },
    /// Validate the room id and ask the broadcast service whether it is live.
    ConfirmRoom { room_id: String },
    Start,
    Stop,
    /// Play a clip of the given category (manual selection).
    PlayTag { tag: String },
    /// Play one specific clip by name, tagged or not.
    PlayClip { name: String },
    /// The external player finished a clip.  `url` names the clip; reports
    /// for anything but the clip on screen are ignored.
    ClipEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// The external player can render the newly requested clip.
    ClipReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ReloadCatalog,
    ReloadPersonas,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        panel_rev: u64,
        state: PanelState,
    },
    State {
        data: PanelState,
    },
    /// One event from the live feed, as appended to the event log.
    Feed {
        event: LoggedEvent,
    },
    Log {
        message: String,
    },
    /// A command was refused or failed; shown next to the control that sent it.
    Error {
        message: String,
    },
}

/// Broadcast lifecycle.  `stop` returns the session to `Idle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Idle,
    Live,
}

/// Outcome of the room confirmation step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Unconfirmed,
    /// Liveness check in flight.
    Checking,
    /// The room is broadcasting right now; `start` is allowed.
    Live,
    NotLive {
        detail: Option<String>,
    },
}

impl RoomStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, RoomStatus::Live)
    }
}

/// Connection state of the live feed listener.
///
/// Transitions:
///   Disconnected -> Connecting -> Connected -> Disconnected
///   Connecting -> Disconnected (on error, no automatic retry)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

// ── motion catalog types ──────────────────────────────────────────────────────

/// Behavioural category of a motion clip.
///
/// Serialised as its plain string form (`"neutral"`, `"gift_level_3"`, ...)
/// so listings and feed messages can carry it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MotionTag {
    Neutral,
    Talking,
    Reaction,
    GiftLevel(u32),
    EmotionPositive,
    EmotionNegative,
    Keyword(String),
    Other(String),
}

impl MotionTag {
    pub fn is_neutral(&self) -> bool {
        matches!(self, MotionTag::Neutral)
    }

    /// Infer a tag from naming conventions in a clip's file name
    /// (`neutral_01.mp4`, `gift_level_2_spin.mp4`, `keyword_hello_a.mp4`).
    pub fn infer_from_name(name: &str) -> Option<MotionTag> {
        if name.contains("neutral_") {
            return Some(MotionTag::Neutral);
        }
        if name.contains("talking_") {
            return Some(MotionTag::Talking);
        }
        if let Some(idx) = name.find("gift_level_") {
            let digits: String = name[idx + "gift_level_".len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            return digits.parse().ok().map(MotionTag::GiftLevel);
        }
        if name.contains("emotion_positive_") {
            return Some(MotionTag::EmotionPositive);
        }
        if name.contains("emotion_negative_") {
            return Some(MotionTag::EmotionNegative);
        }
        if let Some(idx) = name.find("keyword_") {
            let word: String = name[idx + "keyword_".len()..]
                .chars()
                .take_while(|c| *c != '_' && *c != '.')
                .collect();
            if !word.is_empty() {
                return Some(MotionTag::Keyword(word));
            }
        }
        None
    }
}

impl From<&str> for MotionTag {
    fn from(raw: &str) -> Self {
        let s = raw.trim();
        match s {
            "neutral" => MotionTag::Neutral,
            "talking" => MotionTag::Talking,
            "reaction" => MotionTag::Reaction,
            "emotion_positive" => MotionTag::EmotionPositive,
            "emotion_negative" => MotionTag::EmotionNegative,
            _ => {
                if let Some(level) = s
                    .strip_prefix("gift_level_")
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    MotionTag::GiftLevel(level)
                } else if let Some(word) = s.strip_prefix("keyword_").filter(|w| !w.is_empty()) {
                    MotionTag::Keyword(word.to_string())
                } else {
                    MotionTag::Other(s.to_string())
                }
            }
        }
    }
}

impl From<String> for MotionTag {
    fn from(raw: String) -> Self {
        MotionTag::from(raw.as_str())
    }
}

impl From<MotionTag> for String {
    fn from(tag: MotionTag) -> Self {
        tag.to_string()
    }
}

impl fmt::Display for MotionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionTag::Neutral => f.write_str("neutral"),
            MotionTag::Talking => f.write_str("talking"),
            MotionTag::Reaction => f.write_str("reaction"),
            MotionTag::GiftLevel(n) => write!(f, "gift_level_{}", n),
            MotionTag::EmotionPositive => f.write_str("emotion_positive"),
            MotionTag::EmotionNegative => f.write_str("emotion_negative"),
            MotionTag::Keyword(w) => write!(f, "keyword_{}", w),
            MotionTag::Other(s) => f.write_str(s),
        }
    }
}

/// One playable clip of a persona's motion catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionClip {
    /// File name; stable identifier within the catalog.
    pub name: String,
    pub path: String,
    pub url: String,
    /// `None` when neither the listing nor the file name gave a category.
    /// Such clips are only playable by manual selection.
    pub tag: Option<MotionTag>,
}

/// A reaction waiting to be played: the category to resolve and the repeat
/// count the feed reported for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionEvent {
    pub tag: MotionTag,
    pub repeat_count: u32,
}

// ── personas ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// `waiting` or `live` as stored by the persona service.
    #[serde(default)]
    pub status: Option<String>,
}

// ── live feed ─────────────────────────────────────────────────────────────────

/// One message from the live feed, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedEvent {
    Chat {
        #[serde(default)]
        user_nickname: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Gift {
        #[serde(default)]
        user_nickname: Option<String>,
        #[serde(default)]
        gift_name: Option<String>,
        #[serde(default)]
        gift_coin: Option<u64>,
        #[serde(default)]
        repeat_count: Option<u32>,
        #[serde(default)]
        motion_tag: Option<String>,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Like {
        #[serde(default)]
        user_nickname: Option<String>,
        #[serde(default)]
        like_count: Option<u64>,
        #[serde(default)]
        timestamp: Option<f64>,
    },
}

impl FeedEvent {
    /// The reaction a gift asks for.  Gifts without a motion tag only show up
    /// in the event log.  A missing repeat count counts as one.
    pub fn reaction(&self) -> Option<ReactionEvent> {
        match self {
            FeedEvent::Gift {
                motion_tag: Some(tag),
                repeat_count,
                ..
            } if !tag.trim().is_empty() => Some(ReactionEvent {
                tag: MotionTag::from(tag.as_str()),
                repeat_count: repeat_count.unwrap_or(1),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Chat { .. } => "chat",
            FeedEvent::Gift { .. } => "gift",
            FeedEvent::Like { .. } => "like",
        }
    }
}

/// A feed event as kept in the display log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedEvent {
    pub received_at: DateTime<Local>,
    #[serde(flatten)]
    pub event: FeedEvent,
}

/// Identifies a broadcast session at the broadcast service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRef {
    pub room_id: String,
    pub session_id: String,
}

// ── state snapshot ────────────────────────────────────────────────────────────

/// Full state of the panel.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PanelState {
    #[serde(default)]
    pub rev: u64,
    pub lifecycle: Lifecycle,
    pub persona: Option<Persona>,
    #[serde(default)]
    pub personas: Vec<Persona>,
    pub room_id: Option<String>,
    #[serde(default)]
    pub room_status: RoomStatus,
    pub session_token: Option<String>,
    /// The most recently finished session, for event archive lookups.
    #[serde(default)]
    pub last_session: Option<SessionRef>,
    #[serde(default)]
    pub feed_status: FeedStatus,
    /// Reactions waiting behind the one currently playing, head first.
    #[serde(default)]
    pub queue: Vec<ReactionEvent>,
    pub playing_reaction: Option<ReactionEvent>,
    /// The clip the display was last asked to play.
    pub current_clip: Option<MotionClip>,
    /// True when the current clip repeats until something replaces it.
    #[serde(default)]
    pub loop_current: bool,
    /// True while the previous frame (or fallback image) covers a source swap.
    #[serde(default)]
    pub overlay_visible: bool,
    /// True while the display shows the static fallback image.
    #[serde(default)]
    pub showing_fallback: bool,
    #[serde(default)]
    pub clips: Vec<MotionClip>,
    #[serde(default)]
    pub catalog_loading: bool,
    #[serde(default)]
    pub event_log: Vec<LoggedEvent>,
    pub last_error: Option<String>,
}

impl PanelState {
    pub fn is_ready_to_start(&self) -> bool {
        self.lifecycle == Lifecycle::Idle && self.persona.is_some() && self.room_status.is_live()
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Size of the first frame in `data`, header included, once all of it
    /// has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        let total = 4 + u32::from_be_bytes(header) as usize;
        (data.len() >= total).then_some(total)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let Some(total) = Self::frame_len(data) else {
            anyhow::bail!("Insufficient data for message");
        };
        let msg: Self = serde_json::from_slice(&data[4..total])?;
        Ok((msg, total))
    }
}
