//! Motion catalog: the clips of the selected persona and the rules for
//! turning a category into one concrete clip.
//!
//! Loading is split in two so the core can run the fetch on a background
//! task: `begin_load` clears the catalog and hands out a `LoadTicket`, the
//! fetch runs, and `finish_load` installs the result only if the ticket is
//! still the latest one.  A response for a persona the operator already
//! switched away from is dropped.

use std::collections::HashMap;

use avatar_proto::protocol::{MotionClip, MotionTag};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::Backend;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("No playable clip for category {0}")]
    NoPlayableClip(MotionTag),
    #[error("No clip named {0:?} in the catalog")]
    UnknownClip(String),
}

/// Identifies one catalog load.  Only the most recent ticket is honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
    pub persona_id: String,
}

/// One entry of a clip listing as the service sends it.  Every field is
/// optional; `normalize` decides what is usable.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawClip {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

pub struct MotionCatalog {
    media_base: Url,
    clips: Vec<MotionClip>,
    /// Round-robin position per category.
    cursors: HashMap<MotionTag, usize>,
    generation: u64,
    loading: bool,
}

impl MotionCatalog {
    pub fn new(media_base: Url) -> Self {
        Self {
            media_base,
            clips: Vec::new(),
            cursors: HashMap::new(),
            generation: 0,
            loading: false,
        }
    }

    pub fn media_base(&self) -> &Url {
        &self.media_base
    }

    pub fn clips(&self) -> &[MotionClip] {
        &self.clips
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Start loading the catalog for `persona_id`, replacing whatever was
    /// loaded.  An empty or absent id just clears the catalog and returns
    /// `None`.  Any fetch still in flight is invalidated either way.
    pub fn begin_load(&mut self, persona_id: Option<&str>) -> Option<LoadTicket> {
        self.generation += 1;
        self.clips.clear();
        self.cursors.clear();

        let persona_id = persona_id.map(str::trim).filter(|id| !id.is_empty());
        self.loading = persona_id.is_some();

        persona_id.map(|id| LoadTicket {
            generation: self.generation,
            persona_id: id.to_string(),
        })
    }

    /// Install the result of a fetch.  Returns `false` (and changes nothing)
    /// when a newer load superseded this ticket.
    pub fn finish_load(&mut self, ticket: &LoadTicket, clips: Vec<MotionClip>) -> bool {
        if ticket.generation != self.generation {
            debug!(
                "catalog: dropping stale listing for {} (gen {} != {})",
                ticket.persona_id, ticket.generation, self.generation
            );
            return false;
        }
        info!(
            "catalog: {} clips loaded for persona {}",
            clips.len(),
            ticket.persona_id
        );
        self.clips = clips;
        self.cursors.clear();
        self.loading = false;
        true
    }

    /// Number of clips carrying `tag`.
    pub fn count(&self, tag: &MotionTag) -> usize {
        self.clips
            .iter()
            .filter(|c| c.tag.as_ref() == Some(tag))
            .count()
    }

    /// Pick a clip for `tag`.  Clips sharing a category are visited in
    /// round-robin order.  An unknown category falls back to `neutral`.
    pub fn resolve(&mut self, tag: &MotionTag) -> Result<MotionClip, CatalogError> {
        if let Some(clip) = self.next_of(tag) {
            return Ok(clip);
        }
        if !tag.is_neutral() {
            if let Some(clip) = self.next_of(&MotionTag::Neutral) {
                debug!("catalog: no clip for {}, falling back to neutral", tag);
                return Ok(clip);
            }
        }
        Err(CatalogError::NoPlayableClip(tag.clone()))
    }

    /// The clip for the resting state: a `neutral` clip, or the first clip
    /// of the catalog when the persona has no neutral one.
    pub fn resting(&mut self) -> Result<MotionClip, CatalogError> {
        match self.next_of(&MotionTag::Neutral) {
            Some(clip) => Ok(clip),
            None => self
                .clips
                .first()
                .cloned()
                .ok_or(CatalogError::NoPlayableClip(MotionTag::Neutral)),
        }
    }

    /// Manual selection by clip name; untagged clips are reachable here.
    pub fn by_name(&self, name: &str) -> Result<MotionClip, CatalogError> {
        self.clips
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownClip(name.to_string()))
    }

    fn next_of(&mut self, tag: &MotionTag) -> Option<MotionClip> {
        let candidates: Vec<&MotionClip> = self
            .clips
            .iter()
            .filter(|c| c.tag.as_ref() == Some(tag))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let cursor = self.cursors.entry(tag.clone()).or_insert(0);
        let chosen = candidates[*cursor % candidates.len()].clone();
        *cursor = (*cursor + 1) % candidates.len();
        Some(chosen)
    }
}

/// Fetch and normalise the clips for a load ticket.  Never fails: any
/// network or shape problem is logged and yields an empty list.
pub async fn fetch_clips(backend: &dyn Backend, media_base: &Url, ticket: &LoadTicket) -> Vec<MotionClip> {
    let listing = match backend.clip_listing(&ticket.persona_id).await {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "catalog: failed to load clips for {}: {:#}",
                ticket.persona_id, e
            );
            return Vec::new();
        }
    };
    match parse_listing(listing) {
        Some(raw) => normalize(media_base, &ticket.persona_id, raw),
        None => {
            warn!(
                "catalog: unexpected clip listing shape for {}",
                ticket.persona_id
            );
            Vec::new()
        }
    }
}

/// Accepts `{"files": [...]}` or a bare array.  Entries that are not
/// objects are skipped.
pub fn parse_listing(listing: Value) -> Option<Vec<RawClip>> {
    let entries = match listing {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match obj.remove("files") {
            Some(Value::Array(entries)) => entries,
            _ => return None,
        },
        _ => return None,
    };

    let clips = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<RawClip>(entry) {
            Ok(clip) => Some(clip),
            Err(e) => {
                debug!("catalog: skipping malformed listing entry: {}", e);
                None
            }
        })
        .collect();
    Some(clips)
}

/// Fill in names, URLs and tags.  Clips with neither a name nor a path are
/// dropped since nothing identifies them.
pub fn normalize(media_base: &Url, persona_id: &str, raw: Vec<RawClip>) -> Vec<MotionClip> {
    raw.into_iter()
        .filter_map(|clip| {
            let name = clip
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| clip.path.as_deref().map(file_name).map(str::to_string))
                .filter(|n| !n.is_empty())?;
            let path = clip.path.unwrap_or_else(|| name.clone());

            let url = match clip.url.as_deref().and_then(|u| resolve_url(media_base, u)) {
                Some(url) => url,
                None => clip_url(media_base, persona_id, &name)?,
            };

            let tag = clip
                .tag
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(MotionTag::from)
                .or_else(|| MotionTag::infer_from_name(&name));

            Some(MotionClip {
                name,
                path,
                url,
                tag,
            })
        })
        .collect()
}

/// Last component of a `/` or `\` separated path.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Absolute URLs are kept, root-relative ones are joined onto the media
/// base.  Anything else is not trusted.
fn resolve_url(media_base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(raw) {
        return matches!(url.scheme(), "http" | "https" | "file").then(|| url.to_string());
    }
    if raw.starts_with('/') {
        return media_base.join(raw).ok().map(|u| u.to_string());
    }
    None
}

/// `<media base>/<persona>/motion/<file name>` with each part percent-encoded.
fn clip_url(media_base: &Url, persona_id: &str, name: &str) -> Option<String> {
    let mut url = media_base.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend([persona_id, "motion", name]);
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("http://localhost:8000").unwrap()
    }

    fn clip(name: &str, tag: Option<MotionTag>) -> MotionClip {
        MotionClip {
            name: name.to_string(),
            path: name.to_string(),
            url: format!("http://localhost:8000/p1/motion/{}", name),
            tag,
        }
    }

    fn loaded(clips: Vec<MotionClip>) -> MotionCatalog {
        let mut catalog = MotionCatalog::new(base());
        let ticket = catalog.begin_load(Some("p1")).unwrap();
        assert!(catalog.finish_load(&ticket, clips));
        catalog
    }

    #[test]
    fn test_empty_catalog_has_no_playable_clip() {
        let mut catalog = loaded(Vec::new());
        for tag in [MotionTag::Neutral, MotionTag::GiftLevel(1), MotionTag::Talking] {
            assert_eq!(
                catalog.resolve(&tag),
                Err(CatalogError::NoPlayableClip(tag.clone()))
            );
        }
        assert!(catalog.resting().is_err());
    }

    #[test]
    fn test_single_neutral_round_trip() {
        let mut catalog = loaded(vec![
            clip("neutral_01.mp4", Some(MotionTag::Neutral)),
            clip("talking_01.mp4", Some(MotionTag::Talking)),
        ]);
        for _ in 0..3 {
            assert_eq!(
                catalog.resolve(&MotionTag::Neutral).unwrap().url,
                "http://localhost:8000/p1/motion/neutral_01.mp4"
            );
        }
    }

    #[test]
    fn test_round_robin_visits_every_clip() {
        let mut catalog = loaded(vec![
            clip("neutral_01.mp4", Some(MotionTag::Neutral)),
            clip("gift_level_1_a.mp4", Some(MotionTag::GiftLevel(1))),
            clip("neutral_02.mp4", Some(MotionTag::Neutral)),
            clip("neutral_03.mp4", Some(MotionTag::Neutral)),
        ]);
        let names: Vec<String> = (0..4)
            .map(|_| catalog.resolve(&MotionTag::Neutral).unwrap().name)
            .collect();
        assert_eq!(
            names,
            ["neutral_01.mp4", "neutral_02.mp4", "neutral_03.mp4", "neutral_01.mp4"]
        );
    }

    #[test]
    fn test_unknown_category_falls_back_to_neutral() {
        let mut catalog = loaded(vec![clip("neutral_01.mp4", Some(MotionTag::Neutral))]);
        let chosen = catalog.resolve(&MotionTag::GiftLevel(9)).unwrap();
        assert_eq!(chosen.tag, Some(MotionTag::Neutral));
    }

    #[test]
    fn test_no_neutral_fails_resolve_but_rests_on_first_clip() {
        let mut catalog = loaded(vec![
            clip("wave.mp4", None),
            clip("talking_01.mp4", Some(MotionTag::Talking)),
        ]);
        assert!(matches!(
            catalog.resolve(&MotionTag::GiftLevel(1)),
            Err(CatalogError::NoPlayableClip(_))
        ));
        assert_eq!(catalog.resting().unwrap().name, "wave.mp4");
    }

    #[test]
    fn test_untagged_clip_only_by_name() {
        let mut catalog = loaded(vec![clip("wave.mp4", None)]);
        assert!(catalog.resolve(&MotionTag::Other(String::new())).is_err());
        assert_eq!(catalog.by_name("wave.mp4").unwrap().name, "wave.mp4");
        assert_eq!(
            catalog.by_name("missing.mp4"),
            Err(CatalogError::UnknownClip("missing.mp4".into()))
        );
    }

    #[test]
    fn test_stale_load_is_dropped() {
        let mut catalog = MotionCatalog::new(base());
        let first = catalog.begin_load(Some("p1")).unwrap();
        let second = catalog.begin_load(Some("p2")).unwrap();

        assert!(!catalog.finish_load(&first, vec![clip("neutral_01.mp4", Some(MotionTag::Neutral))]));
        assert!(catalog.clips().is_empty());
        assert!(catalog.is_loading());

        assert!(catalog.finish_load(&second, vec![clip("neutral_02.mp4", Some(MotionTag::Neutral))]));
        assert_eq!(catalog.clips()[0].name, "neutral_02.mp4");
    }

    #[test]
    fn test_empty_persona_clears_without_fetch() {
        let mut catalog = loaded(vec![clip("neutral_01.mp4", Some(MotionTag::Neutral))]);
        assert!(catalog.begin_load(Some("  ")).is_none());
        assert!(catalog.clips().is_empty());
        assert!(!catalog.is_loading());
        assert!(catalog.begin_load(None).is_none());
    }

    #[test]
    fn test_parse_listing_shapes() {
        let wrapped = parse_listing(json!({"files": [{"name": "a.mp4"}, 7]})).unwrap();
        assert_eq!(wrapped.len(), 1);
        let bare = parse_listing(json!([{"name": "a.mp4"}, {"path": "x/b.mp4"}])).unwrap();
        assert_eq!(bare.len(), 2);
        assert!(parse_listing(json!({"detail": "Not Found"})).is_none());
        assert!(parse_listing(json!("oops")).is_none());
    }

    #[test]
    fn test_normalize_urls_and_tags() {
        let raw = parse_listing(json!({"files": [
            {"name": "neutral_01.mp4", "path": "neutral_01.mp4", "tag": ""},
            {"path": "clips\\gift_level_2_spin.mp4"},
            {"name": "talk a.mp4", "url": "/media/p1/talk.mp4", "tag": "talking"},
            {"name": "cdn.mp4", "url": "https://cdn.example/cdn.mp4", "tag": "reaction"},
            {"name": "wave.mp4", "url": "wave.mp4"},
            {"tag": "neutral"}
        ]}))
        .unwrap();
        let clips = normalize(&base(), "p1", raw);

        assert_eq!(clips.len(), 5);
        assert_eq!(clips[0].tag, Some(MotionTag::Neutral));
        assert_eq!(clips[0].url, "http://localhost:8000/p1/motion/neutral_01.mp4");

        assert_eq!(clips[1].name, "gift_level_2_spin.mp4");
        assert_eq!(clips[1].tag, Some(MotionTag::GiftLevel(2)));

        assert_eq!(clips[2].url, "http://localhost:8000/media/p1/talk.mp4");
        assert_eq!(clips[2].tag, Some(MotionTag::Talking));

        assert_eq!(clips[3].url, "https://cdn.example/cdn.mp4");

        assert_eq!(clips[4].url, "http://localhost:8000/p1/motion/wave.mp4");
        assert_eq!(clips[4].tag, None);
    }

    #[test]
    fn test_clip_url_encodes_file_name() {
        assert_eq!(
            clip_url(&base(), "p1", "talk a.mp4").unwrap(),
            "http://localhost:8000/p1/motion/talk%20a.mp4"
        );
    }
}
