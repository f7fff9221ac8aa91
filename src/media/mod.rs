//! Capability seams to the desktop player's orchestrators.
//!
//! The front door never talks to the player directly — it is constructed
//! with a [`MediaBridge`] of trait objects and returns 503 for any capability
//! the host did not wire in. The daemon binary wires real implementations;
//! tests plug in stubs.

use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ─── Catalog types ───────────────────────────────────────────────────────────

/// Artwork as the orchestrators deliver it: either a single URL or a set of
/// sized renditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Artwork {
    Single(String),
    Set {
        #[serde(skip_serializing_if = "Option::is_none")]
        small: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        medium: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        large: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        original: Option<String>,
    },
}

impl Artwork {
    /// Best single URL for a small-screen client: prefers medium, then
    /// large, small, original.
    pub fn flat_url(&self) -> Option<&str> {
        match self {
            Artwork::Single(url) => Some(url),
            Artwork::Set {
                small,
                medium,
                large,
                original,
            } => medium
                .as_deref()
                .or(large.as_deref())
                .or(small.as_deref())
                .or(original.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Artwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Artwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Artwork>,
}

/// The flat projection mobile pages render directly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
}

/// Flatten a track for the mobile client: one artwork URL, no nesting.
pub fn normalize_for_mobile(track: &Track) -> FlatTrack {
    FlatTrack {
        id: track.id.clone(),
        title: track.title.clone(),
        artist: track.artist.clone(),
        album: track.album.clone(),
        duration_secs: track.duration_secs,
        artwork_url: track
            .artwork
            .as_ref()
            .and_then(|a| a.flat_url())
            .map(str::to_string),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub tracks: Vec<Track>,
    pub albums: Vec<Album>,
    pub artists: Vec<Artist>,
}

// ─── Playback ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum PlaybackCommand {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    Seek { position_secs: f64 },
    SetVolume { level: f64 },
    PlayTrack { track_id: String },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<FlatTrack>,
    pub position_secs: f64,
    pub volume: f64,
}

// ─── Capability traits ───────────────────────────────────────────────────────

#[async_trait]
pub trait Searcher: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults>;
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn track(&self, id: &str) -> Result<Option<Track>>;
    async fn album(&self, id: &str) -> Result<Option<Album>>;
}

#[async_trait]
pub trait Playback: Send + Sync {
    async fn state(&self) -> Result<PlaybackState>;
    async fn command(&self, command: PlaybackCommand) -> Result<()>;
}

#[async_trait]
pub trait LibraryBridge: Send + Sync {
    async fn tracks(&self, offset: usize, limit: usize) -> Result<Vec<Track>>;
}

/// The set of orchestrator capabilities wired in at startup.
/// Every field is optional — a missing capability surfaces as 503.
#[derive(Clone, Default)]
pub struct MediaBridge {
    pub searcher: Option<Arc<dyn Searcher>>,
    pub metadata: Option<Arc<dyn MetadataProvider>>,
    pub playback: Option<Arc<dyn Playback>>,
    pub library: Option<Arc<dyn LibraryBridge>>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_projection_prefers_medium_artwork() {
        let track = Track {
            id: "t1".into(),
            title: "Song".into(),
            artist: "Band".into(),
            album: None,
            duration_secs: Some(200),
            artwork: Some(Artwork::Set {
                small: Some("s".into()),
                medium: Some("m".into()),
                large: Some("l".into()),
                original: None,
            }),
        };
        assert_eq!(normalize_for_mobile(&track).artwork_url.as_deref(), Some("m"));
    }

    #[test]
    fn single_artwork_flattens_to_itself() {
        let track = Track {
            id: "t2".into(),
            title: "Other".into(),
            artist: "Band".into(),
            album: None,
            duration_secs: None,
            artwork: Some(Artwork::Single("u".into())),
        };
        assert_eq!(normalize_for_mobile(&track).artwork_url.as_deref(), Some("u"));
    }

    #[test]
    fn playback_commands_use_the_wire_tag() {
        let json = serde_json::to_value(PlaybackCommand::Seek { position_secs: 12.5 }).unwrap();
        assert_eq!(json["command"], "seek");
        let cmd: PlaybackCommand =
            serde_json::from_value(serde_json::json!({"command": "play"})).unwrap();
        assert!(matches!(cmd, PlaybackCommand::Play));
    }
}
