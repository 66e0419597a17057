//! Lavalink v4 payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Just enough of a websocket message to decide how to parse the rest.
#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    pub op: String,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub session_id: String,
    pub resumed: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TrackData {
    pub encoded: String,
    pub info: TrackInfo,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub length: u64,
    pub is_stream: bool,
    pub title: String,
    pub uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    pub tracks: Vec<TrackData>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistInfo {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Exception {
    pub message: Option<String>,
    pub severity: String,
}

/// Tracks found by a `loadtracks` request.
#[derive(Debug, PartialEq)]
pub enum Loaded {
    Tracks(Vec<TrackData>),
    Playlist { name: String, tracks: Vec<TrackData> },
    Nothing,
    Failed(String),
}

impl LoadResult {
    pub fn into_loaded(self) -> serde_json::Result<Loaded> {
        Ok(match self.load_type {
            LoadType::Track => Loaded::Tracks(vec![serde_json::from_value(self.data)?]),
            // Only the best search hit is played.
            LoadType::Search => {
                let mut hits: Vec<TrackData> = serde_json::from_value(self.data)?;
                hits.truncate(1);
                Loaded::Tracks(hits)
            }
            LoadType::Playlist => {
                let playlist: PlaylistData = serde_json::from_value(self.data)?;
                Loaded::Playlist {
                    name: playlist.info.name,
                    tracks: playlist.tracks,
                }
            }
            LoadType::Empty => Loaded::Nothing,
            LoadType::Error => {
                let exception: Exception = serde_json::from_value(self.data)?;
                Loaded::Failed(exception.message.unwrap_or(exception.severity))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEndEvent {
    pub guild_id: String,
    pub track: TrackData,
    pub reason: TrackEndReason,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackExceptionEvent {
    pub guild_id: String,
    pub exception: Exception,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuckEvent {
    pub guild_id: String,
    pub threshold_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosedEvent {
    pub guild_id: String,
    pub code: u16,
    pub reason: String,
    pub by_remote: bool,
}

/// Body of `PATCH /v4/sessions/{session}/players/{guild}`. Unset fields are
/// left alone by the node.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

/// `encoded: None` serializes as `null`, which stops the player.
#[derive(Debug, Serialize)]
pub struct UpdateTrack {
    pub encoded: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}
