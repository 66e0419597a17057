use std::time::Duration;

use serenity::model::id::UserId;

pub const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// A playable item plus the metadata shown in chat.
///
/// `source` is whatever the backend needs to start the track: the encoded
/// track for an audio node, the page URL for yt-dlp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub uri: String,
    pub source: String,
    pub requester: UserId,
    pub duration: Option<Duration>,
}

/// Result of looking up a user query.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub tracks: Vec<Track>,
    pub playlist: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayOutcome {
    /// Track that started right away, if nothing was playing before.
    pub started: Option<Track>,
    /// Number of tracks added by this call.
    pub added: usize,
    /// Queue length once the call returned.
    pub queued: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub paused: bool,
    pub queued: Vec<Track>,
}

/// Terminal state written into the last now-playing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    Finished,
    Stopped,
    Disconnected,
}

impl FinalStatus {
    pub fn message(self) -> &'static str {
        match self {
            FinalStatus::Finished => "Queue has finished.",
            FinalStatus::Stopped => "⏹️ Playback stopped and queue cleared.",
            FinalStatus::Disconnected => "✳️ Disconnected.",
        }
    }
}
