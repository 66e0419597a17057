use lazy_static::lazy_static;
use regex::Regex;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;

use crate::error::PlayerResult;
use crate::models::{Resolution, Track};

pub mod lavalink;
pub mod local;

lazy_static! {
    static ref URL_REGEX: Regex = Regex::new(r"^https?://(?:www\.)?.+").unwrap();
}

/// Completion signal for a track started with [`AudioBackend::start`].
///
/// Sent whether the track ran to its end or was stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackEnded {
    pub guild_id: GuildId,
    pub serial: u64,
}

pub type EventSender = mpsc::UnboundedSender<TrackEnded>;
pub type EventReceiver = mpsc::UnboundedReceiver<TrackEnded>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Something that turns a [`Track`] into audio in a voice channel.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn resolve(&self, query: &str, requester: UserId) -> PlayerResult<Resolution>;

    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<()>;

    async fn disconnect(&self, guild_id: GuildId) -> PlayerResult<()>;

    fn is_connected(&self, guild_id: GuildId) -> bool;

    /// Starts `track`. A [`TrackEnded`] carrying `serial` follows once it
    /// stops for any reason.
    async fn start(&self, guild_id: GuildId, serial: u64, track: &Track) -> PlayerResult<()>;

    async fn stop_current(&self, guild_id: GuildId) -> PlayerResult<()>;

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlayerResult<()>;

    fn is_playing(&self, guild_id: GuildId) -> bool;
}

/// Strips the `<...>` Discord puts around links to suppress embeds.
pub fn normalize_query(query: &str) -> &str {
    query.trim().trim_start_matches('<').trim_end_matches('>').trim()
}

pub fn is_url(query: &str) -> bool {
    URL_REGEX.is_match(query)
}
