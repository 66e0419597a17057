//! Plays tracks through songbird's own driver, fetching audio with yt-dlp
//! and ffmpeg on this machine.

use std::sync::Arc;

use dashmap::DashMap;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::tracks::TrackHandle;
use songbird::TrackEvent::End;
use songbird::{ytdl, Event, EventContext, EventHandler as VoiceEventHandler, Songbird};
use tracing::info;

use crate::backend::{normalize_query, AudioBackend, EventSender, TrackEnded};
use crate::error::{PlayerError, PlayerResult};
use crate::models::{Resolution, Track};
use crate::ytdlp;

type TrackHandles = Arc<DashMap<GuildId, (u64, TrackHandle)>>;

pub struct LocalBackend {
    songbird: Arc<Songbird>,
    tracks: TrackHandles,
    events: EventSender,
}

impl LocalBackend {
    pub fn new(songbird: Arc<Songbird>, events: EventSender) -> Self {
        Self {
            songbird,
            tracks: Arc::new(DashMap::new()),
            events,
        }
    }

    fn current_handle(&self, guild_id: GuildId) -> Option<TrackHandle> {
        self.tracks.get(&guild_id).map(|entry| entry.1.clone())
    }
}

#[async_trait]
impl AudioBackend for LocalBackend {
    async fn resolve(&self, query: &str, requester: UserId) -> PlayerResult<Resolution> {
        ytdlp::lookup(normalize_query(query), requester).await
    }

    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<()> {
        let (handler_lock, result) = self.songbird.join(guild_id, channel_id).await;
        result.map_err(|why| PlayerError::Voice(why.to_string()))?;

        let mut handler = handler_lock.lock().await;

        if handler.is_deaf() {
            info!("Already deafened");
        } else if let Err(why) = handler.deafen(true).await {
            info!("Deafen failed due to {why:?}");
        }

        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.tracks.remove(&guild_id);

        if self.songbird.get(guild_id).is_some() {
            self.songbird
                .remove(guild_id)
                .await
                .map_err(|why| PlayerError::Voice(why.to_string()))?;
        }

        Ok(())
    }

    fn is_connected(&self, guild_id: GuildId) -> bool {
        self.songbird.get(guild_id).is_some()
    }

    async fn start(&self, guild_id: GuildId, serial: u64, track: &Track) -> PlayerResult<()> {
        let handler_lock = self.songbird.get(guild_id).ok_or(PlayerError::NotConnected)?;

        let source = ytdl(&track.source)
            .await
            .map_err(|why| PlayerError::Backend(why.to_string()))?;

        let mut handler = handler_lock.lock().await;

        // Just in case something was playing before
        handler.stop();
        let track_handle = handler.play_source(source);

        track_handle
            .add_event(
                Event::Track(End),
                TrackEndNotifier {
                    guild_id,
                    serial,
                    tracks: Arc::clone(&self.tracks),
                    events: self.events.clone(),
                },
            )
            .map_err(|why| PlayerError::Backend(why.to_string()))?;

        self.tracks.insert(guild_id, (serial, track_handle));

        Ok(())
    }

    async fn stop_current(&self, guild_id: GuildId) -> PlayerResult<()> {
        if let Some(track_handle) = self.current_handle(guild_id) {
            track_handle
                .stop()
                .map_err(|why| PlayerError::Backend(why.to_string()))?;
        }

        Ok(())
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlayerResult<()> {
        let track_handle = self
            .current_handle(guild_id)
            .ok_or(PlayerError::NothingPlaying)?;

        let result = if paused {
            track_handle.pause()
        } else {
            track_handle.play()
        };

        result.map_err(|why| PlayerError::Backend(why.to_string()))
    }

    fn is_playing(&self, guild_id: GuildId) -> bool {
        self.tracks.contains_key(&guild_id)
    }
}

struct TrackEndNotifier {
    guild_id: GuildId,
    serial: u64,
    tracks: TrackHandles,
    events: EventSender,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered for track #{}", self.serial);

        self.tracks
            .remove_if(&self.guild_id, |_, (serial, _)| *serial == self.serial);

        let _ = self.events.send(TrackEnded {
            guild_id: self.guild_id,
            serial: self.serial,
        });

        None
    }
}
