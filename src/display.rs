use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::builder::CreateEmbed;
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};
use serenity::utils::Colour;

use crate::error::{PlayerError, PlayerResult};
use crate::models::{FinalStatus, QueueSnapshot, Track};
use crate::panel;

const MAX_LISTED_TRACKS: usize = 20;

/// Where playback announcements go.
///
/// `remove_now_playing` and `finalize_now_playing` report
/// [`PlayerError::DisplayStale`] when the message is already gone.
#[async_trait]
pub trait PlayerDisplay: Send + Sync {
    async fn show_now_playing(&self, channel: ChannelId, track: &Track) -> PlayerResult<MessageId>;

    async fn remove_now_playing(&self, channel: ChannelId, message: MessageId) -> PlayerResult<()>;

    async fn finalize_now_playing(
        &self,
        channel: ChannelId,
        message: MessageId,
        status: FinalStatus,
    ) -> PlayerResult<()>;

    async fn show_queue(&self, channel: ChannelId, snapshot: &QueueSnapshot) -> PlayerResult<()>;

    async fn announce(&self, channel: ChannelId, text: &str) -> PlayerResult<()>;
}

pub struct DiscordDisplay {
    http: Arc<Http>,
}

impl DiscordDisplay {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PlayerDisplay for DiscordDisplay {
    async fn show_now_playing(&self, channel: ChannelId, track: &Track) -> PlayerResult<MessageId> {
        let message = channel
            .send_message(&self.http, |m| {
                m.embed(|e| now_playing_embed(e, track))
                    .components(|c| panel::player_buttons(c))
            })
            .await?;

        Ok(message.id)
    }

    async fn remove_now_playing(&self, channel: ChannelId, message: MessageId) -> PlayerResult<()> {
        channel
            .delete_message(&self.http, message)
            .await
            .map_err(PlayerError::from_message_edit)
    }

    async fn finalize_now_playing(
        &self,
        channel: ChannelId,
        message: MessageId,
        status: FinalStatus,
    ) -> PlayerResult<()> {
        channel
            .edit_message(&self.http, message, |m| {
                m.content(status.message())
                    .set_embeds(Vec::new())
                    .components(|c| c)
            })
            .await
            .map(|_| ())
            .map_err(PlayerError::from_message_edit)
    }

    async fn show_queue(&self, channel: ChannelId, snapshot: &QueueSnapshot) -> PlayerResult<()> {
        if snapshot.current.is_none() && snapshot.queued.is_empty() {
            channel.say(&self.http, "The queue is empty.").await?;
        } else {
            channel
                .send_message(&self.http, |m| m.embed(|e| queue_embed(e, snapshot)))
                .await?;
        }

        Ok(())
    }

    async fn announce(&self, channel: ChannelId, text: &str) -> PlayerResult<()> {
        channel.say(&self.http, text).await?;

        Ok(())
    }
}

pub fn now_playing_embed<'a>(embed: &'a mut CreateEmbed, track: &Track) -> &'a mut CreateEmbed {
    embed
        .title("Now Playing")
        .description(track_link(track))
        .colour(Colour::DARK_GREEN)
        .field("Requested by", format!("<@{}>", track.requester.0), true);

    if let Some(duration) = track.duration {
        embed.field("Duration", format!("`{}`", format_duration(duration)), true);
    }

    embed
}

pub fn queue_embed<'a>(embed: &'a mut CreateEmbed, snapshot: &QueueSnapshot) -> &'a mut CreateEmbed {
    embed
        .title("Music Queue")
        .description(queue_description(snapshot))
        .colour(Colour::BLUE)
}

pub fn enqueued_embed<'a>(
    embed: &'a mut CreateEmbed,
    tracks: &[Track],
    playlist: Option<&str>,
) -> &'a mut CreateEmbed {
    embed.colour(Colour::BLURPLE);

    match (playlist, tracks) {
        (Some(name), _) => embed
            .title("Playlist Enqueued!")
            .description(format!("{name} - {} tracks", tracks.len())),
        (None, [track]) => embed.title("Track Enqueued").description(track_link(track)),
        (None, _) => embed
            .title("Tracks Enqueued")
            .description(format!("{} tracks", tracks.len())),
    }
}

pub fn track_link(track: &Track) -> String {
    format!("[{}]({})", track.title, track.uri)
}

pub fn queue_description(snapshot: &QueueSnapshot) -> String {
    let mut description = String::new();

    if let Some(current) = &snapshot.current {
        let state = if snapshot.paused { "Paused" } else { "Now" };
        let _ = writeln!(description, "**{state}:** {}\n", track_link(current));
    }

    for (index, track) in snapshot.queued.iter().take(MAX_LISTED_TRACKS).enumerate() {
        let _ = writeln!(description, "{}. {}", index + 1, track_link(track));
    }

    let hidden = snapshot.queued.len().saturating_sub(MAX_LISTED_TRACKS);
    if hidden > 0 {
        let _ = writeln!(description, "… and {hidden} more");
    }

    description.trim_end().to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let (hours, minutes, seconds) = (seconds / 3600, (seconds / 60) % 60, seconds % 60);

    if hours > 0 {
        format!("{hours}:{minutes:0>2}:{seconds:0>2}")
    } else {
        format!("{minutes}:{seconds:0>2}")
    }
}
