//! Buttons under the now-playing message.

use serenity::builder::CreateComponents;
use serenity::client::Context;
use serenity::model::application::component::ButtonStyle;
use serenity::model::application::interaction::message_component::MessageComponentInteraction;
use serenity::model::application::interaction::InteractionResponseType;
use serenity::model::channel::ReactionType;
use tracing::{info, warn};

use crate::commands::user_voice_channel;
use crate::display::queue_embed;
use crate::error::{PlayerError, PlayerResult};
use crate::manager;
use crate::models::{FinalStatus, QueueSnapshot};

pub const PAUSE: &str = "player:pause";
pub const SKIP: &str = "player:skip";
pub const STOP: &str = "player:stop";
pub const QUEUE: &str = "player:queue";

pub fn player_buttons(components: &mut CreateComponents) -> &mut CreateComponents {
    components
        .create_action_row(|row| {
            row.create_button(|b| {
                b.custom_id(PAUSE)
                    .label("Pause/Resume")
                    .emoji(ReactionType::Unicode("⏯️".to_string()))
                    .style(ButtonStyle::Primary)
            })
            .create_button(|b| {
                b.custom_id(SKIP)
                    .label("Skip")
                    .emoji(ReactionType::Unicode("⏭️".to_string()))
                    .style(ButtonStyle::Secondary)
            })
        })
        .create_action_row(|row| {
            row.create_button(|b| {
                b.custom_id(STOP)
                    .label("Stop")
                    .emoji(ReactionType::Unicode("⏹️".to_string()))
                    .style(ButtonStyle::Danger)
            })
            .create_button(|b| {
                b.custom_id(QUEUE)
                    .label("Queue")
                    .emoji(ReactionType::Unicode("🎵".to_string()))
                    .style(ButtonStyle::Success)
            })
        })
}

enum Reply {
    Text(String),
    Queue(QueueSnapshot),
}

/// Answers a press on one of the player buttons. Replies are only visible to
/// whoever pressed.
pub async fn handle_component(ctx: &Context, interaction: &MessageComponentInteraction) {
    info!(
        "Button {} pressed by {}",
        interaction.data.custom_id, interaction.user.name
    );

    let reply = match press(ctx, interaction).await {
        Ok(reply) => reply,
        Err(why) => Reply::Text(why.to_string()),
    };

    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|d| {
                    match &reply {
                        Reply::Text(text) => d.content(text),
                        Reply::Queue(snapshot) if snapshot.current.is_none() && snapshot.queued.is_empty() => {
                            d.content("The queue is empty.")
                        }
                        Reply::Queue(snapshot) => d.embed(|e| queue_embed(e, snapshot)),
                    }
                    .ephemeral(true)
                })
        })
        .await;

    if let Err(why) = result {
        warn!("Could not answer button press: {why:?}");
    }
}

async fn press(ctx: &Context, interaction: &MessageComponentInteraction) -> PlayerResult<Reply> {
    let guild_id = interaction.guild_id.ok_or(PlayerError::NotConnected)?;
    let manager = manager::get(ctx).await.ok_or(PlayerError::NotConnected)?;

    let bot_channel = manager
        .voice_channel(guild_id)
        .ok_or(PlayerError::NotConnected)?;

    match user_voice_channel(ctx, guild_id, interaction.user.id) {
        None => return Err(PlayerError::NotInVoiceChannel),
        Some(channel) if channel != bot_channel => return Err(PlayerError::WrongVoiceChannel),
        Some(_) => (),
    }

    let reply = match interaction.data.custom_id.as_str() {
        PAUSE => {
            let paused = manager.toggle_pause(guild_id).await?;
            Reply::Text(if paused { "⏸️ Paused!" } else { "▶️ Resumed!" }.to_string())
        }
        SKIP => {
            let track = manager.skip(guild_id).await?;
            Reply::Text(format!("⏭️ Skipped **{}**.", track.title))
        }
        STOP => {
            manager.stop(guild_id).await?;
            Reply::Text(FinalStatus::Stopped.message().to_string())
        }
        QUEUE => Reply::Queue(manager.snapshot(guild_id).await?),
        other => {
            warn!("Unknown button {other}");
            Reply::Text("That button doesn't do anything.".to_string())
        }
    };

    Ok(reply)
}
