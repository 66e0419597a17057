use std::sync::Arc;

use serenity::client::Context;
use serenity::framework::standard::macros::{command, group, hook};
use serenity::framework::standard::{Args, CommandError, CommandResult};
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::channel::{Channel, Message};
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::Permissions;
use serenity::prelude::TypeMapKey;
use serenity::Result as SerenityResult;
use tracing::{info, warn};

use crate::display::enqueued_embed;
use crate::error::{PlayerError, PlayerResult};
use crate::manager::{self, PlayerManager};

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl TypeMapKey for BotDataMap {
    type Value = BotData;
}

#[group]
#[commands(play, skip, stop, queue, disconnect, help)]
pub struct General;

#[command]
#[aliases("p")]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args.message()).await
}

#[command]
#[aliases("s")]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let manager = player_manager(ctx).await?;
    let guild = get_guild(ctx, msg)?;

    require_voice(ctx, msg, &guild, &manager, false).await?;

    info!("SKIP - Skip command invoked from guild {}!", guild.id.0);

    let track = manager.skip(guild.id).await?;

    check_msg(
        msg.channel_id
            .say(&ctx.http, format!("⏭️ | Skipped **{}**.", track.title))
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let manager = player_manager(ctx).await?;
    let guild = get_guild(ctx, msg)?;

    require_voice(ctx, msg, &guild, &manager, false).await?;

    manager.stop(guild.id).await?;

    check_msg(
        msg.channel_id
            .say(&ctx.http, "⏹️ | Stopped playback and cleared the queue.")
            .await,
    );

    Ok(())
}

#[command]
#[aliases("q")]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let manager = player_manager(ctx).await?;
    let guild = get_guild(ctx, msg)?;

    require_voice(ctx, msg, &guild, &manager, false).await?;

    manager.show_queue(guild.id, msg.channel_id).await?;

    Ok(())
}

#[command]
#[aliases("dc")]
#[only_in(guilds)]
async fn disconnect(ctx: &Context, msg: &Message) -> CommandResult {
    let manager = player_manager(ctx).await?;
    let guild = get_guild(ctx, msg)?;

    require_voice(ctx, msg, &guild, &manager, false).await?;

    manager.disconnect(guild.id).await?;

    check_msg(msg.channel_id.say(&ctx.http, "✳️ | Disconnected.").await);

    Ok(())
}

#[command]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **play [URL|Title]** (p) - Plays (or adds to the queue) tracks given a URL or a search (supports playlists).
    **skip** (s) - Skips the current track.
    **stop** - Stops the current track and clears the queue.
    **queue** (q) - Shows the queue of tracks.
    **disconnect** (dc) - Leaves the voice channel.
The buttons under the now playing message pause/resume, skip, stop and show the queue.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

/// Reports a failed command in the channel it came from.
#[hook]
pub async fn after(ctx: &Context, msg: &Message, command_name: &str, result: CommandResult) {
    if let Err(why) = result {
        info!("Command '{command_name}' returned error {why:?}");

        check_msg(msg.channel_id.say(&ctx.http, why.to_string()).await);
    }
}

async fn play_with_reaction(ctx: &Context, msg: &Message, query: &str) -> CommandResult {
    let bot_id = bot_id(ctx).await;
    let loading_emoji = Unicode("⏳".to_string());

    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let play_result = play_query(ctx, msg, query).await;

    if let Some(bot_id) = bot_id {
        msg.channel_id
            .delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji)
            .await?;
    }

    let answer_emoji = match play_result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    play_result
}

async fn play_query(ctx: &Context, msg: &Message, query: &str) -> CommandResult {
    if query.trim().is_empty() {
        return Err(CommandError::from("Usage: play [URL|Title]"));
    }

    let manager = player_manager(ctx).await?;
    let guild = get_guild(ctx, msg)?;
    let voice_channel = require_voice(ctx, msg, &guild, &manager, true).await?;

    info!("User input is {query}");

    let (resolution, outcome) = manager
        .load_and_play(guild.id, voice_channel, msg.channel_id, query, msg.author.id)
        .await?;

    // A lone track that started right away already has its now playing panel.
    if outcome.started.is_none() || resolution.tracks.len() > 1 {
        check_msg(
            msg.channel_id
                .send_message(&ctx.http, |m| {
                    m.embed(|e| enqueued_embed(e, &resolution.tracks, resolution.playlist.as_deref()))
                })
                .await,
        );
    }

    info!(
        "Added {} tracks in guild {} (started: {:?}, queued: {})",
        outcome.added,
        guild.id.0,
        outcome.started.map(|track| track.title),
        outcome.queued
    );

    Ok(())
}

/// Checks the author can drive the player and returns their voice channel.
///
/// Once the bot is connected the author has to share its channel. Otherwise
/// only commands that may connect pass, and only if the bot can join.
async fn require_voice(
    ctx: &Context,
    msg: &Message,
    guild: &Guild,
    manager: &PlayerManager,
    may_connect: bool,
) -> PlayerResult<ChannelId> {
    let user_channel = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or(PlayerError::NotInVoiceChannel)?;

    match manager.voice_channel(guild.id) {
        Some(bot_channel) if bot_channel == user_channel => Ok(user_channel),
        Some(_) => Err(PlayerError::WrongVoiceChannel),
        None if may_connect => {
            check_permissions(ctx, guild, user_channel).await?;
            Ok(user_channel)
        }
        None => Err(PlayerError::NotConnected),
    }
}

async fn check_permissions(ctx: &Context, guild: &Guild, channel_id: ChannelId) -> PlayerResult<()> {
    let bot_id = ctx.cache.current_user_id();

    let channel = match guild.channels.get(&channel_id) {
        Some(Channel::Guild(channel)) => channel.clone(),
        _ => channel_id
            .to_channel(ctx)
            .await?
            .guild()
            .ok_or(PlayerError::NotInVoiceChannel)?,
    };

    let member = match guild.members.get(&bot_id) {
        Some(member) => member.clone(),
        None => guild.id.member(&ctx.http, bot_id).await?,
    };

    let permissions = guild.user_permissions_in(&channel, &member)?;

    require_voice_permissions(permissions).map_err(|why| {
        warn!("Missing voice permissions in channel {}", channel_id.0);
        why
    })
}

fn require_voice_permissions(permissions: Permissions) -> PlayerResult<()> {
    if permissions.contains(Permissions::CONNECT | Permissions::SPEAK) {
        Ok(())
    } else {
        Err(PlayerError::MissingPermissions)
    }
}

/// The voice channel `user_id` currently sits in, from the cache.
pub fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    guild_id
        .to_guild_cached(&ctx.cache)?
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

async fn bot_id(ctx: &Context) -> Option<u64> {
    let data = ctx.data.read().await;

    data.get::<BotDataMap>().map(|data| data.id)
}

async fn player_manager(ctx: &Context) -> Result<Arc<PlayerManager>, CommandError> {
    manager::get(ctx)
        .await
        .ok_or_else(|| CommandError::from("Player is not ready yet"))
}

/// Checks that a message successfully sent; if not, then logs why.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> Result<Guild, CommandError> {
    msg.guild(&ctx.cache)
        .ok_or_else(|| CommandError::from("Guild not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joining_needs_connect_and_speak() {
        assert!(require_voice_permissions(Permissions::CONNECT | Permissions::SPEAK).is_ok());
        assert!(matches!(
            require_voice_permissions(Permissions::CONNECT),
            Err(PlayerError::MissingPermissions)
        ));
        assert!(matches!(
            require_voice_permissions(Permissions::empty()),
            Err(PlayerError::MissingPermissions)
        ));
    }
}
