use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::{application::interaction::Interaction, gateway::Ready, voice::VoiceState},
    prelude::GatewayIntents,
};
use songbird::{SerenityInit, Songbird};
use tracing::{error, info};

use crate::backend::lavalink::LavalinkBackend;
use crate::backend::local::LocalBackend;
use crate::backend::AudioBackend;
use crate::commands::{BotData, BotDataMap, GENERAL_GROUP};
use crate::config::{BackendKind, Config};
use crate::display::DiscordDisplay;
use crate::manager::{PlayerManager, PlayerManagerKey};

mod backend;
mod commands;
mod config;
mod controller;
mod display;
mod error;
mod manager;
mod models;
mod panel;
mod state;
#[cfg(test)]
mod testing;
mod ytdlp;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let bot_id: Option<u64>;

        {
            let data = ctx.data.read().await;
            bot_id = data.get::<BotDataMap>().map(|data| data.id);
        }

        let (bot_id, guild_id) = match (bot_id, new.guild_id) {
            (Some(bot_id), Some(guild_id)) => (bot_id, guild_id),
            _ => return,
        };

        if bot_id != new.user_id.0 {
            return;
        }

        let player_manager = match manager::get(&ctx).await {
            Some(player_manager) => player_manager,
            None => return,
        };

        match new.channel_id {
            Some(channel_id) => player_manager.moved(guild_id, channel_id),
            None => {
                let rejoined = guild_id
                    .to_guild_cached(&ctx.cache)
                    .and_then(|guild| guild.voice_states.get(&new.user_id).and_then(|state| state.channel_id));

                if let Some(channel_id) = rejoined {
                    info!("Ignoring stale leave in guild {}, bot is in {}", guild_id.0, channel_id.0);
                    return;
                }

                info!("Bot left voice in guild {}", guild_id.0);
                player_manager.forget(guild_id, old.and_then(|state| state.channel_id));
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::MessageComponent(component) = interaction {
            panel::handle_component(&ctx, &component).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // A missing .env is fine when the variables come from the environment
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(&config.prefix))
        .after(commands::after)
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(Arc::clone(&songbird))
        .await?;

    let http = Arc::clone(&client.cache_and_http.http);
    let (events, event_receiver) = backend::event_channel();

    let audio_backend: Arc<dyn AudioBackend> = match &config.backend {
        BackendKind::Local => {
            info!("Playing through the local yt-dlp backend");
            Arc::new(LocalBackend::new(Arc::clone(&songbird), events))
        }
        BackendKind::Lavalink(lavalink) => {
            let user = http.get_current_user().await?;
            let backend =
                LavalinkBackend::connect_node(lavalink, user.id, Arc::clone(&songbird), events)
                    .await?;

            Arc::new(backend)
        }
    };

    let player_manager = PlayerManager::new(
        audio_backend,
        Arc::new(DiscordDisplay::new(http)),
        config.idle_timeout,
    );
    player_manager.route_events(event_receiver);

    {
        let mut w = client.data.write().await;
        w.insert::<PlayerManagerKey>(player_manager);
    }

    let shard_manager = Arc::clone(&client.shard_manager);

    tokio::spawn(async move {
        if let Err(why) = client.start().await {
            error!("Client ended: {why:?}");
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Received Ctrl-C, shutting down.");

    shard_manager.lock().await.shutdown_all().await;

    Ok(())
}
