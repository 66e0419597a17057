//! One serialized task per guild.
//!
//! Commands, backend completion signals and idle timer fires for a guild are
//! all messages in that guild's mailbox, so they never interleave. Different
//! guilds run on different tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serenity::client::Context;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::prelude::TypeMapKey;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::backend::{AudioBackend, EventReceiver};
use crate::controller::PlaybackController;
use crate::display::PlayerDisplay;
use crate::error::{PlayerError, PlayerResult};
use crate::models::{PlayOutcome, QueueSnapshot, Resolution, Track};
use crate::state::GuildPlaybackState;

pub struct PlayerManagerKey;

impl TypeMapKey for PlayerManagerKey {
    type Value = Arc<PlayerManager>;
}

/// The manager stored in the client data at startup.
pub async fn get(ctx: &Context) -> Option<Arc<PlayerManager>> {
    let data = ctx.data.read().await;

    data.get::<PlayerManagerKey>().cloned()
}

enum GuildMessage {
    Play {
        tracks: Vec<Track>,
        reply: oneshot::Sender<PlayerResult<PlayOutcome>>,
    },
    Skip {
        reply: oneshot::Sender<PlayerResult<Track>>,
    },
    Stop {
        reply: oneshot::Sender<PlayerResult<()>>,
    },
    TogglePause {
        reply: oneshot::Sender<PlayerResult<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    ShowQueue {
        channel: ChannelId,
        reply: oneshot::Sender<PlayerResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<PlayerResult<()>>,
    },
    Moved {
        channel: ChannelId,
    },
    Forget,
    TrackFinished {
        serial: u64,
    },
}

struct GuildHandle {
    session: u64,
    voice_channel: ChannelId,
    mailbox: mpsc::UnboundedSender<GuildMessage>,
}

pub struct PlayerManager {
    backend: Arc<dyn AudioBackend>,
    display: Arc<dyn PlayerDisplay>,
    idle_timeout: Duration,
    sessions: Arc<DashMap<GuildId, GuildHandle>>,
    connecting: DashMap<GuildId, Arc<Mutex<()>>>,
    next_session: AtomicU64,
}

impl PlayerManager {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        display: Arc<dyn PlayerDisplay>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            display,
            idle_timeout,
            sessions: Arc::new(DashMap::new()),
            connecting: DashMap::new(),
            next_session: AtomicU64::new(0),
        })
    }

    /// Forwards backend completion signals to the owning guild task.
    pub fn route_events(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            while let Some(ended) = events.recv().await {
                let mailbox = sessions
                    .get(&ended.guild_id)
                    .map(|handle| handle.mailbox.clone());

                match mailbox {
                    Some(mailbox) => {
                        let _ = mailbox.send(GuildMessage::TrackFinished {
                            serial: ended.serial,
                        });
                    }
                    None => debug!(
                        "Dropping completion of track #{} for guild {} without a session",
                        ended.serial, ended.guild_id.0
                    ),
                }
            }
        })
    }

    pub async fn resolve(&self, query: &str, requester: UserId) -> PlayerResult<Resolution> {
        self.backend.resolve(query, requester).await
    }

    /// Looks `query` up and, only if that found something, joins
    /// `voice_channel` and queues the result.
    pub async fn load_and_play(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: ChannelId,
        query: &str,
        requester: UserId,
    ) -> PlayerResult<(Resolution, PlayOutcome)> {
        let resolution = self.resolve(query, requester).await?;

        self.connect(guild_id, voice_channel, text_channel).await?;
        let outcome = self.play(guild_id, resolution.tracks.clone()).await?;

        Ok((resolution, outcome))
    }

    /// The voice channel the bot is in for `guild_id`, if it has a session.
    pub fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.sessions.get(&guild_id).map(|handle| handle.voice_channel)
    }

    /// Joins `voice_channel` and opens a session, unless one already exists.
    pub async fn connect(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: ChannelId,
    ) -> PlayerResult<()> {
        let lock = self.connect_lock(guild_id);
        let _guard = lock.lock().await;

        if self.sessions.contains_key(&guild_id) {
            return Ok(());
        }

        self.backend.connect(guild_id, voice_channel).await?;
        self.open_session(guild_id, voice_channel, text_channel, Arc::clone(&lock));

        Ok(())
    }

    pub async fn play(&self, guild_id: GuildId, tracks: Vec<Track>) -> PlayerResult<PlayOutcome> {
        self.request(guild_id, |reply| GuildMessage::Play { tracks, reply })
            .await?
    }

    pub async fn skip(&self, guild_id: GuildId) -> PlayerResult<Track> {
        self.request(guild_id, |reply| GuildMessage::Skip { reply })
            .await?
    }

    pub async fn stop(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.request(guild_id, |reply| GuildMessage::Stop { reply })
            .await?
    }

    pub async fn toggle_pause(&self, guild_id: GuildId) -> PlayerResult<bool> {
        self.request(guild_id, |reply| GuildMessage::TogglePause { reply })
            .await?
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> PlayerResult<QueueSnapshot> {
        self.request(guild_id, |reply| GuildMessage::Snapshot { reply })
            .await
    }

    pub async fn show_queue(&self, guild_id: GuildId, channel: ChannelId) -> PlayerResult<()> {
        self.request(guild_id, |reply| GuildMessage::ShowQueue { channel, reply })
            .await?
    }

    pub async fn disconnect(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.request(guild_id, |reply| GuildMessage::Disconnect { reply })
            .await?
    }

    /// The bot was moved to another voice channel by someone else.
    pub fn moved(&self, guild_id: GuildId, channel: ChannelId) {
        if let Some(mut handle) = self.sessions.get_mut(&guild_id) {
            handle.voice_channel = channel;
            let _ = handle.mailbox.send(GuildMessage::Moved { channel });
        }
    }

    /// The bot left `left` without going through [`disconnect`](Self::disconnect).
    ///
    /// Ignored when the session is in another channel, which happens when the
    /// notice arrives after the bot already rejoined elsewhere.
    pub fn forget(&self, guild_id: GuildId, left: Option<ChannelId>) {
        if let Some(handle) = self.sessions.get(&guild_id) {
            match left {
                Some(channel) if channel != handle.voice_channel => {
                    debug!("Ignoring departure from {} while in {}", channel.0, handle.voice_channel.0);
                }
                _ => {
                    let _ = handle.mailbox.send(GuildMessage::Forget);
                }
            }
        }
    }

    fn connect_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        Arc::clone(self.connecting.entry(guild_id).or_default().value())
    }

    async fn request<T>(
        &self,
        guild_id: GuildId,
        message: impl FnOnce(oneshot::Sender<T>) -> GuildMessage,
    ) -> PlayerResult<T> {
        let mailbox = self
            .sessions
            .get(&guild_id)
            .map(|handle| handle.mailbox.clone())
            .ok_or(PlayerError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        mailbox
            .send(message(reply))
            .map_err(|_| PlayerError::NotConnected)?;

        response.await.map_err(|_| PlayerError::NotConnected)
    }

    fn open_session(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: ChannelId,
        connect_lock: Arc<Mutex<()>>,
    ) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (mailbox, messages) = mpsc::unbounded_channel();
        let (idle_fire, idle_fires) = mpsc::unbounded_channel();

        let mut controller = PlaybackController::new(
            guild_id,
            GuildPlaybackState::new(text_channel, voice_channel),
            Arc::clone(&self.backend),
            Arc::clone(&self.display),
            self.idle_timeout,
            idle_fire,
        );
        controller.arm_idle();

        self.sessions.insert(
            guild_id,
            GuildHandle {
                session,
                voice_channel,
                mailbox,
            },
        );

        info!("Opened playback session {session} for guild {}", guild_id.0);

        let registration = Registration {
            guild_id,
            session,
            sessions: Arc::clone(&self.sessions),
            connect_lock,
        };

        tokio::spawn(
            async move {
                run_session(controller, messages, idle_fires, &registration).await;

                registration.unregister();
                info!("Closed playback session {session}");
            }
            .instrument(info_span!("guild", id = guild_id.0)),
        );
    }
}

/// A session's entry in the manager.
struct Registration {
    guild_id: GuildId,
    session: u64,
    sessions: Arc<DashMap<GuildId, GuildHandle>>,
    connect_lock: Arc<Mutex<()>>,
}

impl Registration {
    fn unregister(&self) {
        self.sessions
            .remove_if(&self.guild_id, |_, handle| handle.session == self.session);
    }

    /// Unregisters before the session leaves voice. A `connect` for the guild
    /// waits on the returned guard, so it can't join before the old
    /// connection is gone. Messages still queued are dropped.
    async fn retire(&self, messages: &mut mpsc::UnboundedReceiver<GuildMessage>) -> OwnedMutexGuard<()> {
        let guard = Arc::clone(&self.connect_lock).lock_owned().await;

        messages.close();
        self.unregister();

        guard
    }
}

async fn run_session(
    mut controller: PlaybackController,
    mut messages: mpsc::UnboundedReceiver<GuildMessage>,
    mut idle_fires: mpsc::UnboundedReceiver<u64>,
    registration: &Registration,
) {
    loop {
        tokio::select! {
            // Commands first: a play waiting next to an idle fire must win.
            biased;

            message = messages.recv() => match message {
                Some(GuildMessage::Disconnect { reply }) => {
                    let _guard = registration.retire(&mut messages).await;
                    let _ = reply.send(controller.disconnect().await);
                    return;
                }
                Some(GuildMessage::Forget) => {
                    let _guard = registration.retire(&mut messages).await;
                    controller.forget().await;
                    return;
                }
                Some(message) => handle(&mut controller, message).await,
                None => return,
            },
            Some(generation) = idle_fires.recv() => {
                if controller.idle_expired(generation) {
                    let _guard = registration.retire(&mut messages).await;
                    controller.leave_idle().await;
                    return;
                }
            }
        }

        if controller.is_defunct() {
            let _guard = registration.retire(&mut messages).await;

            if let Err(why) = controller.disconnect().await {
                warn!("Disconnect after rejected credentials failed: {why}");
            }

            return;
        }
    }
}

async fn handle(controller: &mut PlaybackController, message: GuildMessage) {
    match message {
        GuildMessage::Play { tracks, reply } => {
            let _ = reply.send(controller.play(tracks).await);
        }
        GuildMessage::Skip { reply } => {
            let _ = reply.send(controller.skip().await);
        }
        GuildMessage::Stop { reply } => {
            let _ = reply.send(controller.stop().await);
        }
        GuildMessage::TogglePause { reply } => {
            let _ = reply.send(controller.toggle_pause().await);
        }
        GuildMessage::Snapshot { reply } => {
            let _ = reply.send(controller.snapshot());
        }
        GuildMessage::ShowQueue { channel, reply } => {
            let _ = reply.send(controller.show_queue(channel).await);
        }
        GuildMessage::Moved { channel } => controller.set_voice_channel(channel),
        GuildMessage::TrackFinished { serial } => controller.on_track_finished(serial).await,
        // Both end the session and are taken care of by `run_session`.
        GuildMessage::Disconnect { .. } | GuildMessage::Forget => (),
    }
}
