//! Client for a Lavalink v4 audio node: REST calls drive the player, the
//! websocket reports track events. Voice connections are opened by songbird
//! in gateway-only mode and handed over to the node.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client as HttpClient, Response, StatusCode};
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::Songbird;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backend::{is_url, normalize_query, AudioBackend, EventSender, TrackEnded};
use crate::config::LavalinkConfig;
use crate::error::{PlayerError, PlayerResult};
use crate::models::{Resolution, Track};

use self::model::{
    GatewayEvent, LoadResult, Loaded, Ready, TrackData, TrackEndEvent, TrackEndReason,
    TrackExceptionEvent, TrackStuckEvent, UpdatePlayer, UpdateTrack, VoiceState,
    WebSocketClosedEvent,
};

pub mod model;

const CLIENT_NAME: &str = concat!("jukebot/", env!("CARGO_PKG_VERSION"));
const READY_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Players = Arc<DashMap<GuildId, PlayerSlot>>;

#[derive(Default)]
struct PlayerSlot {
    /// Serial and encoded form of the track the node is playing.
    current: Option<(u64, String)>,
    /// The track we last asked the node to stop, until its `stopped` event
    /// comes back. The same track may be playing again by then.
    stopping: Option<(u64, String)>,
}

pub struct LavalinkBackend {
    http: HttpClient,
    rest: String,
    session_id: String,
    songbird: Arc<Songbird>,
    players: Players,
}

impl LavalinkBackend {
    /// Opens the event websocket, waits for the node's `ready` and starts
    /// forwarding track events to `events`.
    pub async fn connect_node(
        config: &LavalinkConfig,
        user_id: UserId,
        songbird: Arc<Songbird>,
        events: EventSender,
    ) -> PlayerResult<Self> {
        let mut request = config
            .socket_url()
            .into_client_request()
            .map_err(|why| PlayerError::Backend(why.to_string()))?;

        let headers = request.headers_mut();
        headers.insert("Authorization", ws_header(&config.password)?);
        headers.insert("User-Id", ws_header(&user_id.0.to_string())?);
        headers.insert("Client-Name", ws_header(CLIENT_NAME)?);

        info!("Connecting to Lavalink node at {}", config.socket_url());

        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;

        let ready = tokio::time::timeout(READY_TIMEOUT, wait_for_ready(&mut socket))
            .await
            .map_err(|_| PlayerError::Backend("timed out waiting for the node".to_string()))??;

        info!(
            "Lavalink session {} ready (resumed: {})",
            ready.session_id, ready.resumed
        );

        let mut rest_headers = HeaderMap::new();
        rest_headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&config.password)
                .map_err(|why| PlayerError::Backend(why.to_string()))?,
        );

        let http = HttpClient::builder().default_headers(rest_headers).build()?;
        let players: Players = Arc::new(DashMap::new());

        tokio::spawn(pump_events(socket, Arc::clone(&players), events));

        Ok(Self {
            http,
            rest: format!("{}/v4", config.rest_url()),
            session_id: ready.session_id,
            songbird,
            players,
        })
    }

    fn player_url(&self, guild_id: GuildId) -> String {
        format!(
            "{}/sessions/{}/players/{}",
            self.rest, self.session_id, guild_id.0
        )
    }

    async fn update_player(&self, guild_id: GuildId, update: &UpdatePlayer) -> PlayerResult<()> {
        let response = self
            .http
            .patch(self.player_url(guild_id))
            .json(update)
            .send()
            .await?;

        check_status(response).await?;

        Ok(())
    }
}

#[async_trait]
impl AudioBackend for LavalinkBackend {
    async fn resolve(&self, query: &str, requester: UserId) -> PlayerResult<Resolution> {
        let query = normalize_query(query);
        let identifier = if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch:{query}")
        };

        let response = self
            .http
            .get(format!("{}/loadtracks", self.rest))
            .query(&[("identifier", identifier.as_str())])
            .send()
            .await?;

        let result: LoadResult = check_status(response).await?.json().await?;

        let resolution = match result.into_loaded()? {
            Loaded::Tracks(tracks) => Resolution {
                tracks: to_tracks(tracks, requester),
                playlist: None,
            },
            Loaded::Playlist { name, tracks } => Resolution {
                tracks: to_tracks(tracks, requester),
                playlist: Some(name),
            },
            Loaded::Nothing => return Err(PlayerError::ResolutionFailed),
            Loaded::Failed(message) => {
                warn!("Lavalink could not load {identifier}: {message}");
                return Err(PlayerError::ResolutionFailed);
            }
        };

        if resolution.tracks.is_empty() {
            return Err(PlayerError::ResolutionFailed);
        }

        Ok(resolution)
    }

    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<()> {
        let (_call, result) = self.songbird.join_gateway(guild_id, channel_id).await;
        let connection = result.map_err(|why| PlayerError::Voice(why.to_string()))?;

        let update = UpdatePlayer {
            voice: Some(VoiceState {
                token: connection.token,
                endpoint: connection.endpoint,
                session_id: connection.session_id,
            }),
            ..Default::default()
        };

        if let Err(why) = self.update_player(guild_id, &update).await {
            let _ = self.songbird.remove(guild_id).await;
            return Err(why);
        }

        self.players.insert(guild_id, PlayerSlot::default());

        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.players.remove(&guild_id);

        if self.songbird.get(guild_id).is_some() {
            self.songbird
                .remove(guild_id)
                .await
                .map_err(|why| PlayerError::Voice(why.to_string()))?;
        }

        let response = self.http.delete(self.player_url(guild_id)).send().await?;

        if response.status() != StatusCode::NOT_FOUND {
            check_status(response).await?;
        }

        Ok(())
    }

    fn is_connected(&self, guild_id: GuildId) -> bool {
        self.players.contains_key(&guild_id)
    }

    async fn start(&self, guild_id: GuildId, serial: u64, track: &Track) -> PlayerResult<()> {
        // Recorded first: the end event of a track that fails to load can
        // arrive before the request returns.
        match self.players.get_mut(&guild_id) {
            Some(mut slot) => slot.current = Some((serial, track.source.clone())),
            None => return Err(PlayerError::NotConnected),
        }

        let update = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: Some(track.source.clone()),
            }),
            paused: Some(false),
            ..Default::default()
        };

        if let Err(why) = self.update_player(guild_id, &update).await {
            if let Some(mut slot) = self.players.get_mut(&guild_id) {
                if matches!(slot.current, Some((current, _)) if current == serial) {
                    slot.current = None;
                }
            }

            return Err(why);
        }

        Ok(())
    }

    async fn stop_current(&self, guild_id: GuildId) -> PlayerResult<()> {
        let stopped = mark_stopping(&self.players, guild_id);

        let update = UpdatePlayer {
            track: Some(UpdateTrack { encoded: None }),
            ..Default::default()
        };

        let result = self.update_player(guild_id, &update).await;

        if let (Err(_), Some(stopped)) = (&result, stopped) {
            if let Some(mut slot) = self.players.get_mut(&guild_id) {
                if slot.current.is_none() {
                    slot.stopping = None;
                    slot.current = Some(stopped);
                }
            }
        }

        result
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlayerResult<()> {
        let update = UpdatePlayer {
            paused: Some(paused),
            ..Default::default()
        };

        self.update_player(guild_id, &update).await
    }

    fn is_playing(&self, guild_id: GuildId) -> bool {
        self.players
            .get(&guild_id)
            .map_or(false, |slot| slot.current.is_some())
    }
}

fn ws_header(value: &str) -> PlayerResult<WsHeaderValue> {
    WsHeaderValue::from_str(value).map_err(|why| PlayerError::Backend(why.to_string()))
}

fn handshake_error(why: WsError) -> PlayerError {
    match &why {
        WsError::Http(response) if response.status().as_u16() == 401 => PlayerError::BackendAuthFailed,
        _ => PlayerError::Backend(format!("could not reach the Lavalink node: {why}")),
    }
}

async fn check_status(response: Response) -> PlayerResult<Response> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PlayerError::BackendAuthFailed);
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PlayerError::Backend(format!("{status}: {body}")));
    }

    Ok(response)
}

fn to_tracks(tracks: Vec<TrackData>, requester: UserId) -> Vec<Track> {
    tracks
        .into_iter()
        .map(|TrackData { encoded, info }| Track {
            title: info.title,
            uri: info.uri.unwrap_or(info.identifier),
            source: encoded,
            requester,
            duration: if info.is_stream {
                None
            } else {
                Some(Duration::from_millis(info.length))
            },
        })
        .collect()
}

async fn wait_for_ready(socket: &mut Socket) -> PlayerResult<Ready> {
    while let Some(message) = socket.next().await {
        match message.map_err(|why| PlayerError::Backend(why.to_string()))? {
            Message::Text(text) => {
                let event: GatewayEvent = serde_json::from_str(&text)?;

                if event.op == "ready" {
                    return Ok(serde_json::from_str(&text)?);
                }
            }
            Message::Close(_) => break,
            _ => (),
        }
    }

    Err(PlayerError::Backend(
        "the node closed the connection before it was ready".to_string(),
    ))
}

async fn pump_events(mut socket: Socket, players: Players, events: EventSender) {
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => process(&text, &players, &events),
            Ok(Message::Close(frame)) => {
                warn!("Lavalink closed the connection: {frame:?}");
                break;
            }
            Ok(_) => (),
            Err(why) => {
                error!("Lavalink websocket failed: {why}");
                break;
            }
        }
    }

    error!("Lavalink event stream ended, tracks will no longer advance");
}

fn process(text: &str, players: &Players, events: &EventSender) {
    let event: GatewayEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(why) => {
            warn!("Unreadable Lavalink message: {why}");
            return;
        }
    };

    // `stats` and `playerUpdate` carry nothing the player needs.
    if event.op != "event" {
        return;
    }

    match event.event_type.as_deref() {
        Some("TrackEndEvent") => match serde_json::from_str::<TrackEndEvent>(text) {
            Ok(track_end) => on_track_end(track_end, players, events),
            Err(why) => warn!("Malformed TrackEndEvent: {why}"),
        },
        Some("TrackExceptionEvent") => {
            if let Ok(exception) = serde_json::from_str::<TrackExceptionEvent>(text) {
                warn!(
                    "Track failed in guild {}: {}",
                    exception.guild_id,
                    exception
                        .exception
                        .message
                        .unwrap_or(exception.exception.severity)
                );
            }
        }
        Some("TrackStuckEvent") => {
            if let Ok(stuck) = serde_json::from_str::<TrackStuckEvent>(text) {
                warn!(
                    "Track stuck in guild {} for {}ms",
                    stuck.guild_id, stuck.threshold_ms
                );
            }
        }
        Some("WebSocketClosedEvent") => {
            if let Ok(closed) = serde_json::from_str::<WebSocketClosedEvent>(text) {
                warn!(
                    "Voice socket closed in guild {}: {} {} (by remote: {})",
                    closed.guild_id, closed.code, closed.reason, closed.by_remote
                );
            }
        }
        _ => debug!("Ignoring Lavalink event {:?}", event.event_type),
    }
}

fn on_track_end(track_end: TrackEndEvent, players: &Players, events: &EventSender) {
    // The replacing track already took over; nothing ended from our side.
    if track_end.reason == TrackEndReason::Replaced {
        return;
    }

    let guild_id = match track_end.guild_id.parse::<u64>() {
        Ok(id) => GuildId(id),
        Err(_) => return,
    };

    if let Some(serial) = take_finished(players, guild_id, &track_end) {
        debug!("Track #{serial} ended in guild {}: {:?}", guild_id.0, track_end.reason);

        let _ = events.send(TrackEnded { guild_id, serial });
    }
}

/// Moves the playing track aside so its `stopped` event can't be mistaken
/// for the end of whatever starts next.
fn mark_stopping(players: &Players, guild_id: GuildId) -> Option<(u64, String)> {
    let mut slot = players.get_mut(&guild_id)?;

    let stopped = slot.current.take()?;
    slot.stopping = Some(stopped.clone());

    Some(stopped)
}

/// The serial a track end event belongs to. `stopped` events go to the
/// track we stopped, everything else to the one playing.
fn take_finished(players: &Players, guild_id: GuildId, track_end: &TrackEndEvent) -> Option<u64> {
    let mut slot = players.get_mut(&guild_id)?;
    let encoded = track_end.track.encoded.as_str();

    if track_end.reason == TrackEndReason::Stopped && holds(&slot.stopping, encoded) {
        return slot.stopping.take().map(|(serial, _)| serial);
    }

    if holds(&slot.current, encoded) {
        slot.current.take().map(|(serial, _)| serial)
    } else {
        None
    }
}

fn holds(slot: &Option<(u64, String)>, encoded: &str) -> bool {
    slot.as_ref().map_or(false, |(_, held)| held == encoded)
}
