//! In-memory stand-ins for the audio backend and the chat display.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

use crate::backend::{AudioBackend, EventSender, TrackEnded};
use crate::display::PlayerDisplay;
use crate::error::{PlayerError, PlayerResult};
use crate::models::{FinalStatus, QueueSnapshot, Resolution, Track};

pub fn track(title: &str) -> Track {
    Track {
        title: title.to_string(),
        uri: format!("https://example.com/{title}"),
        source: format!("source:{title}"),
        requester: UserId(42),
        duration: Some(Duration::from_secs(180)),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Connect(ChannelId),
    Disconnect,
    Start(u64, String),
    StopCurrent,
    SetPaused(bool),
}

/// Records every call. Stopping the current track emits a completion signal
/// when an event sender is attached, the way the real backends do.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    connected: AtomicBool,
    playing: Mutex<Option<(GuildId, u64)>>,
    failing: Mutex<HashSet<String>>,
    credentials_rejected: AtomicBool,
    events: Mutex<Option<EventSender>>,
}

impl FakeBackend {
    pub fn connected() -> Self {
        let backend = Self::default();
        backend.set_connected(true);
        backend
    }

    pub fn with_events(events: EventSender) -> Self {
        let backend = Self::default();
        *backend.events.lock().unwrap() = Some(events);
        backend
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_start(&self, title: &str) {
        self.failing.lock().unwrap().insert(title.to_string());
    }

    pub fn allow_start(&self, title: &str) {
        self.failing.lock().unwrap().remove(title);
    }

    /// Every later start fails the way a node with a changed password does.
    pub fn reject_credentials(&self) {
        self.credentials_rejected.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Start(_, title) => Some(title),
                _ => None,
            })
            .collect()
    }

    /// Simulates the current track reaching its end.
    pub fn finish_current(&self) {
        let finished = self.playing.lock().unwrap().take();

        if let (Some((guild_id, serial)), Some(events)) = (finished, &*self.events.lock().unwrap()) {
            let _ = events.send(TrackEnded { guild_id, serial });
        }
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn resolve(&self, query: &str, requester: UserId) -> PlayerResult<Resolution> {
        if query == "nothing" {
            return Err(PlayerError::ResolutionFailed);
        }

        let mut found = track(query);
        found.requester = requester;

        Ok(Resolution {
            tracks: vec![found],
            playlist: None,
        })
    }

    async fn connect(&self, _guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<()> {
        self.record(BackendCall::Connect(channel_id));
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&self, _guild_id: GuildId) -> PlayerResult<()> {
        self.record(BackendCall::Disconnect);
        self.set_connected(false);
        Ok(())
    }

    fn is_connected(&self, _guild_id: GuildId) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self, guild_id: GuildId, serial: u64, track: &Track) -> PlayerResult<()> {
        if self.credentials_rejected.load(Ordering::SeqCst) {
            return Err(PlayerError::BackendAuthFailed);
        }

        if self.failing.lock().unwrap().contains(&track.title) {
            return Err(PlayerError::Backend(format!("cannot load {}", track.title)));
        }

        self.record(BackendCall::Start(serial, track.title.clone()));
        *self.playing.lock().unwrap() = Some((guild_id, serial));
        Ok(())
    }

    async fn stop_current(&self, _guild_id: GuildId) -> PlayerResult<()> {
        self.record(BackendCall::StopCurrent);
        self.finish_current();
        Ok(())
    }

    async fn set_paused(&self, _guild_id: GuildId, paused: bool) -> PlayerResult<()> {
        self.record(BackendCall::SetPaused(paused));
        Ok(())
    }

    fn is_playing(&self, _guild_id: GuildId) -> bool {
        self.playing.lock().unwrap().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayCall {
    Show(String, MessageId),
    Remove(MessageId),
    Finalize(MessageId, FinalStatus),
    Queue(ChannelId, usize),
    Announce(String),
}

#[derive(Default)]
pub struct FakeDisplay {
    calls: Mutex<Vec<DisplayCall>>,
    next_id: AtomicU64,
    stale: AtomicBool,
}

impl FakeDisplay {
    /// Makes every edit/delete behave as if the message had been removed.
    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DisplayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn announcements(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DisplayCall::Announce(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: DisplayCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn edit_result(&self) -> PlayerResult<()> {
        if self.stale.load(Ordering::SeqCst) {
            Err(PlayerError::DisplayStale)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PlayerDisplay for FakeDisplay {
    async fn show_now_playing(&self, _channel: ChannelId, track: &Track) -> PlayerResult<MessageId> {
        let message = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(DisplayCall::Show(track.title.clone(), message));
        Ok(message)
    }

    async fn remove_now_playing(&self, _channel: ChannelId, message: MessageId) -> PlayerResult<()> {
        self.record(DisplayCall::Remove(message));
        self.edit_result()
    }

    async fn finalize_now_playing(
        &self,
        _channel: ChannelId,
        message: MessageId,
        status: FinalStatus,
    ) -> PlayerResult<()> {
        self.record(DisplayCall::Finalize(message, status));
        self.edit_result()
    }

    async fn show_queue(&self, channel: ChannelId, snapshot: &QueueSnapshot) -> PlayerResult<()> {
        self.record(DisplayCall::Queue(channel, snapshot.queued.len()));
        Ok(())
    }

    async fn announce(&self, _channel: ChannelId, text: &str) -> PlayerResult<()> {
        self.record(DisplayCall::Announce(text.to_string()));
        Ok(())
    }
}
