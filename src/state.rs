use std::collections::VecDeque;

use serenity::model::id::{ChannelId, MessageId};

use crate::models::{QueueSnapshot, Track};

/// The track currently handed to the audio backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveTrack {
    pub serial: u64,
    pub track: Track,
}

/// Everything the bot remembers about one guild's voice session.
///
/// The in-flight track is never part of `queue`: it is moved out with
/// [`dequeue_next`](Self::dequeue_next) before [`begin`](Self::begin) is called.
#[derive(Debug)]
pub struct GuildPlaybackState {
    queue: VecDeque<Track>,
    current: Option<ActiveTrack>,
    paused: bool,
    now_playing: Option<MessageId>,
    text_channel: ChannelId,
    voice_channel: ChannelId,
}

impl GuildPlaybackState {
    pub fn new(text_channel: ChannelId, voice_channel: ChannelId) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            paused: false,
            now_playing: None,
            text_channel,
            voice_channel,
        }
    }

    pub fn enqueue(&mut self, track: Track) {
        self.queue.push_back(track);
    }

    pub fn enqueue_all(&mut self, tracks: impl IntoIterator<Item = Track>) {
        self.queue.extend(tracks);
    }

    /// Empties the queue and returns how many tracks were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn dequeue_next(&mut self) -> Option<Track> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn begin(&mut self, serial: u64, track: Track) {
        debug_assert!(self.current.is_none(), "a track is already in flight");

        self.current = Some(ActiveTrack { serial, track });
        self.paused = false;
    }

    /// Retires the in-flight track if `serial` identifies it.
    pub fn finish(&mut self, serial: u64) -> Option<Track> {
        match &self.current {
            Some(active) if active.serial == serial => {
                self.paused = false;
                self.current.take().map(|active| active.track)
            }
            _ => None,
        }
    }

    pub fn take_current(&mut self) -> Option<ActiveTrack> {
        self.paused = false;
        self.current.take()
    }

    pub fn current(&self) -> Option<&ActiveTrack> {
        self.current.as_ref()
    }

    pub fn playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused && self.playing();
    }

    pub fn now_playing(&self) -> Option<MessageId> {
        self.now_playing
    }

    /// Stores a new now-playing message, handing back the one it replaces.
    pub fn set_now_playing(&mut self, message: MessageId) -> Option<MessageId> {
        self.now_playing.replace(message)
    }

    pub fn clear_now_playing(&mut self) -> Option<MessageId> {
        self.now_playing.take()
    }

    pub fn text_channel(&self) -> ChannelId {
        self.text_channel
    }

    pub fn voice_channel(&self) -> ChannelId {
        self.voice_channel
    }

    pub fn set_voice_channel(&mut self, channel: ChannelId) {
        self.voice_channel = channel;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.as_ref().map(|active| active.track.clone()),
            paused: self.paused,
            queued: self.queue.iter().cloned().collect(),
        }
    }
}
