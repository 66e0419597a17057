use std::sync::Arc;
use std::time::Duration;

use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::AudioBackend;
use crate::display::PlayerDisplay;
use crate::error::{PlayerError, PlayerResult};
use crate::models::{FinalStatus, PlayOutcome, QueueSnapshot, Track};
use crate::state::GuildPlaybackState;

/// Delayed "leave if still idle" check.
///
/// Fires by sending its generation on `fire`. Scheduling again or cancelling
/// aborts the pending task and bumps the generation, so a fire that raced
/// with either is recognisable as stale.
struct IdleTimer {
    delay: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
    fire: mpsc::UnboundedSender<u64>,
}

impl IdleTimer {
    fn schedule(&mut self) {
        self.cancel();

        let generation = self.generation;
        let delay = self.delay;
        let fire = self.fire.clone();

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fire.send(generation);
        }));
    }

    fn cancel(&mut self) {
        self.generation += 1;

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Per-guild playback state machine.
///
/// Idle (no controller) → Connected-Idle → Playing and back. The controller
/// must be driven from a single task; see [`crate::manager`].
pub struct PlaybackController {
    guild_id: GuildId,
    state: GuildPlaybackState,
    backend: Arc<dyn AudioBackend>,
    display: Arc<dyn PlayerDisplay>,
    next_serial: u64,
    idle: IdleTimer,
    /// Set once the backend rejected our credentials; the session is over.
    defunct: bool,
}

impl PlaybackController {
    pub fn new(
        guild_id: GuildId,
        state: GuildPlaybackState,
        backend: Arc<dyn AudioBackend>,
        display: Arc<dyn PlayerDisplay>,
        idle_timeout: Duration,
        idle_fire: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            guild_id,
            state,
            backend,
            display,
            next_serial: 0,
            idle: IdleTimer {
                delay: idle_timeout,
                generation: 0,
                task: None,
                fire: idle_fire,
            },
            defunct: false,
        }
    }

    pub fn state(&self) -> &GuildPlaybackState {
        &self.state
    }

    pub fn set_voice_channel(&mut self, channel: ChannelId) {
        self.state.set_voice_channel(channel);
    }

    /// Starts the idle countdown for a session nothing has been played in yet.
    pub fn arm_idle(&mut self) {
        self.idle.schedule();
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct
    }

    /// Queues `tracks` in order and starts the first one if nothing is playing.
    pub async fn play(&mut self, tracks: Vec<Track>) -> PlayerResult<PlayOutcome> {
        if tracks.is_empty() {
            return Err(PlayerError::ResolutionFailed);
        }

        self.idle.cancel();

        let added = tracks.len();
        self.state.enqueue_all(tracks);

        let started = if self.state.playing() {
            None
        } else {
            let started = self.advance().await?;

            if started.is_none() {
                self.enter_idle(FinalStatus::Finished).await;
            }

            started
        };

        Ok(PlayOutcome {
            started,
            added,
            queued: self.state.queue_len(),
        })
    }

    pub async fn on_track_finished(&mut self, serial: u64) {
        let finished = match self.state.finish(serial) {
            Some(track) => track,
            None => {
                debug!("Ignoring completion of stale track #{serial}");
                return;
            }
        };

        info!("Track #{serial} ({}) finished", finished.title);

        match self.advance().await {
            Ok(Some(_)) => {}
            Ok(None) => self.enter_idle(FinalStatus::Finished).await,
            Err(why) => self.announce(&why.to_string()).await,
        }
    }

    /// Stops the current track; the completion signal that follows advances
    /// the queue.
    pub async fn skip(&mut self) -> PlayerResult<Track> {
        let track = match self.state.current() {
            Some(active) => active.track.clone(),
            None => return Err(PlayerError::NothingPlaying),
        };

        self.backend.stop_current(self.guild_id).await?;

        Ok(track)
    }

    /// Clears the queue and stops the current track.
    ///
    /// Allowed while playing or while anything is still queued.
    pub async fn stop(&mut self) -> PlayerResult<()> {
        if !self.state.playing() && self.state.is_queue_empty() {
            return Err(PlayerError::NothingPlaying);
        }

        let dropped = self.state.clear();

        if let Some(active) = self.state.take_current() {
            info!("Stopping track #{} and dropping {dropped} queued", active.serial);

            if let Err(why) = self.backend.stop_current(self.guild_id).await {
                warn!("Stopping track #{} failed: {why}", active.serial);
            }
        }

        self.enter_idle(FinalStatus::Stopped).await;

        Ok(())
    }

    /// Flips pause on the current track and returns the new paused state.
    pub async fn toggle_pause(&mut self) -> PlayerResult<bool> {
        if !self.state.playing() {
            return Err(PlayerError::NothingPlaying);
        }

        let paused = !self.state.paused();
        self.backend.set_paused(self.guild_id, paused).await?;
        self.state.set_paused(paused);

        Ok(paused)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.snapshot()
    }

    pub async fn show_queue(&self, channel: ChannelId) -> PlayerResult<()> {
        self.display.show_queue(channel, &self.state.snapshot()).await
    }

    /// Runs when the idle timer fires. Everything is re-checked because the
    /// session may have moved on since the timer was armed. `true` means the
    /// session should [`leave_idle`](Self::leave_idle).
    pub fn idle_expired(&mut self, generation: u64) -> bool {
        if !self.idle.is_current(generation) {
            debug!("Ignoring stale idle timer #{generation}");
            return false;
        }

        self.idle.task = None;

        if self.state.playing() || !self.state.is_queue_empty() {
            return false;
        }

        if !self.backend.is_connected(self.guild_id) {
            debug!("Idle timer fired without a voice connection");
            return false;
        }

        true
    }

    pub async fn leave_idle(&mut self) {
        info!("Leaving voice after {:?} of inactivity", self.idle.delay);

        self.finalize_now_playing(FinalStatus::Finished).await;

        if let Err(why) = self.backend.disconnect(self.guild_id).await {
            warn!("Disconnect after inactivity failed: {why}");
        }

        self.announce("Queue has ended. Leaving voice channel.").await;
    }

    pub async fn disconnect(&mut self) -> PlayerResult<()> {
        self.release().await;

        self.backend.disconnect(self.guild_id).await
    }

    /// The voice connection is already gone; only local cleanup is left.
    pub async fn forget(&mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        self.idle.cancel();
        self.state.clear();

        let in_flight = self.state.take_current().is_some();

        if in_flight || self.backend.is_playing(self.guild_id) {
            if let Err(why) = self.backend.stop_current(self.guild_id).await {
                debug!("Stopping current track on release failed: {why}");
            }
        }

        self.finalize_now_playing(FinalStatus::Disconnected).await;
    }

    /// Starts the next playable track from the queue. A track that fails to
    /// start is announced and skipped. Rejected credentials drop the whole
    /// queue and mark the session defunct.
    async fn advance(&mut self) -> PlayerResult<Option<Track>> {
        while let Some(track) = self.state.dequeue_next() {
            self.next_serial += 1;
            let serial = self.next_serial;

            match self.backend.start(self.guild_id, serial, &track).await {
                Ok(()) => {
                    info!("Started track #{serial}: {} - {}", track.title, track.uri);

                    self.state.begin(serial, track.clone());
                    self.replace_now_playing(&track).await;

                    return Ok(Some(track));
                }
                Err(PlayerError::BackendAuthFailed) => {
                    error!("Audio backend rejected our credentials, abandoning the session");

                    self.release().await;
                    self.defunct = true;

                    return Err(PlayerError::BackendAuthFailed);
                }
                Err(why) => {
                    warn!("Could not start {}: {why}", track.title);
                    self.announce(&format!("Could not play **{}**: {why}", track.title))
                        .await;
                }
            }
        }

        Ok(None)
    }

    async fn enter_idle(&mut self, status: FinalStatus) {
        self.finalize_now_playing(status).await;
        self.idle.schedule();
    }

    async fn replace_now_playing(&mut self, track: &Track) {
        let channel = self.state.text_channel();

        if let Some(previous) = self.state.clear_now_playing() {
            tolerate_stale(
                self.display.remove_now_playing(channel, previous).await,
                "remove now playing",
            );
        }

        match self.display.show_now_playing(channel, track).await {
            Ok(message) => {
                self.state.set_now_playing(message);
            }
            Err(why) => warn!("Could not send now playing message: {why}"),
        }
    }

    async fn finalize_now_playing(&mut self, status: FinalStatus) {
        if let Some(message) = self.state.clear_now_playing() {
            tolerate_stale(
                self.display
                    .finalize_now_playing(self.state.text_channel(), message, status)
                    .await,
                "finalize now playing",
            );
        }
    }

    async fn announce(&self, text: &str) {
        if let Err(why) = self.display.announce(self.state.text_channel(), text).await {
            warn!("Error sending message: {why}");
        }
    }
}

fn tolerate_stale(result: PlayerResult<()>, action: &str) {
    match result {
        Ok(()) => {}
        Err(PlayerError::DisplayStale) => debug!("{action}: message already removed"),
        Err(why) => warn!("{action} failed: {why}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{track, BackendCall, DisplayCall, FakeBackend, FakeDisplay};

    const IDLE: Duration = Duration::from_secs(60);

    struct Harness {
        controller: PlaybackController,
        backend: Arc<FakeBackend>,
        display: Arc<FakeDisplay>,
        idle_fires: mpsc::UnboundedReceiver<u64>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::connected());
        let display = Arc::new(FakeDisplay::default());
        let (fire, idle_fires) = mpsc::unbounded_channel();

        let controller = PlaybackController::new(
            GuildId(1),
            GuildPlaybackState::new(ChannelId(10), ChannelId(20)),
            backend.clone(),
            display.clone(),
            IDLE,
            fire,
        );

        Harness {
            controller,
            backend,
            display,
            idle_fires,
        }
    }

    fn current_serial(controller: &PlaybackController) -> u64 {
        controller.state().current().expect("a track in flight").serial
    }

    fn queued_titles(controller: &PlaybackController) -> Vec<String> {
        controller
            .snapshot()
            .queued
            .into_iter()
            .map(|track| track.title)
            .collect()
    }

    #[tokio::test]
    async fn playlist_starts_one_track_and_queues_the_rest() {
        let mut h = harness();

        let outcome = h
            .controller
            .play(vec![track("a"), track("b"), track("c"), track("d")])
            .await
            .unwrap();

        assert_eq!(outcome.started.map(|track| track.title), Some("a".to_string()));
        assert_eq!(outcome.added, 4);
        assert_eq!(outcome.queued, 3);
        assert_eq!(h.backend.started(), ["a"]);
        assert!(h.controller.state().playing());
    }

    #[tokio::test]
    async fn play_while_playing_only_enqueues() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();

        let outcome = h.controller.play(vec![track("b")]).await.unwrap();

        assert_eq!(outcome.started, None);
        assert_eq!(outcome.queued, 1);
        assert_eq!(h.backend.started(), ["a"]);
    }

    #[tokio::test]
    async fn starting_from_a_waiting_queue_consumes_exactly_one_entry() {
        let mut h = harness();
        h.backend.fail_start("a");

        // "a" fails to start, leaving nothing in flight.
        h.controller.play(vec![track("a")]).await.unwrap();
        assert!(!h.controller.state().playing());

        h.backend.allow_start("a");
        h.controller.play(vec![track("b"), track("c")]).await.unwrap();

        assert!(h.controller.state().playing());
        assert_eq!(h.controller.state().current().unwrap().track.title, "b");
        assert_eq!(queued_titles(&h.controller), ["c"]);
    }

    #[tokio::test]
    async fn empty_resolution_changes_nothing() {
        let mut h = harness();

        let result = h.controller.play(Vec::new()).await;

        assert!(matches!(result, Err(PlayerError::ResolutionFailed)));
        assert!(!h.controller.state().playing());
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn a_b_c_walkthrough() {
        let mut h = harness();

        h.controller
            .play(vec![track("A"), track("B"), track("C")])
            .await
            .unwrap();
        assert_eq!(h.controller.state().current().unwrap().track.title, "A");
        assert_eq!(queued_titles(&h.controller), ["B", "C"]);

        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;
        assert_eq!(h.controller.state().current().unwrap().track.title, "B");
        assert_eq!(queued_titles(&h.controller), ["C"]);

        h.controller.stop().await.unwrap();
        assert!(queued_titles(&h.controller).is_empty());
        assert!(!h.controller.state().playing());
        assert_eq!(h.backend.started(), ["A", "B"]);
    }

    #[tokio::test]
    async fn now_playing_is_deleted_then_recreated() {
        let mut h = harness();
        h.controller.play(vec![track("a"), track("b")]).await.unwrap();
        let first = h.controller.state().now_playing().unwrap();

        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;

        let second = h.controller.state().now_playing().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            h.display.calls(),
            [
                DisplayCall::Show("a".into(), first),
                DisplayCall::Remove(first),
                DisplayCall::Show("b".into(), second),
            ]
        );
    }

    #[tokio::test]
    async fn stale_display_is_tolerated() {
        let mut h = harness();
        h.controller.play(vec![track("a"), track("b")]).await.unwrap();
        h.display.set_stale(true);

        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;
        assert_eq!(h.controller.state().current().unwrap().track.title, "b");

        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;
        assert!(!h.controller.state().playing());
        assert!(h.controller.state().now_playing().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn last_completion_enters_connected_idle_and_arms_one_timer() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();
        let message = h.controller.state().now_playing().unwrap();

        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;

        assert!(!h.controller.state().playing());
        assert!(h.backend.is_connected(GuildId(1)));
        assert!(h
            .display
            .calls()
            .contains(&DisplayCall::Finalize(message, FinalStatus::Finished)));

        let generation = h.idle_fires.recv().await.unwrap();
        tokio::time::sleep(IDLE * 2).await;
        assert!(h.idle_fires.try_recv().is_err());

        assert!(h.controller.idle_expired(generation));
        h.controller.leave_idle().await;
        assert!(h.backend.calls().contains(&BackendCall::Disconnect));
        assert_eq!(
            h.display.announcements(),
            ["Queue has ended. Leaving voice channel."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn play_before_the_timer_fires_keeps_the_session() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();
        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;

        h.controller.play(vec![track("b")]).await.unwrap();

        // The armed timer was aborted; a fire with its generation is a no-op.
        tokio::time::sleep(IDLE * 2).await;
        assert!(h.idle_fires.try_recv().is_err());
        for generation in 0..4 {
            assert!(!h.controller.idle_expired(generation));
        }

        assert!(h.controller.state().playing());
        assert!(!h.backend.calls().contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_fire_rechecks_state() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();
        let serial = current_serial(&h.controller);
        h.controller.on_track_finished(serial).await;
        let generation = h.idle_fires.recv().await.unwrap();

        // Disconnected by someone else while the timer was pending.
        h.backend.set_connected(false);

        assert!(!h.controller.idle_expired(generation));
        assert!(!h.backend.calls().contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn armed_idle_expires_without_any_playback() {
        let mut h = harness();

        h.controller.arm_idle();
        let generation = h.idle_fires.recv().await.unwrap();

        assert!(h.controller.idle_expired(generation));
    }

    #[tokio::test]
    async fn rejected_credentials_abandon_the_session() {
        let mut h = harness();
        h.backend.reject_credentials();

        let result = h.controller.play(vec![track("a"), track("b")]).await;

        assert!(matches!(result, Err(PlayerError::BackendAuthFailed)));
        assert!(h.controller.is_defunct());
        assert!(h.controller.state().is_queue_empty());
        assert!(!h.controller.state().playing());
    }

    #[tokio::test]
    async fn rejected_credentials_mid_queue_drop_the_rest() {
        let mut h = harness();
        h.controller
            .play(vec![track("a"), track("b"), track("c")])
            .await
            .unwrap();
        let message = h.controller.state().now_playing().unwrap();
        let serial = current_serial(&h.controller);

        h.backend.reject_credentials();
        h.controller.on_track_finished(serial).await;

        assert!(h.controller.is_defunct());
        assert!(h.controller.state().is_queue_empty());
        assert_eq!(h.backend.started(), ["a"]);
        assert_eq!(
            h.display.announcements(),
            [PlayerError::BackendAuthFailed.to_string()]
        );
        assert!(h
            .display
            .calls()
            .contains(&DisplayCall::Finalize(message, FinalStatus::Disconnected)));
    }

    #[tokio::test]
    async fn late_completion_after_stop_does_not_resurrect_playback() {
        let mut h = harness();
        h.controller.play(vec![track("a"), track("b")]).await.unwrap();
        let serial = current_serial(&h.controller);

        h.controller.stop().await.unwrap();
        h.controller.on_track_finished(serial).await;

        assert!(!h.controller.state().playing());
        assert_eq!(h.backend.started(), ["a"]);
    }

    #[tokio::test]
    async fn skip_on_last_track_ends_connected_idle() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();
        let serial = current_serial(&h.controller);

        let skipped = h.controller.skip().await.unwrap();
        assert_eq!(skipped.title, "a");
        assert!(h.backend.calls().contains(&BackendCall::StopCurrent));

        h.controller.on_track_finished(serial).await;

        assert!(!h.controller.state().playing());
        assert!(h.backend.is_connected(GuildId(1)));
        assert!(!h.backend.calls().contains(&BackendCall::Disconnect));
    }

    #[tokio::test]
    async fn skip_and_stop_without_anything_playing_report_it() {
        let mut h = harness();

        assert!(matches!(h.controller.skip().await, Err(PlayerError::NothingPlaying)));
        assert!(matches!(h.controller.stop().await, Err(PlayerError::NothingPlaying)));
        assert!(matches!(
            h.controller.toggle_pause().await,
            Err(PlayerError::NothingPlaying)
        ));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_finalizes_the_display_as_stopped() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();
        let message = h.controller.state().now_playing().unwrap();

        h.controller.stop().await.unwrap();

        assert!(h
            .display
            .calls()
            .contains(&DisplayCall::Finalize(message, FinalStatus::Stopped)));
    }

    #[tokio::test]
    async fn failed_start_falls_through_to_the_next_track() {
        let mut h = harness();
        h.backend.fail_start("broken");

        let outcome = h
            .controller
            .play(vec![track("broken"), track("fine")])
            .await
            .unwrap();

        assert_eq!(outcome.started.map(|track| track.title), Some("fine".to_string()));
        assert_eq!(h.display.announcements().len(), 1);
        assert!(h.display.announcements()[0].contains("broken"));
    }

    #[tokio::test]
    async fn toggle_pause_round_trips() {
        let mut h = harness();
        h.controller.play(vec![track("a")]).await.unwrap();

        assert!(h.controller.toggle_pause().await.unwrap());
        assert!(h.controller.snapshot().paused);
        assert!(!h.controller.toggle_pause().await.unwrap());
        assert_eq!(
            h.backend.calls()[1..],
            [BackendCall::SetPaused(true), BackendCall::SetPaused(false)]
        );
    }

    #[tokio::test]
    async fn disconnect_clears_everything() {
        let mut h = harness();
        h.controller.play(vec![track("a"), track("b")]).await.unwrap();
        let message = h.controller.state().now_playing().unwrap();

        h.controller.disconnect().await.unwrap();

        assert!(!h.controller.state().playing());
        assert!(h.controller.state().is_queue_empty());
        assert!(h.backend.calls().ends_with(&[BackendCall::StopCurrent, BackendCall::Disconnect]));
        assert!(h
            .display
            .calls()
            .contains(&DisplayCall::Finalize(message, FinalStatus::Disconnected)));
    }
}
