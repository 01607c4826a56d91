use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{error::PlaybackErrorKind, SyncError};

/// Play/pause flag and elapsed position of the external player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub progress_ms: u64,
}

impl PlaybackState {
    pub fn playing(progress_ms: u64) -> Self {
        Self {
            is_playing: true,
            progress_ms,
        }
    }

    pub fn paused(progress_ms: u64) -> Self {
        Self {
            is_playing: false,
            progress_ms,
        }
    }

    pub fn progress_seconds(&self) -> f64 {
        self.progress_ms as f64 / 1000.0
    }
}

/// Notification pushed by the playback provider.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Update(PlaybackState),
    Error {
        kind: PlaybackErrorKind,
        message: String,
    },
}

impl PlaybackEvent {
    /// Converts an error notification into a [`SyncError`].
    pub fn as_error(&self) -> Option<SyncError> {
        match self {
            Self::Update(_) => None,
            Self::Error { kind, message } => Some(SyncError::PlaybackProvider {
                kind: *kind,
                message: message.clone(),
            }),
        }
    }
}

/// Last known playback state. Every update overwrites the previous one; the
/// position is never extrapolated between updates.
#[derive(Debug, Clone, Default)]
pub struct PlaybackMirror {
    latest: Option<PlaybackState>,
    updates: u64,
}

impl PlaybackMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, state: PlaybackState) {
        self.latest = Some(state);
        self.updates += 1;
    }

    pub fn latest(&self) -> Option<&PlaybackState> {
        self.latest.as_ref()
    }

    /// Number of updates received so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

/// Wall-clock driven stand-in for a remote player. Pushes a state update every
/// `update_interval` until the end of the track, then reports a paused state.
#[derive(Debug, Clone)]
pub struct SimulatedPlayer {
    start_ms: u64,
    duration_ms: u64,
    update_interval: Duration,
}

impl SimulatedPlayer {
    pub fn new(duration_ms: u64, update_interval: Duration) -> Self {
        Self {
            start_ms: 0,
            duration_ms,
            update_interval,
        }
    }

    /// Begins playback at the given offset instead of the top of the track.
    pub fn starting_at(mut self, start_ms: u64) -> Self {
        self.start_ms = start_ms.min(self.duration_ms);
        self
    }

    /// State the player reports after `elapsed` wall-clock time.
    pub fn state_at(&self, elapsed: Duration) -> PlaybackState {
        let progress = self.start_ms.saturating_add(elapsed.as_millis() as u64);
        if progress >= self.duration_ms {
            PlaybackState::paused(self.duration_ms)
        } else {
            PlaybackState::playing(progress)
        }
    }

    pub fn spawn<F>(self, mut sink: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnMut(PlaybackEvent) + Send + 'static,
    {
        thread::Builder::new()
            .name("simulated-player".into())
            .spawn(move || {
                let started = Instant::now();
                loop {
                    let state = self.state_at(started.elapsed());
                    sink(PlaybackEvent::Update(state));
                    if !state.is_playing {
                        tracing::debug!(progress_ms = state.progress_ms, "simulated track ended");
                        break;
                    }
                    thread::sleep(self.update_interval);
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn mirror_keeps_last_write() {
        let mut mirror = PlaybackMirror::new();
        assert!(mirror.latest().is_none());

        mirror.publish(PlaybackState::playing(1_000));
        mirror.publish(PlaybackState::paused(1_500));

        assert_eq!(mirror.latest(), Some(&PlaybackState::paused(1_500)));
        assert_eq!(mirror.updates(), 2);
    }

    #[test]
    fn progress_converts_to_seconds() {
        assert_eq!(PlaybackState::playing(9_993).progress_seconds(), 9.993);
    }

    #[test]
    fn deserialises_provider_shape() {
        let state: PlaybackState =
            serde_json::from_str(r#"{ "isPlaying": true, "progressMs": 4200 }"#).unwrap();
        assert_eq!(state, PlaybackState::playing(4_200));
    }

    #[test]
    fn simulated_player_pauses_at_track_end() {
        let player = SimulatedPlayer::new(5_000, Duration::from_millis(10)).starting_at(4_000);
        assert_eq!(
            player.state_at(Duration::from_millis(250)),
            PlaybackState::playing(4_250)
        );
        assert_eq!(
            player.state_at(Duration::from_secs(2)),
            PlaybackState::paused(5_000)
        );
    }

    #[test]
    fn simulated_player_pushes_until_paused() {
        let (tx, rx) = mpsc::channel();
        let player = SimulatedPlayer::new(30, Duration::from_millis(5));
        let handle = player
            .spawn(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        handle.join().unwrap();

        let events: Vec<PlaybackEvent> = rx.try_iter().collect();
        assert!(!events.is_empty());
        assert_eq!(
            events.last(),
            Some(&PlaybackEvent::Update(PlaybackState::paused(30)))
        );
    }

    #[test]
    fn error_events_convert_to_provider_errors() {
        let event = PlaybackEvent::Error {
            kind: PlaybackErrorKind::Authentication,
            message: "token expired".into(),
        };
        let err = event.as_error().unwrap();
        assert!(err.requires_reauth());
        assert!(PlaybackEvent::Update(PlaybackState::default()).as_error().is_none());
    }
}
