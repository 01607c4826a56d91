use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crate::{
    AnalysisProvider, BeatAnalysis, BeatTrigger, EffectsBinder, EffectsConfig, PlaybackEvent,
    PlaybackMirror, Result, SampleVoice, SyncConfig, SyncError, TickOutcome, TrackId, Transport,
};

/// User-visible error state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub error: Option<String>,
    /// Set when the playback provider rejected the credentials; the stored
    /// token has to be discarded and the user must sign in again.
    pub needs_reauth: bool,
}

/// Proof that a fetch was started for a particular selection. Selecting the
/// same track again issues a new ticket and retires the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    track: TrackId,
    generation: u64,
}

impl FetchTicket {
    pub fn track(&self) -> &TrackId {
        &self.track
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The analysis became current and the engine was reconfigured.
    Applied(EffectsConfig),
    /// The analysis was already bound.
    Unchanged,
    /// The response belongs to a selection that has since been replaced.
    Discarded,
    /// The fetch failed; the error is recorded in the session status.
    Failed,
}

/// Point-in-time view of the session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub track: Option<TrackId>,
    pub bpm: Option<u32>,
    pub key: Option<&'static str>,
    pub beat_count: usize,
    pub duration_seconds: Option<f64>,
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    /// Playback updates received from the provider so far.
    pub playback_updates: u64,
    pub do_not_play_until: f64,
    pub triggers: u64,
    pub transport_bpm: f64,
    pub status: SessionStatus,
}

struct SessionState {
    selected: Option<TrackId>,
    generation: u64,
    analysis: Option<Arc<BeatAnalysis>>,
    playback: PlaybackMirror,
    trigger: BeatTrigger,
    binder: EffectsBinder,
    voice: Box<dyn SampleVoice>,
    transport: Transport,
    status: SessionStatus,
}

/// Owns all state shared between the trigger poller, the playback provider's
/// callbacks and analysis fetch completions. Every mutation goes through a
/// single mutex.
#[derive(Clone)]
pub struct SyncSession {
    config: SyncConfig,
    state: Arc<Mutex<SessionState>>,
}

impl SyncSession {
    pub fn new(config: SyncConfig, voice: Box<dyn SampleVoice>) -> Self {
        let state = SessionState {
            selected: None,
            generation: 0,
            analysis: None,
            playback: PlaybackMirror::new(),
            trigger: BeatTrigger::new(&config),
            binder: EffectsBinder::new(config.clone()),
            voice,
            transport: Transport::default(),
            status: SessionStatus::default(),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes `track` the current selection. Any fetch still running for an
    /// earlier selection will be discarded on completion.
    pub fn select_track(&self, track: TrackId) -> Result<FetchTicket> {
        let mut state = self.lock()?;
        state.selected = Some(track.clone());
        state.generation += 1;
        state.status.error = None;
        tracing::info!(%track, generation = state.generation, "track selected");
        Ok(FetchTicket {
            track,
            generation: state.generation,
        })
    }

    /// Applies the result of an analysis fetch started with `ticket`.
    ///
    /// The pitch shift is rendered with the lock released so the poller keeps
    /// ticking; the result is dropped if the selection changed meanwhile.
    pub fn complete_fetch(
        &self,
        ticket: &FetchTicket,
        result: Result<BeatAnalysis>,
    ) -> Result<FetchOutcome> {
        let (analysis, effects, job) = {
            let mut state = self.lock()?;
            if !state.is_current(ticket) {
                tracing::debug!(track = %ticket.track, "discarding stale analysis response");
                return Ok(FetchOutcome::Discarded);
            }

            let analysis = match result {
                Ok(analysis) => Arc::new(analysis),
                Err(err) => {
                    if matches!(err, SyncError::MalformedAnalysis(_)) {
                        state.analysis = None;
                    }
                    tracing::error!(track = %ticket.track, %err, "analysis unavailable");
                    state.status.error = Some(err.to_string());
                    return Ok(FetchOutcome::Failed);
                }
            };
            let Some((effects, job)) = state.binder.prepare(&analysis, &*state.voice) else {
                return Ok(FetchOutcome::Unchanged);
            };
            (analysis, effects, job)
        };

        let rendered = job();

        let mut state = self.lock()?;
        if !state.is_current(ticket) {
            tracing::debug!(track = %ticket.track, "selection changed while rendering");
            return Ok(FetchOutcome::Discarded);
        }
        let SessionState {
            analysis: current,
            binder,
            voice,
            transport,
            trigger,
            status,
            ..
        } = &mut *state;
        let bound = rendered.and_then(|rendered| {
            binder.bind(&analysis, effects, rendered, voice.as_mut(), transport, trigger)
        });
        match bound {
            Ok(Some(effects)) => {
                *current = Some(Arc::clone(&analysis));
                tracing::info!(
                    track = %ticket.track,
                    beats = analysis.beats().len(),
                    key = analysis.track().key.name(),
                    "analysis applied"
                );
                Ok(FetchOutcome::Applied(effects))
            }
            Ok(None) => Ok(FetchOutcome::Unchanged),
            Err(err) => {
                tracing::error!(track = %ticket.track, %err, "failed to bind effects");
                status.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Selects `track` and fetches its analysis on a worker thread.
    pub fn fetch_with<P>(
        &self,
        provider: Arc<P>,
        track: TrackId,
    ) -> Result<JoinHandle<Result<FetchOutcome>>>
    where
        P: AnalysisProvider + ?Sized + 'static,
    {
        let ticket = self.select_track(track)?;
        let session = self.clone();
        let handle = thread::Builder::new()
            .name("analysis-fetch".into())
            .spawn(move || {
                let result = provider.fetch(ticket.track());
                session.complete_fetch(&ticket, result)
            })?;
        Ok(handle)
    }

    /// Handles a push notification from the playback provider.
    pub fn on_playback_event(&self, event: PlaybackEvent) -> Result<()> {
        let mut state = self.lock()?;
        match &event {
            PlaybackEvent::Update(playback) => state.playback.publish(*playback),
            PlaybackEvent::Error { .. } => {
                if let Some(err) = event.as_error() {
                    tracing::warn!(%err, "playback provider reported an error");
                    state.status.needs_reauth |= err.requires_reauth();
                    state.status.error = Some(err.to_string());
                }
            }
        }
        Ok(())
    }

    /// Runs one poll of the trigger engine against the current state.
    pub fn tick(&self) -> Result<TickOutcome> {
        let mut state = self.lock()?;
        let SessionState {
            analysis,
            playback,
            trigger,
            voice,
            ..
        } = &mut *state;
        Ok(trigger.tick(playback.latest(), analysis.as_deref(), voice.as_mut()))
    }

    /// Restarts the trigger engine with an empty cooldown.
    pub fn reset_engine(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.trigger.reset();
        Ok(())
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        let state = self.lock()?;
        let analysis = state.analysis.as_deref();
        let playback = state.playback.latest();
        Ok(SessionSnapshot {
            track: state.selected.clone(),
            bpm: analysis.and_then(|analysis| analysis.track().display_bpm()),
            key: analysis.map(|analysis| analysis.track().key.name()),
            beat_count: analysis.map_or(0, |analysis| analysis.beats().len()),
            duration_seconds: analysis.and_then(BeatAnalysis::duration_seconds),
            is_playing: playback.is_some_and(|playback| playback.is_playing),
            progress_ms: playback.map(|playback| playback.progress_ms),
            playback_updates: state.playback.updates(),
            do_not_play_until: state.trigger.do_not_play_until(),
            triggers: state.trigger.fired(),
            transport_bpm: state.transport.bpm(),
            status: state.status.clone(),
        })
    }

    /// Starts the background poller that ticks at the configured interval.
    pub fn spawn_poller(&self) -> Result<Poller> {
        let stop = Arc::new(AtomicBool::new(false));
        let session = self.clone();
        let interval = self.config.poll_interval();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("beat-trigger".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    if let Err(err) = session.tick() {
                        tracing::error!(%err, "trigger poller stopped");
                        break;
                    }
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
            })?;
        Ok(Poller {
            stop,
            handle: Some(handle),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Poisoned("sync session state"))
    }
}

impl SessionState {
    fn is_current(&self, ticket: &FetchTicket) -> bool {
        self.generation == ticket.generation && self.selected.as_ref() == Some(&ticket.track)
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to the background trigger poller.
#[derive(Debug)]
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Signals the poller to finish and waits for its thread.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| SyncError::msg("trigger poller panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{atomic::AtomicUsize, mpsc},
        time::Duration,
    };

    use super::*;
    use crate::{
        error::PlaybackErrorKind, Beat, Key, PitchShift, PlaybackState, RenderJob,
        RenderedEffect, TrackSummary,
    };

    #[derive(Clone, Default)]
    struct SharedVoice {
        starts: Arc<AtomicUsize>,
        connected: Arc<Mutex<Vec<PitchShift>>>,
        broken: Arc<AtomicBool>,
    }

    impl SampleVoice for SharedVoice {
        fn start(&mut self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn connect(&mut self, effect: PitchShift) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SyncError::msg("output device lost"));
            }
            self.connected.lock().unwrap().push(effect);
            Ok(())
        }
    }

    /// Voice whose render takes a while and announces when it begins.
    struct SlowVoice {
        rendering: mpsc::Sender<()>,
        delay: Duration,
    }

    impl SampleVoice for SlowVoice {
        fn start(&mut self) {}

        fn connect(&mut self, _effect: PitchShift) -> Result<()> {
            Ok(())
        }

        fn prepare(&self, effect: PitchShift) -> RenderJob {
            let rendering = self.rendering.clone();
            let delay = self.delay;
            Box::new(move || {
                let _ = rendering.send(());
                thread::sleep(delay);
                Ok(RenderedEffect::bare(effect))
            })
        }
    }

    fn slow_session(delay: Duration) -> (SyncSession, mpsc::Receiver<()>) {
        let (rendering, rx) = mpsc::channel();
        let voice = SlowVoice { rendering, delay };
        (SyncSession::new(SyncConfig::default(), Box::new(voice)), rx)
    }

    fn session_with(config: SyncConfig) -> (SyncSession, SharedVoice) {
        let voice = SharedVoice::default();
        (SyncSession::new(config, Box::new(voice.clone())), voice)
    }

    fn analysis(key: i32, starts: &[f64], end_of_fade_in: Option<f64>) -> BeatAnalysis {
        BeatAnalysis::new(
            starts.iter().copied().map(Beat::at).collect(),
            TrackSummary {
                tempo: Some(120.0),
                key: Key::new(key),
                end_of_fade_in,
                duration: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn stale_response_is_discarded() {
        let (session, voice) = session_with(SyncConfig::default());
        let ticket_a = session.select_track(TrackId::new("a")).unwrap();
        let ticket_b = session.select_track(TrackId::new("b")).unwrap();

        let outcome_b = session
            .complete_fetch(&ticket_b, Ok(analysis(9, &[1.0], None)))
            .unwrap();
        assert!(matches!(outcome_b, FetchOutcome::Applied(_)));

        let outcome_a = session
            .complete_fetch(&ticket_a, Ok(analysis(2, &[1.0, 2.0], None)))
            .unwrap();
        assert_eq!(outcome_a, FetchOutcome::Discarded);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.track, Some(TrackId::new("b")));
        assert_eq!(snapshot.key, Some("A"));
        assert_eq!(snapshot.beat_count, 1);
        assert_eq!(*voice.connected.lock().unwrap(), vec![PitchShift::new(2.0)]);
    }

    #[test]
    fn late_response_before_newer_one_is_still_discarded() {
        let (session, _voice) = session_with(SyncConfig::default());
        let ticket_a = session.select_track(TrackId::new("a")).unwrap();
        let _ticket_b = session.select_track(TrackId::new("b")).unwrap();

        let outcome = session
            .complete_fetch(&ticket_a, Ok(analysis(2, &[1.0], None)))
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Discarded);
        assert_eq!(session.snapshot().unwrap().beat_count, 0);
    }

    #[test]
    fn fetch_failure_keeps_previous_analysis() {
        let (session, _voice) = session_with(SyncConfig::default());
        let first = session.select_track(TrackId::new("a")).unwrap();
        session
            .complete_fetch(&first, Ok(analysis(7, &[1.0, 2.0], None)))
            .unwrap();

        let second = session.select_track(TrackId::new("b")).unwrap();
        let outcome = session
            .complete_fetch(
                &second,
                Err(SyncError::AnalysisFetch {
                    track: "b".into(),
                    reason: "401 unauthorized".into(),
                }),
            )
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Failed);
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.beat_count, 2);
        assert!(snapshot.status.error.unwrap().contains("401"));
    }

    #[test]
    fn malformed_analysis_leaves_engine_idle() {
        let (session, voice) = session_with(SyncConfig::default());
        let first = session.select_track(TrackId::new("a")).unwrap();
        session
            .complete_fetch(&first, Ok(analysis(7, &[1.0], None)))
            .unwrap();

        let second = session.select_track(TrackId::new("b")).unwrap();
        session
            .complete_fetch(&second, BeatAnalysis::from_json(r#"{ "beats": [] }"#))
            .unwrap();
        session
            .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(1_000)))
            .unwrap();

        assert_eq!(session.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(voice.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fade_in_is_respected_end_to_end() {
        let (session, voice) = session_with(SyncConfig::default());
        let ticket = session.select_track(TrackId::new("intro")).unwrap();
        session
            .complete_fetch(&ticket, Ok(analysis(7, &[4.5, 5.2], Some(3.0))))
            .unwrap();
        assert_eq!(session.snapshot().unwrap().do_not_play_until, 5.0);

        session
            .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(4_500)))
            .unwrap();
        assert_eq!(session.tick().unwrap(), TickOutcome::CoolingDown { until: 5.0 });

        session
            .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(5_200)))
            .unwrap();
        assert!(session.tick().unwrap().fired());
        assert_eq!(voice.starts.load(Ordering::SeqCst), 1);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.triggers, 1);
        assert_eq!(snapshot.transport_bpm, 120.0);
    }

    #[test]
    fn authentication_error_requests_reauth() {
        let (session, _voice) = session_with(SyncConfig::default());
        session
            .on_playback_event(PlaybackEvent::Error {
                kind: PlaybackErrorKind::Playback,
                message: "device unavailable".into(),
            })
            .unwrap();
        assert!(!session.snapshot().unwrap().status.needs_reauth);

        session
            .on_playback_event(PlaybackEvent::Error {
                kind: PlaybackErrorKind::Authentication,
                message: "invalid token".into(),
            })
            .unwrap();
        let status = session.snapshot().unwrap().status;
        assert!(status.needs_reauth);
        assert!(status.error.unwrap().contains("invalid token"));
    }

    #[test]
    fn reset_engine_clears_cooldown() {
        let (session, _voice) = session_with(SyncConfig::default());
        let ticket = session.select_track(TrackId::new("a")).unwrap();
        session
            .complete_fetch(&ticket, Ok(analysis(7, &[1.0], Some(10.0))))
            .unwrap();
        session.reset_engine().unwrap();
        assert_eq!(session.snapshot().unwrap().do_not_play_until, 0.0);
    }

    struct MapProvider {
        documents: HashMap<String, BeatAnalysis>,
    }

    impl AnalysisProvider for MapProvider {
        fn fetch(&self, track: &TrackId) -> Result<BeatAnalysis> {
            self.documents
                .get(track.as_str())
                .cloned()
                .ok_or_else(|| SyncError::AnalysisFetch {
                    track: track.to_string(),
                    reason: "not found".into(),
                })
        }
    }

    #[test]
    fn fetch_with_applies_provider_result() {
        let (session, _voice) = session_with(SyncConfig::default());
        let provider = Arc::new(MapProvider {
            documents: HashMap::from([("a".to_string(), analysis(9, &[1.0, 2.0, 3.0], None))]),
        });

        let outcome = session
            .fetch_with(Arc::clone(&provider), TrackId::new("a"))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Applied(effects) if effects.key_diff == 2));

        let outcome = session
            .fetch_with(provider, TrackId::new("missing"))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Failed);
        assert_eq!(session.snapshot().unwrap().beat_count, 3);
    }

    #[test]
    fn poller_fires_once_on_stale_position() {
        let config = SyncConfig {
            poll_interval_ms: 1,
            ..Default::default()
        };
        let (session, voice) = session_with(config);
        let ticket = session.select_track(TrackId::new("a")).unwrap();
        session
            .complete_fetch(&ticket, Ok(analysis(7, &[1.0], None)))
            .unwrap();
        session
            .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(1_000)))
            .unwrap();

        let poller = session.spawn_poller().unwrap();
        thread::sleep(Duration::from_millis(50));
        poller.stop().unwrap();

        assert_eq!(voice.starts.load(Ordering::SeqCst), 1);
        assert_eq!(session.snapshot().unwrap().do_not_play_until, 9.0);
    }

    #[test]
    fn ticks_keep_running_while_an_effect_renders() {
        let (session, rendering) = slow_session(Duration::from_millis(300));
        session
            .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(1_000)))
            .unwrap();
        let ticket = session.select_track(TrackId::new("a")).unwrap();
        let worker = {
            let session = session.clone();
            thread::spawn(move || session.complete_fetch(&ticket, Ok(analysis(9, &[1.0], None))))
        };

        rendering.recv().unwrap();
        let started = Instant::now();
        assert_eq!(session.tick().unwrap(), TickOutcome::Idle);
        assert!(started.elapsed() < Duration::from_millis(100));

        let outcome = worker.join().unwrap().unwrap();
        assert!(matches!(outcome, FetchOutcome::Applied(_)));
        assert!(session.tick().unwrap().fired());
    }

    #[test]
    fn selection_change_during_render_discards_result() {
        let (session, rendering) = slow_session(Duration::from_millis(50));
        let ticket = session.select_track(TrackId::new("a")).unwrap();
        let worker = {
            let session = session.clone();
            thread::spawn(move || session.complete_fetch(&ticket, Ok(analysis(9, &[1.0], None))))
        };

        rendering.recv().unwrap();
        session.select_track(TrackId::new("b")).unwrap();

        assert_eq!(worker.join().unwrap().unwrap(), FetchOutcome::Discarded);
        assert_eq!(session.snapshot().unwrap().beat_count, 0);
    }

    #[test]
    fn reselecting_a_track_retires_the_earlier_ticket() {
        let (session, voice) = session_with(SyncConfig::default());
        let first = session.select_track(TrackId::new("a")).unwrap();
        session.select_track(TrackId::new("b")).unwrap();
        let second = session.select_track(TrackId::new("a")).unwrap();
        assert_eq!(first.track(), second.track());

        let outcome = session
            .complete_fetch(&first, Ok(analysis(9, &[1.0], Some(3.0))))
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Discarded);

        let outcome = session
            .complete_fetch(&second, Ok(analysis(9, &[1.0], Some(3.0))))
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Applied(_)));
        assert_eq!(voice.connected.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_bind_keeps_previous_analysis() {
        let (session, voice) = session_with(SyncConfig::default());
        let first = session.select_track(TrackId::new("a")).unwrap();
        session
            .complete_fetch(&first, Ok(analysis(7, &[1.0, 2.0], None)))
            .unwrap();

        voice.broken.store(true, Ordering::SeqCst);
        let second = session.select_track(TrackId::new("b")).unwrap();
        let err = session
            .complete_fetch(&second, Ok(analysis(9, &[6.0], Some(3.0))))
            .unwrap_err();
        assert!(err.to_string().contains("output device lost"));

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.beat_count, 2);
        assert_eq!(snapshot.key, Some("G"));
        assert_eq!(snapshot.do_not_play_until, 0.0);
        assert!(snapshot.status.error.is_some());
    }

    #[test]
    fn snapshot_counts_playback_updates() {
        let (session, _voice) = session_with(SyncConfig::default());
        for progress_ms in [0, 500, 1_000] {
            session
                .on_playback_event(PlaybackEvent::Update(PlaybackState::playing(progress_ms)))
                .unwrap();
        }

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.playback_updates, 3);
        assert_eq!(snapshot.progress_ms, Some(1_000));
        assert!(snapshot.is_playing);
    }
}
