//! The opaque audio boundary (§4.9)
//!
//! Sound synthesis itself is an explicit non-goal — the scheduler in
//! [`crate::client::scheduler`] only ever decides *when* a note should
//! sound and hands that decision to whatever implements [`AudioSink`]. A
//! browser embedding would back this with a Web Audio `AudioContext`; a
//! native embedding might back it with `cpal` or `rodio` (see the
//! `fca6123b_jvn1228-rdum` sequencer in the wider ecosystem for that
//! shape) — neither belongs in this crate.
//!
//! Most audio backends start in a locked/suspended state until a user
//! gesture unlocks them (autoplay policy). [`AudioSink::is_unlocked`] lets
//! the scheduler hold scheduling until that happens rather than silently
//! dropping notes into a sink that will never play them.

use tracing::debug;

/// One note dispatched to the audio backend, fully resolved (track
/// transpose + parameter-lock pitch already summed, volume already
/// multiplied, etc — the sink never recomputes musical logic).
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNote {
    /// Sample or synthesis preset reference.
    pub sample_id: String,
    /// Fully resolved semitone pitch.
    pub pitch: i32,
    /// Fully resolved linear gain.
    pub volume: f64,
    /// How long the note should sustain before being cut, in seconds.
    /// `None` for [`crate::model::PlaybackMode::Oneshot`] (play to
    /// completion).
    pub gate_seconds: Option<f64>,
    /// Coordinator wall-clock time the note should sound at, milliseconds.
    /// A retriggered step resolves into several [`ScheduledNote`]s, each
    /// with its own `at_server_time_ms` — this boundary never receives a
    /// retrigger count to re-derive timing from.
    pub at_server_time_ms: f64,
}

/// The boundary between the scheduler and an actual sound-producing
/// backend. Intentionally minimal: every musical decision has already
/// been made by the time a [`ScheduledNote`] reaches this trait.
pub trait AudioSink {
    /// Schedule `note` to sound at its `at_server_time_ms`.
    fn schedule_note(&mut self, note: &ScheduledNote);

    /// Attempt to unlock the backend (call from within a user gesture
    /// handler). A no-op if already unlocked.
    fn unlock(&mut self);

    /// Whether the backend is currently able to produce sound.
    fn is_unlocked(&self) -> bool;

    /// Cancel any previously scheduled note at or after
    /// `at_or_after_server_time_ms`. Called when a tempo or pattern change
    /// invalidates the schedule (§4.7 "Tempo/pattern changes during
    /// playback"). Backends that schedule notes just-in-time rather than
    /// ahead of time can leave this a no-op.
    fn cancel_scheduled_from(&mut self, at_or_after_server_time_ms: f64) {
        let _ = at_or_after_server_time_ms;
    }
}

/// A sink that only logs what it would have played. Used in tests and as
/// a safe default before a real backend is wired up.
#[derive(Debug, Default)]
pub struct LoggingAudioSink {
    /// Notes scheduled so far, kept for test assertions.
    pub scheduled: Vec<ScheduledNote>,
    /// Cutoffs passed to [`AudioSink::cancel_scheduled_from`], kept for
    /// test assertions.
    pub cancellations: Vec<f64>,
    /// Whether [`AudioSink::unlock`] has been called.
    unlocked: bool,
}

impl LoggingAudioSink {
    /// Construct a fresh, locked sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioSink for LoggingAudioSink {
    fn schedule_note(&mut self, note: &ScheduledNote) {
        debug!(?note, "scheduling note");
        self.scheduled.push(note.clone());
    }

    fn unlock(&mut self) {
        self.unlocked = true;
    }

    fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn cancel_scheduled_from(&mut self, at_or_after_server_time_ms: f64) {
        self.scheduled.retain(|n| n.at_server_time_ms < at_or_after_server_time_ms);
        self.cancellations.push(at_or_after_server_time_ms);
    }
}
