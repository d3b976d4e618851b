//! The Keyboardia data model
//!
//! A [`Session`] is the unit of coordination: tempo, swing, the ordered list
//! of [`Track`]s, and an opaque effects blob. Tracks store a fixed 128-slot
//! grid regardless of their active `stepCount` view window — see
//! [`MAX_STEPS`] for why this is load-bearing, not an implementation detail.
//!
//! Every mutation path that touches a [`Session`] must finish by calling
//! [`validate_and_repair`], which is the single place invariants are
//! enforced (clamping, de-duplication, array-length repair). The structs
//! themselves stay plain serde data, cloned freely rather than wrapped in
//! interior mutability; the repair pass is what keeps that safe once a
//! collaborator can submit a malformed mutation.

use serde::{Deserialize, Serialize};

/// Storage length of every track's `steps` and `parameter_locks` arrays.
///
/// This is fixed regardless of [`Track::step_count`], which is only a
/// *view window*. Resizing these arrays on `step_count` change would
/// silently discard pattern data the moment a user shrinks, then grows, a
/// track's window — see DESIGN.md for the trap this guards against.
pub const MAX_STEPS: usize = 128;

/// Maximum number of tracks a session may hold.
pub const MAX_TRACKS: usize = 16;

/// The admissible `stepCount` values — the sizes of a track's active view
/// window. Includes straight divisions (4, 8, 16, 32, 64, 96 is triplet,
/// 128) and triplet-feel counts (12, 24, 96).
pub const VALID_STEP_COUNTS: [u32; 9] = [4, 8, 12, 16, 24, 32, 64, 96, 128];

/// Triplet step counts use a base unit of `60 / tempo / 6` instead of the
/// straight `60 / tempo / 4` sixteenth-note unit.
pub const TRIPLET_STEP_COUNTS: [u32; 3] = [12, 24, 96];

/// Clamp `value` into `[min, max]`.
fn clamp_f64(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Snap an arbitrary `step_count` to the nearest member of
/// [`VALID_STEP_COUNTS`], breaking ties toward the smaller value.
pub fn snap_step_count(requested: u32) -> u32 {
    VALID_STEP_COUNTS
        .iter()
        .copied()
        .min_by_key(|&candidate| {
            let diff = (candidate as i64 - requested as i64).abs();
            // Tie-break toward the smaller candidate by nudging larger
            // candidates' distance up by one.
            diff * 2 + i64::from(candidate > requested)
        })
        .expect("VALID_STEP_COUNTS is non-empty")
}

/// Whether notes triggered at `stepCount` positions should play with
/// triplet-feel timing (`60 / tempo / 6`) instead of straight sixteenths.
pub fn is_triplet_step_count(step_count: u32) -> bool {
    TRIPLET_STEP_COUNTS.contains(&step_count)
}

/// Playback mode for a track: whether note-off truncates the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Sample plays to completion regardless of step duration.
    Oneshot,
    /// Sample is cut short when the step's duration elapses (or on retrigger).
    Gated,
}

impl Default for PlaybackMode {
    fn default() -> Self {
        PlaybackMode::Oneshot
    }
}

/// Per-step override of pitch, velocity, probability, retrigger count, or
/// tie behavior. `None` fields fall back to the track's base values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterLock {
    /// Semitone offset added to `track.transpose`, clamped to `[-24, 24]`.
    pub pitch: Option<i32>,
    /// Velocity multiplier applied on top of `track.volume`, clamped to `[0, 2]`.
    pub volume: Option<f64>,
    /// Percent chance `[0, 100]` the step actually triggers.
    pub probability: Option<u32>,
    /// Number of retriggered hits within the step, `[1, 8]`.
    ///
    /// Ignored when `tie` is `Some(true)` — ties take precedence over
    /// retrigger.
    pub retrigger: Option<u32>,
    /// Whether this step ties into the following one(s), sustaining the
    /// note rather than retriggering.
    pub tie: Option<bool>,
}

impl ParameterLock {
    /// Clamp every present field into its declared range. Called by
    /// [`validate_and_repair`] and whenever a lock is set directly.
    pub fn clamp(&mut self) {
        if let Some(pitch) = self.pitch.as_mut() {
            *pitch = (*pitch).clamp(-24, 24);
        }
        if let Some(volume) = self.volume.as_mut() {
            *volume = clamp_f64(*volume, 0.0, 2.0);
        }
        if let Some(probability) = self.probability.as_mut() {
            *probability = (*probability).min(100);
        }
        if let Some(retrigger) = self.retrigger.as_mut() {
            *retrigger = (*retrigger).clamp(1, 8);
        }
    }

    /// Whether this lock effectively overrides nothing (all fields unset),
    /// in which case a mutation may just as well clear the slot entirely.
    pub fn is_empty(&self) -> bool {
        self.pitch.is_none()
            && self.volume.is_none()
            && self.probability.is_none()
            && self.retrigger.is_none()
            && self.tie.is_none()
    }
}

/// One sequencer lane: a sample/preset reference, its step grid, and the
/// per-step parameter locks layered on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Stable identifier within the owning session.
    pub id: String,
    /// Human label shown in the UI.
    pub name: String,
    /// Reference to a synthesis preset or sample pack; opaque to the core.
    pub sample_id: String,

    /// Local-only: never replicated, never hashed. See `docs` on
    /// [`crate::hash::canonical_hash`] for why this is load-bearing.
    #[serde(skip)]
    pub muted: bool,
    /// Local-only: never replicated, never hashed.
    #[serde(skip)]
    pub soloed: bool,

    /// Linear gain multiplier, `[0, 2]`.
    pub volume: f64,
    /// Semitone transpose applied to every triggered note, `[-24, 24]`.
    pub transpose: i32,
    /// Active view window length; always one of [`VALID_STEP_COUNTS`].
    /// Storage (`steps`, `parameter_locks`) is always [`MAX_STEPS`] long
    /// regardless of this value.
    pub step_count: u32,
    /// Whether release truncates the sample.
    pub playback_mode: PlaybackMode,

    /// Trigger grid. Always exactly [`MAX_STEPS`] entries; positions at or
    /// beyond `step_count` are retained but not played.
    pub steps: Vec<bool>,
    /// Per-step overrides, parallel to `steps`. Always exactly
    /// [`MAX_STEPS`] entries.
    pub parameter_locks: Vec<Option<ParameterLock>>,
}

impl Track {
    /// Construct a freshly-added track with empty pattern data and default
    /// parameters, already satisfying every invariant.
    pub fn new(id: impl Into<String>, name: impl Into<String>, sample_id: impl Into<String>) -> Self {
        Track {
            id: id.into(),
            name: name.into(),
            sample_id: sample_id.into(),
            muted: false,
            soloed: false,
            volume: 1.0,
            transpose: 0,
            step_count: 16,
            playback_mode: PlaybackMode::default(),
            steps: vec![false; MAX_STEPS],
            parameter_locks: vec![None; MAX_STEPS],
        }
    }

    /// Zero every step and parameter lock across all 128 storage slots,
    /// regardless of the current `step_count` window.
    pub fn clear_pattern(&mut self) {
        self.steps.iter_mut().for_each(|s| *s = false);
        self.parameter_locks.iter_mut().for_each(|l| *l = None);
    }

    /// Replace this track's pattern data with a deep copy of `other`'s,
    /// across all 128 storage slots, always.
    pub fn copy_pattern_from(&mut self, other: &Track) {
        self.steps = other.steps.clone();
        self.parameter_locks = other.parameter_locks.clone();
    }

    /// Apply range clamps and length repairs to this track in place.
    /// Returns `true` if anything was actually changed (for repair
    /// logging at the call site).
    pub fn validate_and_repair(&mut self) -> bool {
        let mut repaired = false;

        if self.steps.len() != MAX_STEPS {
            repaired = true;
            self.steps.resize(MAX_STEPS, false);
        }
        if self.parameter_locks.len() != MAX_STEPS {
            repaired = true;
            self.parameter_locks.resize(MAX_STEPS, None);
        }

        let clamped_volume = clamp_f64(self.volume, 0.0, 2.0);
        if clamped_volume != self.volume {
            repaired = true;
            self.volume = clamped_volume;
        }

        let clamped_transpose = self.transpose.clamp(-24, 24);
        if clamped_transpose != self.transpose {
            repaired = true;
            self.transpose = clamped_transpose;
        }

        if !VALID_STEP_COUNTS.contains(&self.step_count) {
            repaired = true;
            self.step_count = snap_step_count(self.step_count);
        }

        for lock in self.parameter_locks.iter_mut().flatten() {
            let before = *lock;
            lock.clamp();
            if *lock != before {
                repaired = true;
            }
        }

        repaired
    }
}

/// A session: the unit of coordination. Owns tempo/swing/effects and the
/// ordered list of tracks. `state_seq` is the coordinator-assigned log
/// index, incremented once per accepted mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Schema version, for migration.
    pub version: u32,
    /// Opaque, unguessable session identifier.
    pub session_id: String,
    /// Optional human label.
    pub name: Option<String>,
    /// Beats per minute, `[20, 300]`.
    pub tempo: f64,
    /// Swing percentage, `[0, 100]`.
    pub swing: f64,
    /// Ordered tracks, length `[0, 16]`.
    pub tracks: Vec<Track>,
    /// Opaque global effects parameters, synced as a blob.
    pub effects: serde_json::Value,
    /// Monotonically increasing, incremented on every accepted mutation.
    pub state_seq: u64,
}

/// Current schema version written by this implementation.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl Session {
    /// Construct a brand-new, empty session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Session {
            version: CURRENT_SCHEMA_VERSION,
            session_id: session_id.into(),
            name: None,
            tempo: 120.0,
            swing: 0.0,
            tracks: Vec::new(),
            effects: serde_json::Value::Object(Default::default()),
            state_seq: 0,
        }
    }

    /// Find a track by id.
    pub fn track(&self, track_id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == track_id)
    }

    /// Find a track by id, mutably.
    pub fn track_mut(&mut self, track_id: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == track_id)
    }

    /// Index of a track by id.
    pub fn track_index(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == track_id)
    }

    /// Whether any track is currently soloed locally.
    pub fn any_soloed(&self) -> bool {
        self.tracks.iter().any(|t| t.soloed)
    }

    /// Run [`Track::validate_and_repair`] on every track, clamp
    /// session-level numeric fields, de-duplicate track ids (keeping the
    /// first occurrence), and enforce the session-length cap implicitly
    /// (callers are responsible for rejecting `add_track` beyond
    /// [`MAX_TRACKS`] rather than silently truncating, since that is a
    /// referential failure, not a range violation).
    ///
    /// Returns `true` if anything was repaired.
    pub fn validate_and_repair(&mut self) -> bool {
        let mut repaired = false;

        let clamped_tempo = clamp_f64(self.tempo, 20.0, 300.0);
        if clamped_tempo != self.tempo {
            repaired = true;
            self.tempo = clamped_tempo;
        }

        let clamped_swing = clamp_f64(self.swing, 0.0, 100.0);
        if clamped_swing != self.swing {
            repaired = true;
            self.swing = clamped_swing;
        }

        let mut seen = std::collections::HashSet::new();
        let before_len = self.tracks.len();
        self.tracks.retain(|t| seen.insert(t.id.clone()));
        if self.tracks.len() != before_len {
            repaired = true;
        }

        for track in self.tracks.iter_mut() {
            if track.validate_and_repair() {
                repaired = true;
            }
        }

        repaired
    }
}
