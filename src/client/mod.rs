//! Native client pipeline: transport, local mirror, clock sync, scheduler,
//! divergence detection, and the opaque audio boundary (§4.4-§4.9)
//!
//! None of this is specific to a browser — a terminal client, a headless
//! test harness, or a future native UI can all embed [`Reducer`],
//! [`ClockSync`] and [`Scheduler`] directly; only [`transport::run`] is
//! genuinely network-shaped, and even that's a plain `tokio-tungstenite`
//! socket rather than anything browser-specific.

pub mod audio;
pub mod clock;
pub mod divergence;
pub mod reducer;
pub mod scheduler;
pub mod transport;

pub use audio::AudioSink;
pub use clock::ClockSync;
pub use divergence::DivergenceDetector;
pub use reducer::Reducer;
pub use scheduler::Scheduler;
