//! Tonearm Core - Real-time audio pipeline
//!
//! This crate decodes audio files, runs them through a ten-band equalizer,
//! a volume stage and a spectrum analyzer, and plays the result on the
//! system's audio output. [`PlaybackEngine`] is the entry point.

pub mod buffer;
pub mod config;
pub mod decoder;
pub mod equalizer;
pub mod events;
mod graph;
pub mod output;
pub mod player;
pub mod spectrum;
pub mod volume;

pub use buffer::SampleSource;
pub use config::EngineConfig;
pub use decoder::{ DecoderError, DecoderKind, Stream };
pub use equalizer::{ BandSetting, EqualizerProfile, ProfileError };
pub use events::{ PlayerEvent, StopReason, SubscriptionId };
pub use output::{ CpalBackend, OutputBackend, OutputBinding, OutputConfig, OutputError };
pub use player::{ LoadOutcome, PlaybackEngine, PlaybackState, PlayerError };
pub use spectrum::{ Scaling, SpectrumConfig, SpectrumFrame, SpectrumSink };
pub use tokio_util::sync::CancellationToken;
