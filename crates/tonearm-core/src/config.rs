//! Engine configuration

use std::time::Duration;

use crate::spectrum::SpectrumConfig;


/// Tuning for the playback engine.
#[derive( Debug, Clone, PartialEq )]
pub struct EngineConfig {
    /// Audio held between the decode worker and the output
    pub prefetch: Duration,

    /// How far ahead of the output the worker decodes before sleeping
    pub decode_ahead: Duration,

    /// Frames requested from the decoder per read
    pub decode_block_frames: usize,

    /// How long `seek` waits for the decode worker to reposition
    pub seek_timeout: Duration,

    pub spectrum: SpectrumConfig,
}


impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefetch: Duration::from_millis( 500 ),
            decode_ahead: Duration::from_millis( 50 ),
            decode_block_frames: 1024,
            seek_timeout: Duration::from_secs( 2 ),
            spectrum: SpectrumConfig::default(),
        }
    }
}


impl EngineConfig {
    /// Converts a duration to a whole number of interleaved samples, at least one frame.
    pub( crate ) fn samples_for( duration: Duration, sample_rate: u32, channels: usize ) -> usize {
        let frames = ( duration.as_secs_f64() * sample_rate as f64 ).ceil() as usize;
        frames.max( 1 ) * channels.max( 1 )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_samples_for() {
        assert_eq!( EngineConfig::samples_for( Duration::from_millis( 500 ), 44100, 2 ), 44100 );
        assert_eq!( EngineConfig::samples_for( Duration::ZERO, 48000, 2 ), 2 );
    }
}
