//! Audio output via cpal
//!
//! An [`OutputBackend`] negotiates a device format and opens an
//! [`OutputBinding`] that pulls from the processing chain on the device's
//! callback thread. The cpal backend tries the default host first and one
//! other host if that fails.

use std::sync::{ Arc, Mutex, PoisonError };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;

use crate::buffer::SampleSource;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Audio host unavailable: {0}" )]
    HostUnavailable( String ),

    #[error( "Failed to get stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),
}


/// Format agreed with the device.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct OutputConfig {
    /// Name of the host API that accepted the format
    pub api: String,
    pub sample_rate: u32,
    pub channels: u16,
}


/// Something that can play a pull-based source.
pub trait OutputBackend: Send + Sync {
    /// Picks a device format for a source of the given rate and channel count.
    fn negotiate( &self, sample_rate: u32, channels: u16 ) -> Result<OutputConfig, OutputError>;

    /// Opens a stream that pulls from `source`. The stream starts paused.
    fn open(
        &self,
        config: &OutputConfig,
        source: Box<dyn SampleSource>,
    ) -> Result<Box<dyn OutputBinding>, OutputError>;
}


/// A running device stream. Dropping it stops the stream and releases the source.
pub trait OutputBinding: Send {
    fn play( &self ) -> Result<(), OutputError>;

    fn pause( &self ) -> Result<(), OutputError>;

    fn config( &self ) -> &OutputConfig;
}


/// Copies whole frames from `src` into `out`, converting channel layout.
///
/// Whatever part of `out` is not covered is filled with silence. Returns
/// the number of output samples carrying audio.
pub fn remix_into( src: &[f32], src_ch: usize, out: &mut [f32], out_ch: usize ) -> usize {
    let src_ch = src_ch.max( 1 );
    let out_ch = out_ch.max( 1 );
    let frames = ( src.len() / src_ch ).min( out.len() / out_ch );

    if src_ch == out_ch {
        out[ ..frames * out_ch ].copy_from_slice( &src[ ..frames * src_ch ] );
    } else if src_ch == 1 {
        // Mono to many: duplicate
        for ( frame, &sample ) in out.chunks_exact_mut( out_ch ).zip( src.iter() ) {
            frame.fill( sample );
        }
    } else if out_ch == 1 {
        // Many to mono: average
        let scale = 1.0 / src_ch as f32;
        for ( slot, frame ) in out.iter_mut().zip( src.chunks_exact( src_ch ) ) {
            *slot = frame.iter().sum::<f32>() * scale;
        }
    } else {
        // Keep shared channels, repeat the last source channel into extra outputs
        for ( dst, frame ) in out.chunks_exact_mut( out_ch ).zip( src.chunks_exact( src_ch ) ).take( frames ) {
            for ( ch, slot ) in dst.iter_mut().enumerate() {
                *slot = frame[ ch.min( src_ch - 1 ) ];
            }
        }
    }

    let written = frames * out_ch;
    out[ written.. ].fill( 0.0 );
    written
}


/// Output through the system's audio hosts.
#[derive( Debug, Default, Clone, Copy )]
pub struct CpalBackend;


impl CpalBackend {
    pub fn new() -> Self {
        Self
    }


    /// The default host followed by at most one alternative.
    fn hosts() -> Vec<cpal::HostId> {
        let default = cpal::default_host().id();
        let mut hosts = vec![ default ];
        if let Some( other ) = cpal::available_hosts().into_iter().find( |id| *id != default ) {
            hosts.push( other );
        }
        hosts
    }


    /// Hosts to try for a negotiated config: the one that accepted it first.
    fn hosts_for( config: &OutputConfig ) -> Vec<cpal::HostId> {
        let mut hosts = Self::hosts();
        if let Some( index ) = hosts.iter().position( |id| id.name() == config.api ) {
            let preferred = hosts.remove( index );
            hosts.insert( 0, preferred );
        }
        hosts
    }


    fn device( host_id: cpal::HostId ) -> Result<cpal::Device, OutputError> {
        let host = cpal::host_from_id( host_id )
            .map_err( |e| OutputError::HostUnavailable( e.to_string() ) )?;
        host.default_output_device().ok_or( OutputError::NoDevice )
    }


    fn negotiate_on(
        host_id: cpal::HostId,
        sample_rate: u32,
        channels: u16,
    ) -> Result<OutputConfig, OutputError> {
        let device = Self::device( host_id )?;
        tracing::info!( "Using output device: {:?} ({})", device.name(), host_id.name() );

        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        // The callback writes f32; prefer configs that take it natively
        let float: Vec<_> = supported
            .iter()
            .filter( |c| c.sample_format() == cpal::SampleFormat::F32 )
            .cloned()
            .collect();
        let candidates = if float.is_empty() { supported } else { float };

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate
        };

        // Priority: 1) exact match, 2) same sample rate any channels, 3) device default
        let ( rate, device_channels ) = if let Some( c ) = candidates.iter().find( |c| {
            c.channels() == channels && supports_rate( *c )
        }) {
            ( sample_rate, c.channels() )
        } else if let Some( c ) = candidates.iter().find( |c| supports_rate( *c ) ) {
            tracing::info!(
                "Channel conversion: source has {} channels, device using {}",
                channels,
                c.channels()
            );
            ( sample_rate, c.channels() )
        } else {
            let default = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::info!(
                "Device does not take {} Hz, resampling to {} Hz",
                sample_rate,
                default.sample_rate().0
            );
            ( default.sample_rate().0, default.channels() )
        };

        Ok( OutputConfig {
            api: host_id.name().to_string(),
            sample_rate: rate,
            channels: device_channels,
        })
    }


    fn open_on(
        host_id: cpal::HostId,
        config: &OutputConfig,
        source: Arc<Mutex<Box<dyn SampleSource>>>,
    ) -> Result<CpalBinding, OutputError> {
        let device = Self::device( host_id )?;
        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate( config.sample_rate ),
            buffer_size: cpal::BufferSize::Default,
        };

        let out_ch = ( config.channels as usize ).max( 1 );
        let mut scratch: Vec<f32> = Vec::new();

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut source = source.lock().unwrap_or_else( PoisonError::into_inner );
                    let src_ch = source.channels().max( 1 );
                    let needed = ( data.len() / out_ch ) * src_ch;
                    if scratch.len() < needed {
                        scratch.resize( needed, 0.0 );
                    }
                    let produced = source.read( &mut scratch[ ..needed ] );
                    remix_into( &scratch[ ..produced ], src_ch, data, out_ch );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        // Streams may start running on creation on some hosts
        stream.pause().map_err( |e| OutputError::PlayStream( e.to_string() ) )?;

        tracing::info!(
            "Audio output config: {} Hz, {} channels via {}",
            config.sample_rate,
            config.channels,
            host_id.name()
        );

        Ok( CpalBinding {
            stream,
            config: OutputConfig { api: host_id.name().to_string(), ..config.clone() },
        })
    }
}


impl OutputBackend for CpalBackend {
    fn negotiate( &self, sample_rate: u32, channels: u16 ) -> Result<OutputConfig, OutputError> {
        let mut last_error = OutputError::NoDevice;
        for host_id in Self::hosts() {
            match Self::negotiate_on( host_id, sample_rate, channels ) {
                Ok( config ) => return Ok( config ),
                Err( e ) => {
                    tracing::warn!( "{} output unavailable: {}", host_id.name(), e );
                    last_error = e;
                }
            }
        }
        Err( last_error )
    }


    fn open(
        &self,
        config: &OutputConfig,
        source: Box<dyn SampleSource>,
    ) -> Result<Box<dyn OutputBinding>, OutputError> {
        let source = Arc::new( Mutex::new( source ) );
        let mut last_error = OutputError::NoDevice;
        for host_id in Self::hosts_for( config ) {
            match Self::open_on( host_id, config, Arc::clone( &source ) ) {
                Ok( binding ) => return Ok( Box::new( binding ) ),
                Err( e ) => {
                    tracing::warn!( "Could not open {} output: {}", host_id.name(), e );
                    last_error = e;
                }
            }
        }
        Err( last_error )
    }
}


/// A cpal stream bound to one processing chain.
struct CpalBinding {
    stream: cpal::Stream,
    config: OutputConfig,
}


// SAFETY: the binding is only driven (play/pause/drop) from control threads
// under the engine's lock. cpal::Stream's raw pointers are only touched by
// the callback thread, which cpal manages internally.
unsafe impl Send for CpalBinding {}


impl OutputBinding for CpalBinding {
    fn play( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    fn pause( &self ) -> Result<(), OutputError> {
        self.stream
            .pause()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    fn config( &self ) -> &OutputConfig {
        &self.config
    }
}


impl Drop for CpalBinding {
    fn drop( &mut self ) {
        tracing::debug!( "Closing {} output stream", self.config.api );
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_remix_same_layout() {
        let mut out = [ 9.0; 6 ];
        assert_eq!( remix_into( &[ 1.0, 2.0, 3.0, 4.0 ], 2, &mut out, 2 ), 4 );
        assert_eq!( out, [ 1.0, 2.0, 3.0, 4.0, 0.0, 0.0 ] );
    }


    #[test]
    fn test_remix_mono_to_stereo() {
        let mut out = [ 0.0; 4 ];
        assert_eq!( remix_into( &[ 0.5, -0.5 ], 1, &mut out, 2 ), 4 );
        assert_eq!( out, [ 0.5, 0.5, -0.5, -0.5 ] );
    }


    #[test]
    fn test_remix_stereo_to_mono() {
        let mut out = [ 1.0; 3 ];
        assert_eq!( remix_into( &[ 1.0, 0.0, 0.5, 0.5 ], 2, &mut out, 1 ), 2 );
        assert_eq!( out, [ 0.5, 0.5, 0.0 ] );
    }


    #[test]
    fn test_remix_general_case() {
        let mut out = [ 0.0; 8 ];
        assert_eq!( remix_into( &[ 1.0, 2.0, 3.0, 4.0, 5.0, 6.0 ], 3, &mut out, 4 ), 8 );
        assert_eq!( out, [ 1.0, 2.0, 3.0, 3.0, 4.0, 5.0, 6.0, 6.0 ] );

        let mut out = [ 0.0; 4 ];
        assert_eq!( remix_into( &[ 1.0, 2.0, 3.0, 4.0, 5.0, 6.0 ], 3, &mut out, 2 ), 4 );
        assert_eq!( out, [ 1.0, 2.0, 4.0, 5.0 ] );
    }


    #[test]
    fn test_remix_ignores_partial_frames() {
        let mut out = [ 7.0; 4 ];
        assert_eq!( remix_into( &[ 1.0, 2.0, 3.0 ], 2, &mut out, 2 ), 2 );
        assert_eq!( out, [ 1.0, 2.0, 0.0, 0.0 ] );
    }
}
