//! Volume stage
//!
//! Scalar gain after the equalizer. Changes apply from the next sample with
//! no ramping.

use std::sync::Arc;
use std::sync::atomic::{ AtomicU32, Ordering };

use crate::buffer::SampleSource;


/// Clamps a requested volume into [0.0, 1.0]; NaN becomes silence.
pub fn clamp_volume( volume: f32 ) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp( 0.0, 1.0 )
    }
}


/// Volume stage of the processing chain.
pub struct Volume<S> {
    source: S,
    /// Gain stored as f32 bits
    gain: Arc<AtomicU32>,
}


impl<S: SampleSource> Volume<S> {
    pub fn new( source: S, volume: f32 ) -> Self {
        Self {
            source,
            gain: Arc::new( AtomicU32::new( clamp_volume( volume ).to_bits() ) ),
        }
    }


    /// Returns a handle for changing the gain from another thread.
    pub fn control( &self ) -> VolumeControl {
        VolumeControl { gain: Arc::clone( &self.gain ) }
    }
}


impl<S: SampleSource> SampleSource for Volume<S> {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        let n = self.source.read( buf );
        let gain = f32::from_bits( self.gain.load( Ordering::Relaxed ) );
        if gain != 1.0 {
            for sample in buf[ ..n ].iter_mut() {
                *sample *= gain;
            }
        }
        n
    }


    fn sample_rate( &self ) -> u32 {
        self.source.sample_rate()
    }


    fn channels( &self ) -> usize {
        self.source.channels()
    }
}


/// Shared handle to a live volume stage.
#[derive( Clone )]
pub struct VolumeControl {
    gain: Arc<AtomicU32>,
}


impl VolumeControl {
    /// Sets the gain, clamped to [0.0, 1.0].
    pub fn set( &self, volume: f32 ) {
        self.gain.store( clamp_volume( volume ).to_bits(), Ordering::Relaxed );
    }


    /// Gets the gain currently applied.
    pub fn get( &self ) -> f32 {
        f32::from_bits( self.gain.load( Ordering::Relaxed ) )
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use crate::buffer::MemorySource;


    #[test]
    fn test_clamp_volume() {
        for v in [ -3.0, -0.0, 0.0, 0.25, 0.5, 0.999, 1.0, 1.5, 80.0, f32::INFINITY, f32::NEG_INFINITY ] {
            assert_eq!( clamp_volume( v ), v.clamp( 0.0, 1.0 ) );
        }
        assert_eq!( clamp_volume( f32::NAN ), 0.0 );
    }


    #[test]
    fn test_gain_applied_exactly() {
        for v in [ -1.0, 0.0, 0.3, 0.75, 1.0, 2.0 ] {
            let input = vec![ 0.5, -0.25, 1.0, -1.0 ];
            let mut stage = Volume::new( MemorySource::new( input.clone(), 44100, 1 ), v );
            assert_eq!( stage.control().get(), v.clamp( 0.0, 1.0 ) );

            let mut out = [ 0.0; 4 ];
            assert_eq!( stage.read( &mut out ), 4 );
            for ( i, o ) in input.iter().zip( out ) {
                assert_eq!( o, i * v.clamp( 0.0, 1.0 ) );
            }
        }
    }


    #[test]
    fn test_change_applies_to_next_block() {
        let mut stage = Volume::new( MemorySource::new( vec![ 1.0; 8 ], 44100, 1 ), 1.0 );
        let control = stage.control();

        let mut out = [ 0.0; 4 ];
        stage.read( &mut out );
        assert_eq!( out, [ 1.0; 4 ] );

        control.set( 0.5 );
        stage.read( &mut out );
        assert_eq!( out, [ 0.5; 4 ] );
    }
}
