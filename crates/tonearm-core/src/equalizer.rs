//! Multi-band equalizer
//!
//! A cascade of peaking biquads per channel. Profiles are immutable
//! snapshots; publishing a new one rebuilds the whole filter bank and swaps
//! it in under the same lock the audio path takes for each block.

use std::f64::consts::PI;
use std::sync::{ Arc, Mutex, PoisonError };

use thiserror::Error;

use crate::buffer::SampleSource;


/// Number of bands in every profile.
pub const BAND_COUNT: usize = 10;

/// Centre frequencies of the standard bands, in Hz.
pub const DEFAULT_FREQUENCIES: [f32; BAND_COUNT] = [
    31.0, 62.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub const MIN_GAIN_DB: f32 = -12.0;
pub const MAX_GAIN_DB: f32 = 12.0;
pub const DEFAULT_Q: f32 = 1.0;

/// Bands at or above this fraction of the sample rate are left neutral.
const MAX_RELATIVE_FREQUENCY: f64 = 0.49;


/// Errors reported by strict profile validation.
#[derive( Debug, Error, PartialEq )]
pub enum ProfileError {
    #[error( "Too many bands: {0} (at most 10)" )]
    TooManyBands( usize ),

    #[error( "Band {index}: gain {gain_db} dB outside [-12, 12]" )]
    GainOutOfRange { index: usize, gain_db: f32 },

    #[error( "Band {index}: Q must be positive, got {q}" )]
    InvalidQ { index: usize, q: f32 },

    #[error( "Band {index}: invalid frequency {frequency} Hz" )]
    InvalidFrequency { index: usize, frequency: f32 },
}


/// One equalizer control point.
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct BandSetting {
    /// Centre frequency in Hz
    pub frequency: f32,
    /// Gain in dB
    pub gain_db: f32,
    /// Bandwidth; higher is narrower
    pub q: f32,
}


impl BandSetting {
    pub fn new( frequency: f32, gain_db: f32, q: f32 ) -> Self {
        Self { frequency, gain_db, q }
    }


    /// A 0 dB band at the given frequency.
    pub fn flat( frequency: f32 ) -> Self {
        Self::new( frequency, 0.0, DEFAULT_Q )
    }


    /// Coerces out-of-range values instead of rejecting them.
    fn coerced( self, index: usize ) -> Self {
        let frequency = if self.frequency.is_finite() && self.frequency > 0.0 {
            self.frequency
        } else {
            DEFAULT_FREQUENCIES[ index ]
        };
        let gain_db = if self.gain_db.is_finite() {
            self.gain_db.clamp( MIN_GAIN_DB, MAX_GAIN_DB )
        } else {
            0.0
        };
        let q = if self.q.is_finite() && self.q > 0.0 { self.q } else { DEFAULT_Q };

        Self { frequency, gain_db, q }
    }


    fn validate( &self, index: usize ) -> Result<(), ProfileError> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err( ProfileError::InvalidFrequency { index, frequency: self.frequency } );
        }
        if !self.gain_db.is_finite() || !( MIN_GAIN_DB..=MAX_GAIN_DB ).contains( &self.gain_db ) {
            return Err( ProfileError::GainOutOfRange { index, gain_db: self.gain_db } );
        }
        if !self.q.is_finite() || self.q <= 0.0 {
            return Err( ProfileError::InvalidQ { index, q: self.q } );
        }
        Ok(())
    }
}


/// An immutable, always-complete set of [`BAND_COUNT`] bands.
#[derive( Debug, Clone, PartialEq )]
pub struct EqualizerProfile {
    bands: Arc<[BandSetting]>,
}


impl EqualizerProfile {
    /// Builds a profile, coercing bad input.
    ///
    /// Missing bands are filled with 0 dB bands at the standard frequencies,
    /// extra bands are dropped, gains are clamped and non-positive Q becomes 1.0.
    pub fn new( bands: impl IntoIterator<Item = BandSetting> ) -> Self {
        let mut given: Vec<BandSetting> = bands.into_iter().collect();
        if given.len() > BAND_COUNT {
            tracing::warn!( "Equalizer profile has {} bands, keeping the first {}", given.len(), BAND_COUNT );
            given.truncate( BAND_COUNT );
        }

        let bands = ( 0..BAND_COUNT )
            .map( |i| match given.get( i ) {
                Some( band ) => band.coerced( i ),
                None => BandSetting::flat( DEFAULT_FREQUENCIES[ i ] ),
            })
            .collect();

        Self { bands }
    }


    /// Builds a profile, rejecting anything [`EqualizerProfile::new`] would coerce
    /// other than missing trailing bands.
    pub fn strict( bands: impl IntoIterator<Item = BandSetting> ) -> Result<Self, ProfileError> {
        let given: Vec<BandSetting> = bands.into_iter().collect();
        if given.len() > BAND_COUNT {
            return Err( ProfileError::TooManyBands( given.len() ) );
        }
        for ( index, band ) in given.iter().enumerate() {
            band.validate( index )?;
        }
        Ok( Self::new( given ) )
    }


    /// All bands at 0 dB.
    pub fn flat() -> Self {
        Self::new( std::iter::empty() )
    }


    /// Standard frequencies with the given gains.
    pub fn from_gains( gains: &[f32] ) -> Self {
        Self::new(
            gains.iter()
                .zip( DEFAULT_FREQUENCIES )
                .map( |( &gain, frequency )| BandSetting::new( frequency, gain, DEFAULT_Q ) )
        )
    }


    /// Returns a copy with one band's gain replaced.
    pub fn with_gain( &self, index: usize, gain_db: f32 ) -> Self {
        let mut bands = self.bands.to_vec();
        if let Some( band ) = bands.get_mut( index ) {
            band.gain_db = gain_db;
        }
        Self::new( bands )
    }


    pub fn bands( &self ) -> &[BandSetting] {
        &self.bands
    }


    /// True when every band is at 0 dB.
    pub fn is_flat( &self ) -> bool {
        self.bands.iter().all( |b| b.gain_db == 0.0 )
    }
}


impl Default for EqualizerProfile {
    fn default() -> Self {
        Self::flat()
    }
}


/// Normalized biquad coefficients (a0 == 1).
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct Coefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}


impl Coefficients {
    /// Passes input through unchanged.
    pub const IDENTITY: Self = Self { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0 };


    /// Peaking EQ design from the RBJ audio EQ cookbook.
    pub fn peaking( sample_rate: u32, band: &BandSetting ) -> Self {
        let fs = sample_rate as f64;
        let f0 = band.frequency as f64;
        if band.gain_db == 0.0 || f0 >= fs * MAX_RELATIVE_FREQUENCY {
            return Self::IDENTITY;
        }

        let linear = 10f64.powf( band.gain_db as f64 / 20.0 );
        let a = linear.sqrt();
        let w0 = 2.0 * PI * f0 / fs;
        let ( sin_w0, cos_w0 ) = w0.sin_cos();
        let alpha = sin_w0 / ( 2.0 * band.q as f64 );

        let a0 = 1.0 + alpha / a;
        Self {
            b0: ( 1.0 + alpha * a ) / a0,
            b1: ( -2.0 * cos_w0 ) / a0,
            b2: ( 1.0 - alpha * a ) / a0,
            a1: ( -2.0 * cos_w0 ) / a0,
            a2: ( 1.0 - alpha / a ) / a0,
        }
    }
}


/// Direct form I second-order section.
#[derive( Debug, Clone, PartialEq )]
struct Biquad {
    coeffs: Coefficients,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}


impl Biquad {
    fn new( coeffs: Coefficients ) -> Self {
        Self { coeffs, x1: 0.0, x2: 0.0, y1: 0.0, y2: 0.0 }
    }


    #[inline]
    fn process( &mut self, input: f64 ) -> f64 {
        let c = &self.coeffs;
        let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }
}


/// Filter state: one chain of [`BAND_COUNT`] biquads per channel.
#[derive( Debug, Clone, PartialEq )]
pub struct FilterBank {
    chains: Vec<Vec<Biquad>>,
}


impl FilterBank {
    /// Designs a fresh bank with cleared history.
    pub fn design( profile: &EqualizerProfile, sample_rate: u32, channels: usize ) -> Self {
        let chain: Vec<Biquad> = profile
            .bands()
            .iter()
            .map( |band| Biquad::new( Coefficients::peaking( sample_rate, band ) ) )
            .collect();

        Self { chains: vec![ chain; channels.max( 1 ) ] }
    }


    /// Filters interleaved samples in place, bands applied in order.
    pub fn process( &mut self, samples: &mut [f32] ) {
        let channels = self.chains.len();
        for frame in samples.chunks_mut( channels ) {
            for ( sample, chain ) in frame.iter_mut().zip( self.chains.iter_mut() ) {
                let mut value = *sample as f64;
                for filter in chain.iter_mut() {
                    value = filter.process( value );
                }
                *sample = value as f32;
            }
        }
    }


    /// Coefficients of each band, in band order.
    pub fn coefficients( &self ) -> Vec<Coefficients> {
        self.chains
            .first()
            .map( |chain| chain.iter().map( |f| f.coeffs ).collect() )
            .unwrap_or_default()
    }


    pub fn channels( &self ) -> usize {
        self.chains.len()
    }
}


/// Equalizer stage of the processing chain.
pub struct Equalizer<S> {
    source: S,
    bank: Arc<Mutex<FilterBank>>,
}


impl<S: SampleSource> Equalizer<S> {
    pub fn new( source: S, profile: &EqualizerProfile ) -> Self {
        let bank = FilterBank::design( profile, source.sample_rate(), source.channels() );
        Self {
            source,
            bank: Arc::new( Mutex::new( bank ) ),
        }
    }


    /// Returns a handle for publishing profiles from another thread.
    pub fn control( &self ) -> EqualizerControl {
        EqualizerControl {
            bank: Arc::clone( &self.bank ),
            sample_rate: self.source.sample_rate(),
            channels: self.source.channels(),
        }
    }
}


impl<S: SampleSource> SampleSource for Equalizer<S> {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        let n = self.source.read( buf );
        if n > 0 {
            let mut bank = self.bank.lock().unwrap_or_else( PoisonError::into_inner );
            bank.process( &mut buf[ ..n ] );
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


/// Shared handle to a live equalizer's filter bank.
#[derive( Clone )]
pub struct EqualizerControl {
    bank: Arc<Mutex<FilterBank>>,
    sample_rate: u32,
    channels: usize,
}


impl EqualizerControl {
    /// Rebuilds the filter bank for `profile` and swaps it in.
    ///
    /// Design happens before the lock is taken; the critical section is the swap.
    pub fn update_profile( &self, profile: &EqualizerProfile ) {
        let fresh = FilterBank::design( profile, self.sample_rate, self.channels );
        let old = {
            let mut bank = self.bank.lock().unwrap_or_else( PoisonError::into_inner );
            std::mem::replace( &mut *bank, fresh )
        };
        drop( old );
        tracing::debug!( "Equalizer profile updated" );
    }


    /// Copy of the current filter state.
    pub fn snapshot( &self ) -> FilterBank {
        self.bank.lock().unwrap_or_else( PoisonError::into_inner ).clone()
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use crate::buffer::MemorySource;


    fn peak( samples: &[f32] ) -> f32 {
        samples.iter().fold( 0.0f32, |m, s| m.max( s.abs() ) )
    }


    #[test]
    fn test_short_profile_is_padded_with_flat_bands() {
        for n in 0..BAND_COUNT {
            let given: Vec<_> = ( 0..n ).map( |i| BandSetting::new( DEFAULT_FREQUENCIES[ i ], 3.0, 2.0 ) ).collect();
            let profile = EqualizerProfile::new( given );

            assert_eq!( profile.bands().len(), BAND_COUNT );
            for ( i, band ) in profile.bands().iter().enumerate().skip( n ) {
                assert_eq!( *band, BandSetting::flat( DEFAULT_FREQUENCIES[ i ] ) );
            }

            let eq = Equalizer::new( MemorySource::new( vec![ 0.1; 64 ], 44100, 2 ), &profile );
            assert_eq!( eq.control().snapshot().coefficients().len(), BAND_COUNT );
        }
    }


    #[test]
    fn test_invalid_q_and_gain_are_coerced() {
        let profile = EqualizerProfile::new( vec![
            BandSetting::new( 100.0, 30.0, 0.0 ),
            BandSetting::new( 200.0, -40.0, -3.0 ),
            BandSetting::new( f32::NAN, f32::NAN, f32::INFINITY ),
        ]);

        let bands = profile.bands();
        assert_eq!( bands[ 0 ], BandSetting::new( 100.0, MAX_GAIN_DB, DEFAULT_Q ) );
        assert_eq!( bands[ 1 ], BandSetting::new( 200.0, MIN_GAIN_DB, DEFAULT_Q ) );
        assert_eq!( bands[ 2 ], BandSetting::flat( DEFAULT_FREQUENCIES[ 2 ] ) );
    }


    #[test]
    fn test_empty_profile_is_flat() {
        let profile = EqualizerProfile::new( Vec::new() );
        assert!( profile.is_flat() );
        assert_eq!( profile, EqualizerProfile::default() );
    }


    #[test]
    fn test_extra_bands_are_dropped() {
        let profile = EqualizerProfile::new( vec![ BandSetting::new( 1000.0, 1.0, 1.0 ); 14 ] );
        assert_eq!( profile.bands().len(), BAND_COUNT );
    }


    #[test]
    fn test_strict_rejects_what_new_coerces() {
        assert_eq!(
            EqualizerProfile::strict( vec![ BandSetting::new( 100.0, 0.0, 0.0 ) ] ),
            Err( ProfileError::InvalidQ { index: 0, q: 0.0 } )
        );
        assert_eq!(
            EqualizerProfile::strict( vec![ BandSetting::flat( 100.0 ), BandSetting::new( 200.0, 13.0, 1.0 ) ] ),
            Err( ProfileError::GainOutOfRange { index: 1, gain_db: 13.0 } )
        );
        assert_eq!(
            EqualizerProfile::strict( vec![ BandSetting::flat( 100.0 ); 11 ] ),
            Err( ProfileError::TooManyBands( 11 ) )
        );
        assert!( EqualizerProfile::strict( vec![ BandSetting::new( 100.0, -12.0, 0.5 ) ] ).is_ok() );
    }


    #[test]
    fn test_flat_profile_is_identity() {
        let input: Vec<f32> = ( 0..4096 ).map( |i| ( ( i * 7919 ) % 2001 ) as f32 / 1000.0 - 1.0 ).collect();
        let mut eq = Equalizer::new( MemorySource::new( input.clone(), 44100, 2 ), &EqualizerProfile::flat() );

        let mut out = vec![ 0.0; input.len() ];
        assert_eq!( eq.read( &mut out ), input.len() );
        for ( a, b ) in input.iter().zip( &out ) {
            assert!( ( a - b ).abs() < 1e-6 );
        }
    }


    #[test]
    fn test_zero_gain_design_is_identity() {
        let coeffs = Coefficients::peaking( 48000, &BandSetting::new( 1000.0, 0.0, 4.0 ) );
        assert_eq!( coeffs, Coefficients::IDENTITY );
    }


    #[test]
    fn test_band_above_nyquist_is_neutral() {
        let coeffs = Coefficients::peaking( 22050, &BandSetting::new( 16000.0, 6.0, 1.0 ) );
        assert_eq!( coeffs, Coefficients::IDENTITY );
    }


    #[test]
    fn test_boost_at_centre_frequency() {
        let profile = EqualizerProfile::flat().with_gain( 5, 12.0 );
        let source = MemorySource::sine( 1000.0, 0.1, 44100, 44100 );
        let mut eq = Equalizer::new( source, &profile );

        let mut out = vec![ 0.0; 44100 ];
        eq.read( &mut out );

        // 12 dB is a factor of ~3.98 once the filter has settled
        let settled = peak( &out[ 40000.. ] );
        assert!( ( settled - 0.398 ).abs() < 0.02, "settled peak {}", settled );
    }


    #[test]
    fn test_cut_away_from_centre_is_small() {
        let profile = EqualizerProfile::flat().with_gain( 9, -12.0 );
        let source = MemorySource::sine( 100.0, 0.5, 44100, 44100 );
        let mut eq = Equalizer::new( source, &profile );

        let mut out = vec![ 0.0; 44100 ];
        eq.read( &mut out );
        assert!( ( peak( &out[ 40000.. ] ) - 0.5 ).abs() < 0.01 );
    }


    #[test]
    fn test_channels_are_filtered_independently() {
        let mut samples = vec![ 0.0f32; 2000 ];
        for frame in samples.chunks_mut( 2 ) {
            frame[ 0 ] = 0.5;
        }
        let profile = EqualizerProfile::from_gains( &[ 6.0; BAND_COUNT ] );
        let mut eq = Equalizer::new( MemorySource::new( samples, 44100, 2 ), &profile );

        let mut out = vec![ 0.0; 2000 ];
        eq.read( &mut out );
        assert!( out.iter().skip( 1 ).step_by( 2 ).all( |&s| s == 0.0 ) );
        assert!( out.iter().step_by( 2 ).any( |&s| s != 0.5 ) );
    }


    #[test]
    fn test_republishing_same_profile_is_idempotent() {
        let profile = EqualizerProfile::from_gains( &[ 3.0, -2.0, 0.0, 5.5, 1.0 ] );
        let eq = Equalizer::new( MemorySource::new( Vec::new(), 48000, 2 ), &EqualizerProfile::flat() );
        let control = eq.control();

        control.update_profile( &profile );
        let once = control.snapshot();
        control.update_profile( &profile );
        assert_eq!( control.snapshot(), once );
        assert_eq!( once, FilterBank::design( &profile, 48000, 2 ) );
    }


    #[test]
    fn test_update_while_reading_from_another_thread() {
        let source = MemorySource::sine( 440.0, 0.2, 44100, 44100 * 2 );
        let mut eq = Equalizer::new( source, &EqualizerProfile::flat() );
        let control = eq.control();

        let updater = std::thread::spawn( move || {
            for i in 0..200 {
                control.update_profile( &EqualizerProfile::flat().with_gain( i % BAND_COUNT, ( i % 24 ) as f32 - 12.0 ) );
            }
        });

        let mut block = vec![ 0.0; 512 ];
        while eq.read( &mut block ) > 0 {
            assert!( block.iter().all( |s| s.is_finite() ) );
        }
        updater.join().unwrap();
    }
}
