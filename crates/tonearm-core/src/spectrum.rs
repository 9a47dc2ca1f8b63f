//! Spectrum analysis
//!
//! A pass-through stage at the tail of the processing chain. It keeps a
//! history of the mono downmix, runs a windowed FFT over it every hop and
//! folds the bins into log-spaced bands normalized to [0, 1].
//!
//! Analysis never holds up the output: a busy analyzer skips the block, a
//! panic inside analysis is swallowed, and an analysis that ran longer than
//! the block it was given causes the next block to be skipped.

use std::panic::{ self, AssertUnwindSafe };
use std::sync::{ Arc, Mutex, PoisonError, TryLockError };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::{ Duration, Instant };

use rustfft::{ Fft, FftPlanner };
use rustfft::num_complex::Complex;

use crate::buffer::SampleSource;
use crate::events::{ EventHub, PlayerEvent };


/// Number of bands reported by default
pub const DEFAULT_BANDS: usize = 32;

/// Smallest FFT the analyzer will run
pub const MIN_FFT_SIZE: usize = 256;

const MAX_FFT_SIZE: usize = 1 << 16;

/// Magnitude floor for dB conversion
const SILENCE_DB: f32 = -120.0;


/// Mapping from linear band magnitude to display level.
#[derive( Debug, Clone, Copy, PartialEq )]
pub enum Scaling {
    /// `log10(1 + k·v) / log10(1 + k)`
    Logarithmic { k: f32 },

    /// Tracks the loudest and quietest bands in dB and maps between them.
    ///
    /// `attack` and `release` are per-frame smoothing factors in (0, 1] for
    /// the envelopes widening and narrowing respectively.
    Adaptive { attack: f32, release: f32, min_range_db: f32 },
}


impl Default for Scaling {
    fn default() -> Self {
        Scaling::Logarithmic { k: 100.0 }
    }
}


/// Analyzer settings.
#[derive( Debug, Clone, PartialEq )]
pub struct SpectrumConfig {
    /// Bands per frame
    pub bands: usize,

    /// FFT length in samples; rounded up to a power of two
    pub fft_size: usize,

    pub low_hz: f32,
    pub high_hz: f32,

    /// Weight of the band peak against the band RMS
    pub peak_weight: f32,

    pub scaling: Scaling,

    /// Exponent applied after scaling
    pub gamma: f32,

    /// Fraction of a drop applied per frame; rises are immediate
    pub release: f32,

    /// Minimum number of new frames between analyses
    pub min_hop: usize,
}


impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            bands: DEFAULT_BANDS,
            fft_size: 4096,
            low_hz: 50.0,
            high_hz: 20_000.0,
            peak_weight: 0.75,
            scaling: Scaling::default(),
            gamma: 1.0,
            release: 0.35,
            min_hop: 512,
        }
    }
}


impl SpectrumConfig {
    /// Returns a copy with every field forced into its usable range.
    pub fn normalized( &self ) -> Self {
        let fft_size = self.fft_size
            .clamp( MIN_FFT_SIZE, MAX_FFT_SIZE )
            .next_power_of_two();

        let low_hz = if self.low_hz.is_finite() && self.low_hz > 0.0 { self.low_hz } else { 50.0 };
        let high_hz = if self.high_hz.is_finite() && self.high_hz > low_hz { self.high_hz } else { 20_000.0_f32.max( low_hz * 2.0 ) };

        let scaling = match self.scaling {
            Scaling::Logarithmic { k } if k.is_finite() && k > 0.0 => Scaling::Logarithmic { k },
            Scaling::Logarithmic { .. } => Scaling::default(),
            Scaling::Adaptive { attack, release, min_range_db } => Scaling::Adaptive {
                attack: unit_or( attack, 0.5 ),
                release: unit_or( release, 0.05 ),
                min_range_db: if min_range_db.is_finite() && min_range_db > 1.0 { min_range_db } else { 30.0 },
            },
        };

        Self {
            bands: self.bands.max( 1 ),
            fft_size,
            low_hz,
            high_hz,
            peak_weight: if self.peak_weight.is_nan() { 0.75 } else { self.peak_weight.clamp( 0.0, 1.0 ) },
            scaling,
            gamma: if self.gamma.is_finite() && self.gamma > 0.0 { self.gamma } else { 1.0 },
            release: unit_or( self.release, 0.35 ),
            min_hop: self.min_hop.max( 1 ),
        }
    }
}


fn unit_or( value: f32, default: f32 ) -> f32 {
    if value.is_finite() && value > 0.0 { value.min( 1.0 ) } else { default }
}


/// One analysis result: `bands` values in [0, 1], lowest band first.
#[derive( Debug, Clone, PartialEq )]
pub struct SpectrumFrame {
    bands: Vec<f32>,
    sequence: u64,
}


impl SpectrumFrame {
    pub fn bands( &self ) -> &[f32] {
        &self.bands
    }


    pub fn len( &self ) -> usize {
        self.bands.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.bands.is_empty()
    }


    /// Monotonic counter of analyses run by the producing analyzer.
    pub fn sequence( &self ) -> u64 {
        self.sequence
    }


    pub fn into_bands( self ) -> Vec<f32> {
        self.bands
    }
}


/// FFT band analyzer.
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    sample_rate: u32,

    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Divisor turning a bin magnitude into a sine amplitude
    window_gain: f32,

    /// Ring of mono samples; `write` is the oldest slot
    history: Vec<f32>,
    write: usize,
    filled: usize,
    since_last: usize,

    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,

    edges: Vec<f32>,
    /// Half-open bin range per band
    band_bins: Vec<( usize, usize )>,

    raw: Vec<f32>,
    display: Vec<f32>,

    top_db: f32,
    floor_db: f32,

    sequence: u64,
}


impl SpectrumAnalyzer {
    pub fn new( config: SpectrumConfig, sample_rate: u32 ) -> Self {
        let config = config.normalized();
        let sample_rate = sample_rate.max( 1 );
        let n = config.fft_size;

        let fft = FftPlanner::<f32>::new().plan_fft_forward( n );
        let scratch_len = fft.get_inplace_scratch_len();

        let window: Vec<f32> = ( 0..n )
            .map( |i| 0.5 - 0.5 * ( 2.0 * std::f32::consts::PI * i as f32 / n as f32 ).cos() )
            .collect();
        let window_gain = window.iter().sum::<f32>() / 2.0;

        let nyquist = sample_rate as f32 / 2.0;
        let high = config.high_hz.min( nyquist );
        let low = config.low_hz.min( high * 0.5 );
        let bands = config.bands;

        let edges: Vec<f32> = ( 0..=bands )
            .map( |b| low * ( high / low ).powf( b as f32 / bands as f32 ) )
            .collect();

        let bin_hz = sample_rate as f32 / n as f32;
        let last_bin = n / 2;
        let band_bins = edges
            .windows( 2 )
            .map( |edge| {
                let lo = ( ( edge[ 0 ] / bin_hz ).ceil() as usize ).clamp( 1, last_bin );
                let hi = ( ( edge[ 1 ] / bin_hz ).ceil() as usize ).clamp( 1, last_bin + 1 );
                if hi > lo {
                    ( lo, hi )
                } else {
                    // Band narrower than a bin: use the bin nearest its centre
                    let centre = ( edge[ 0 ] * edge[ 1 ] ).sqrt();
                    let nearest = ( ( centre / bin_hz ).round() as usize ).clamp( 1, last_bin );
                    ( nearest, nearest + 1 )
                }
            })
            .collect();

        tracing::debug!(
            "Spectrum analyzer: {} bands, {}-point FFT at {} Hz ({:.0}-{:.0} Hz)",
            bands, n, sample_rate, low, high
        );

        Self {
            sample_rate,
            fft,
            window,
            window_gain,
            history: vec![ 0.0; n ],
            write: 0,
            filled: 0,
            since_last: 0,
            spectrum: vec![ Complex::new( 0.0, 0.0 ); n ],
            scratch: vec![ Complex::new( 0.0, 0.0 ); scratch_len ],
            magnitudes: vec![ 0.0; last_bin + 1 ],
            edges,
            band_bins,
            raw: vec![ 0.0; bands ],
            display: vec![ 0.0; bands ],
            top_db: -20.0,
            floor_db: -80.0,
            sequence: 0,
            config,
        }
    }


    pub fn config( &self ) -> &SpectrumConfig {
        &self.config
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn band_count( &self ) -> usize {
        self.config.bands
    }


    /// Band boundaries in Hz, `band_count() + 1` values.
    pub fn band_edges( &self ) -> &[f32] {
        &self.edges
    }


    /// Returns the band covering `frequency`, if any.
    pub fn band_index( &self, frequency: f32 ) -> Option<usize> {
        self.edges
            .windows( 2 )
            .position( |edge| frequency >= edge[ 0 ] && frequency < edge[ 1 ] )
    }


    /// Appends interleaved samples to the history without analyzing.
    pub fn accumulate( &mut self, samples: &[f32], channels: usize ) {
        let channels = channels.max( 1 );
        let len = self.history.len();
        let scale = 1.0 / channels as f32;

        for frame in samples.chunks_exact( channels ) {
            self.history[ self.write ] = frame.iter().sum::<f32>() * scale;
            self.write = ( self.write + 1 ) % len;
        }

        let frames = samples.len() / channels;
        self.filled = ( self.filled + frames ).min( len );
        self.since_last = self.since_last.saturating_add( frames );
    }


    /// Appends samples and analyzes if a full window and a hop are available.
    pub fn push( &mut self, samples: &[f32], channels: usize ) -> Option<SpectrumFrame> {
        self.accumulate( samples, channels );
        if self.filled < self.history.len() || self.since_last < self.config.min_hop {
            return None;
        }
        self.since_last = 0;
        Some( self.analyze() )
    }


    /// Runs one analysis over the current history.
    pub fn analyze( &mut self ) -> SpectrumFrame {
        let n = self.history.len();
        for i in 0..n {
            let sample = self.history[ ( self.write + i ) % n ];
            self.spectrum[ i ] = Complex::new( sample * self.window[ i ], 0.0 );
        }

        self.fft.process_with_scratch( &mut self.spectrum, &mut self.scratch );

        for ( magnitude, bin ) in self.magnitudes.iter_mut().zip( self.spectrum.iter() ) {
            *magnitude = bin.norm() / self.window_gain;
        }

        let peak_weight = self.config.peak_weight;
        for ( raw, &( lo, hi ) ) in self.raw.iter_mut().zip( self.band_bins.iter() ) {
            let bins = &self.magnitudes[ lo..hi ];
            let peak = bins.iter().copied().fold( 0.0_f32, f32::max );
            let rms = ( bins.iter().map( |m| m * m ).sum::<f32>() / bins.len() as f32 ).sqrt();
            *raw = peak_weight * peak + ( 1.0 - peak_weight ) * rms;
        }

        self.scale();
        self.sequence += 1;

        SpectrumFrame {
            bands: self.display.clone(),
            sequence: self.sequence,
        }
    }


    fn scale( &mut self ) {
        let gamma = self.config.gamma;
        let release = self.config.release;

        match self.config.scaling {
            Scaling::Logarithmic { k } => {
                let denom = ( 1.0 + k ).log10();
                for raw in self.raw.iter_mut() {
                    *raw = ( 1.0 + k * raw.max( 0.0 ) ).log10() / denom;
                }
            }
            Scaling::Adaptive { attack, release, min_range_db } => {
                let db = |v: f32| ( 20.0 * v.max( 1e-9 ).log10() ).max( SILENCE_DB );
                let loudest = self.raw.iter().map( |&v| db( v ) ).fold( SILENCE_DB, f32::max );
                let quietest = self.raw.iter().map( |&v| db( v ) ).fold( 0.0, f32::min );

                let top_rate = if loudest > self.top_db { attack } else { release };
                self.top_db += ( loudest - self.top_db ) * top_rate;
                let floor_rate = if quietest < self.floor_db { attack } else { release };
                self.floor_db += ( quietest - self.floor_db ) * floor_rate;

                let range = ( self.top_db - self.floor_db ).max( min_range_db );
                let bottom = self.top_db - range;
                for raw in self.raw.iter_mut() {
                    *raw = ( db( *raw ) - bottom ) / range;
                }
            }
        }

        for ( shown, &raw ) in self.display.iter_mut().zip( self.raw.iter() ) {
            let mut level = if raw.is_finite() { raw.clamp( 0.0, 1.0 ) } else { 0.0 };
            if gamma != 1.0 {
                level = level.powf( gamma );
            }
            *shown = if level >= *shown {
                level
            } else {
                *shown + ( level - *shown ) * release
            };
            *shown = shown.clamp( 0.0, 1.0 );
        }
    }


    /// The most recent frame, if any analysis has run.
    pub fn latest( &self ) -> Option<SpectrumFrame> {
        ( self.sequence > 0 ).then( || SpectrumFrame {
            bands: self.display.clone(),
            sequence: self.sequence,
        })
    }


    /// Forgets history and smoothing state.
    pub fn reset( &mut self ) {
        self.history.fill( 0.0 );
        self.write = 0;
        self.filled = 0;
        self.since_last = 0;
        self.display.fill( 0.0 );
        self.top_db = -20.0;
        self.floor_db = -80.0;
    }
}


/// Analyzer stage of the processing chain.
///
/// Forwards samples untouched and publishes [`PlayerEvent::Spectrum`] frames.
pub struct SpectrumTap<S> {
    source: S,
    analyzer: Arc<Mutex<SpectrumAnalyzer>>,
    events: Arc<EventHub>,
    skip_next: bool,
}


impl<S: SampleSource> SpectrumTap<S> {
    pub fn new( source: S, analyzer: Arc<Mutex<SpectrumAnalyzer>>, events: Arc<EventHub> ) -> Self {
        Self { source, analyzer, events, skip_next: false }
    }


    fn observe( &mut self, block: &[f32] ) {
        let channels = self.source.channels().max( 1 );

        let mut analyzer = match self.analyzer.try_lock() {
            Ok( guard ) => guard,
            Err( TryLockError::Poisoned( poisoned ) ) => poisoned.into_inner(),
            Err( TryLockError::WouldBlock ) => {
                tracing::trace!( "Spectrum analyzer busy, skipping block" );
                return;
            }
        };

        if self.skip_next {
            self.skip_next = false;
            analyzer.accumulate( block, channels );
            return;
        }

        let started = Instant::now();
        let result = panic::catch_unwind( AssertUnwindSafe( || analyzer.push( block, channels ) ) );
        let elapsed = started.elapsed();

        let frame = match result {
            Ok( frame ) => frame,
            Err( _ ) => {
                tracing::warn!( "Spectrum analysis panicked, resetting analyzer" );
                analyzer.reset();
                None
            }
        };
        drop( analyzer );

        let frames = block.len() / channels;
        let budget = Duration::from_secs_f64( frames as f64 / self.source.sample_rate().max( 1 ) as f64 );
        if elapsed > budget {
            tracing::debug!( "Spectrum analysis took {:?} for a {:?} block, skipping next", elapsed, budget );
            self.skip_next = true;
        }

        if let Some( frame ) = frame {
            self.events.emit_realtime( &PlayerEvent::Spectrum( frame ) );
        }
    }
}


impl<S: SampleSource> SampleSource for SpectrumTap<S> {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        let n = self.source.read( buf );
        if n > 0 {
            self.observe( &buf[ ..n ] );
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


/// Observer-side holder for spectrum frames of a known band count.
///
/// Frames of any other length are counted and ignored.
pub struct SpectrumSink {
    expected: usize,
    values: Mutex<Vec<f32>>,
    accepted: AtomicU64,
    ignored: AtomicU64,
}


impl SpectrumSink {
    pub fn new( expected: usize ) -> Self {
        Self {
            expected,
            values: Mutex::new( vec![ 0.0; expected ] ),
            accepted: AtomicU64::new( 0 ),
            ignored: AtomicU64::new( 0 ),
        }
    }


    /// Stores the frame's values if its length matches. Returns whether it did.
    pub fn accept( &self, frame: &SpectrumFrame ) -> bool {
        if frame.len() != self.expected {
            self.ignored.fetch_add( 1, Ordering::Relaxed );
            return false;
        }
        self.values
            .lock()
            .unwrap_or_else( PoisonError::into_inner )
            .copy_from_slice( frame.bands() );
        self.accepted.fetch_add( 1, Ordering::Relaxed );
        true
    }


    pub fn expected( &self ) -> usize {
        self.expected
    }


    /// Latest accepted values; zeros before the first frame.
    pub fn values( &self ) -> Vec<f32> {
        self.values.lock().unwrap_or_else( PoisonError::into_inner ).clone()
    }


    pub fn accepted( &self ) -> u64 {
        self.accepted.load( Ordering::Relaxed )
    }


    pub fn ignored( &self ) -> u64 {
        self.ignored.load( Ordering::Relaxed )
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use crate::buffer::MemorySource;
    use crate::equalizer::{ Equalizer, EqualizerProfile };


    const RATE: u32 = 44100;


    fn sine( frequency: f32, amplitude: f32, frames: usize ) -> Vec<f32> {
        let step = 2.0 * std::f32::consts::PI * frequency / RATE as f32;
        ( 0..frames ).map( |i| amplitude * ( step * i as f32 ).sin() ).collect()
    }


    fn last_frame( analyzer: &mut SpectrumAnalyzer, samples: &[f32] ) -> SpectrumFrame {
        let mut last = None;
        for block in samples.chunks( 512 ) {
            if let Some( frame ) = analyzer.push( block, 1 ) {
                last = Some( frame );
            }
        }
        last.expect( "no frame produced" )
    }


    #[test]
    fn test_config_normalized() {
        let config = SpectrumConfig {
            bands: 0,
            fft_size: 1000,
            gamma: f32::NAN,
            release: 7.0,
            ..SpectrumConfig::default()
        }.normalized();

        assert_eq!( config.bands, 1 );
        assert_eq!( config.fft_size, 1024 );
        assert_eq!( config.gamma, 1.0 );
        assert_eq!( config.release, 1.0 );

        assert_eq!( SpectrumConfig { fft_size: 16, ..SpectrumConfig::default() }.normalized().fft_size, MIN_FFT_SIZE );
    }


    #[test]
    fn test_frame_always_has_configured_band_count() {
        for bands in [ 1, 7, 32, 100 ] {
            let mut analyzer = SpectrumAnalyzer::new( SpectrumConfig { bands, ..SpectrumConfig::default() }, RATE );
            let frame = last_frame( &mut analyzer, &sine( 440.0, 0.5, 8192 ) );
            assert_eq!( frame.len(), bands );
            assert!( frame.bands().iter().all( |v| ( 0.0..=1.0 ).contains( v ) ) );
        }
    }


    #[test]
    fn test_no_frame_before_window_fills() {
        let mut analyzer = SpectrumAnalyzer::new( SpectrumConfig::default(), RATE );
        assert!( analyzer.push( &[ 0.1; 4000 ], 1 ).is_none() );
        assert!( analyzer.latest().is_none() );
        assert!( analyzer.push( &[ 0.1; 600 ], 1 ).is_some() );
        // Hop not reached yet
        assert!( analyzer.push( &[ 0.1; 100 ], 1 ).is_none() );
    }


    #[test]
    fn test_silence_is_zero() {
        let mut analyzer = SpectrumAnalyzer::new( SpectrumConfig::default(), RATE );
        let frame = last_frame( &mut analyzer, &vec![ 0.0; 8192 ] );
        assert!( frame.bands().iter().all( |&v| v == 0.0 ) );
    }


    #[test]
    fn test_tone_lands_in_its_band() {
        let mut analyzer = SpectrumAnalyzer::new( SpectrumConfig::default(), RATE );
        let band = analyzer.band_index( 1100.0 ).unwrap();
        let frame = last_frame( &mut analyzer, &sine( 1100.0, 0.5, 16384 ) );

        let loudest = frame.bands()
            .iter()
            .enumerate()
            .fold( ( 0, 0.0 ), |best, ( i, &v )| if v > best.1 { ( i, v ) } else { best } )
            .0;
        assert_eq!( loudest, band );
        assert!( frame.bands()[ 0 ] < 0.1 );
    }


    #[test]
    fn test_release_smoothing() {
        let mut analyzer = SpectrumAnalyzer::new( SpectrumConfig::default(), RATE );
        let band = analyzer.band_index( 1100.0 ).unwrap();
        let loud = last_frame( &mut analyzer, &sine( 1100.0, 0.5, 8192 ) ).bands()[ band ];

        // Replace the whole window with silence in one go
        let after = analyzer.push( &vec![ 0.0; 4096 ], 1 ).unwrap().bands()[ band ];
        assert!( after > 0.0 );
        assert!( ( after - loud * 0.65 ).abs() < 1e-4 );
    }


    #[test]
    fn test_adaptive_scaling_in_range() {
        let config = SpectrumConfig {
            scaling: Scaling::Adaptive { attack: 0.6, release: 0.1, min_range_db: 40.0 },
            gamma: 0.8,
            ..SpectrumConfig::default()
        };
        let mut analyzer = SpectrumAnalyzer::new( config, RATE );

        let mut samples = sine( 200.0, 0.9, 8192 );
        samples.extend( sine( 5000.0, 0.01, 8192 ) );
        for block in samples.chunks( 700 ) {
            if let Some( frame ) = analyzer.push( block, 1 ) {
                assert!( frame.bands().iter().all( |v| ( 0.0..=1.0 ).contains( v ) ) );
            }
        }
    }


    #[test]
    fn test_boost_raises_band_level() {
        let band_level = |profile: EqualizerProfile| {
            let source = MemorySource::sine( 1000.0, 0.1, RATE, RATE as usize * 2 );
            let analyzer = Arc::new( Mutex::new( SpectrumAnalyzer::new( SpectrumConfig::default(), RATE ) ) );
            let mut tap = SpectrumTap::new(
                Equalizer::new( source, &profile ),
                Arc::clone( &analyzer ),
                Arc::new( EventHub::new() ),
            );

            let mut buf = [ 0.0; 512 ];
            while tap.read( &mut buf ) > 0 {}

            let analyzer = analyzer.lock().unwrap();
            let band = analyzer.band_index( 1000.0 ).unwrap();
            analyzer.latest().unwrap().bands()[ band ]
        };

        let flat = band_level( EqualizerProfile::flat() );
        let boosted = band_level( EqualizerProfile::flat().with_gain( 5, 12.0 ) );
        assert!( boosted > flat + 0.1, "boosted {} vs flat {}", boosted, flat );
    }


    #[test]
    fn test_tap_publishes_frames_and_forwards_samples() {
        let events = Arc::new( EventHub::new() );
        let sink = Arc::new( SpectrumSink::new( DEFAULT_BANDS ) );
        let wrong = Arc::new( SpectrumSink::new( DEFAULT_BANDS + 1 ) );
        {
            let sink = Arc::clone( &sink );
            let wrong = Arc::clone( &wrong );
            events.subscribe( move |event| {
                if let PlayerEvent::Spectrum( frame ) = event {
                    sink.accept( frame );
                    wrong.accept( frame );
                }
            });
        }

        let input = sine( 300.0, 0.3, 8192 );
        let analyzer = Arc::new( Mutex::new( SpectrumAnalyzer::new( SpectrumConfig::default(), RATE ) ) );
        let mut tap = SpectrumTap::new( MemorySource::new( input.clone(), RATE, 1 ), analyzer, events );

        let mut output = Vec::new();
        let mut buf = [ 0.0; 512 ];
        loop {
            let n = tap.read( &mut buf );
            if n == 0 {
                break;
            }
            output.extend_from_slice( &buf[ ..n ] );
        }

        assert_eq!( output, input );
        assert!( sink.accepted() > 0 );
        assert_eq!( wrong.accepted(), 0 );
        assert_eq!( wrong.ignored(), sink.accepted() );
    }


    #[test]
    fn test_tap_skips_when_analyzer_busy() {
        let analyzer = Arc::new( Mutex::new( SpectrumAnalyzer::new( SpectrumConfig::default(), RATE ) ) );
        let mut tap = SpectrumTap::new(
            MemorySource::sine( 500.0, 0.5, RATE, 8192 ),
            Arc::clone( &analyzer ),
            Arc::new( EventHub::new() ),
        );

        let held = analyzer.lock().unwrap();
        let mut buf = [ 0.0; 512 ];
        while tap.read( &mut buf ) > 0 {}
        assert!( held.latest().is_none() );
    }
}
