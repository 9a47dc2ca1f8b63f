//! Pull stages and the prefetch queue
//!
//! The decode worker pushes samples into a [`PrefetchBuffer`]; the output
//! device pulls them back out through a chain of [`SampleSource`] stages
//! whose head is a [`TrackReader`].

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex, PoisonError };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::time::Duration;


/// A pull-based stage of the processing chain.
///
/// Implementations run on the real-time output thread: no I/O, no blocking
/// locks held for longer than a block.
pub trait SampleSource: Send {
    /// Fills `buf` with interleaved samples, returning how many were produced.
    ///
    /// Zero means the source is exhausted.
    fn read( &mut self, buf: &mut [f32] ) -> usize;

    fn sample_rate( &self ) -> u32;

    fn channels( &self ) -> usize;
}


impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        ( **self ).read( buf )
    }


    fn sample_rate( &self ) -> u32 {
        ( **self ).sample_rate()
    }


    fn channels( &self ) -> usize {
        ( **self ).channels()
    }
}


/// Bounded sample queue shared between the decode worker and the output thread.
pub struct PrefetchBuffer {
    queue: Mutex<VecDeque<f32>>,
    capacity: usize,
    sample_rate: u32,
    channels: usize,
    /// Set by the worker once the decoder has nothing more to give.
    finished: AtomicBool,
    /// Set by the reader once it has handed out the last sample after `finished`.
    drained: AtomicBool,
    /// Frames handed to the output, offset by the last seek target.
    frames_played: AtomicU64,
}


impl PrefetchBuffer {
    /// Creates an empty buffer holding at most `capacity` samples.
    pub fn new( capacity: usize, sample_rate: u32, channels: usize ) -> Self {
        Self {
            queue: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            sample_rate,
            channels,
            finished: AtomicBool::new( false ),
            drained: AtomicBool::new( false ),
            frames_played: AtomicU64::new( 0 ),
        }
    }


    /// Pushes samples, returning how many fit.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else( PoisonError::into_inner );
        let available = self.capacity.saturating_sub( queue.len() );
        // Keep frames whole so channels never shift
        let to_push = samples.len().min( available - available % self.channels );
        queue.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Pops up to `out.len()` samples, returning how many were written.
    pub fn pop( &self, out: &mut [f32] ) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else( PoisonError::into_inner );
        let n = out.len().min( queue.len() );
        for ( slot, sample ) in out.iter_mut().zip( queue.drain( ..n ) ) {
            *slot = sample;
        }
        drop( queue );

        self.frames_played.fetch_add( ( n / self.channels ) as u64, Ordering::Relaxed );
        n
    }


    /// Returns the number of queued samples.
    pub fn len( &self ) -> usize {
        self.queue.lock().unwrap_or_else( PoisonError::into_inner ).len()
    }


    /// Returns true if nothing is queued.
    pub fn is_empty( &self ) -> bool {
        self.len() == 0
    }


    /// Drops all queued samples and resets the end-of-stream flags.
    pub fn clear( &self ) {
        self.queue.lock().unwrap_or_else( PoisonError::into_inner ).clear();
        self.finished.store( false, Ordering::Release );
        self.drained.store( false, Ordering::Release );
    }


    /// Marks the stream as fully decoded.
    pub fn finish( &self ) {
        self.finished.store( true, Ordering::Release );
    }


    pub fn is_finished( &self ) -> bool {
        self.finished.load( Ordering::Acquire )
    }


    /// True once the reader has consumed everything after `finish`.
    pub fn is_drained( &self ) -> bool {
        self.drained.load( Ordering::Acquire )
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> usize {
        self.channels
    }


    /// Playback position derived from the frames handed to the output.
    pub fn position( &self ) -> Duration {
        let frames = self.frames_played.load( Ordering::Relaxed );
        Duration::from_secs_f64( frames as f64 / self.sample_rate as f64 )
    }


    /// Resets the position clock after a seek.
    pub fn set_position( &self, position: Duration ) {
        let frames = ( position.as_secs_f64() * self.sample_rate as f64 ) as u64;
        self.frames_played.store( frames, Ordering::Relaxed );
    }
}


/// Head of the processing chain: reads decoded samples out of the prefetch queue.
///
/// An underrun yields silence so that only a real end of stream returns zero.
pub struct TrackReader {
    buffer: Arc<PrefetchBuffer>,
}


impl TrackReader {
    pub fn new( buffer: Arc<PrefetchBuffer> ) -> Self {
        Self { buffer }
    }
}


impl SampleSource for TrackReader {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        let whole = buf.len() - buf.len() % self.buffer.channels;
        let buf = &mut buf[ ..whole ];

        // Check before popping so samples pushed right before `finish` are not lost
        let finished = self.buffer.is_finished();
        let n = self.buffer.pop( buf );

        if n == buf.len() {
            return n;
        }

        if finished {
            if n == 0 {
                self.buffer.drained.store( true, Ordering::Release );
            }
            return n;
        }

        tracing::trace!( "Prefetch underrun: {} of {} samples", n, buf.len() );
        buf[ n.. ].fill( 0.0 );
        buf.len()
    }


    fn sample_rate( &self ) -> u32 {
        self.buffer.sample_rate
    }


    fn channels( &self ) -> usize {
        self.buffer.channels
    }
}


/// In-memory source for unit tests.
#[cfg( test )]
pub( crate ) struct MemorySource {
    samples: Vec<f32>,
    offset: usize,
    sample_rate: u32,
    channels: usize,
}


#[cfg( test )]
impl MemorySource {
    pub( crate ) fn new( samples: Vec<f32>, sample_rate: u32, channels: usize ) -> Self {
        Self { samples, offset: 0, sample_rate, channels }
    }


    /// A mono sine tone.
    pub( crate ) fn sine( frequency: f32, amplitude: f32, sample_rate: u32, frames: usize ) -> Self {
        let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
        let samples = ( 0..frames ).map( |i| amplitude * ( step * i as f32 ).sin() ).collect();
        Self::new( samples, sample_rate, 1 )
    }
}


#[cfg( test )]
impl SampleSource for MemorySource {
    fn read( &mut self, buf: &mut [f32] ) -> usize {
        let n = buf.len().min( self.samples.len() - self.offset );
        buf[ ..n ].copy_from_slice( &self.samples[ self.offset..self.offset + n ] );
        self.offset += n;
        n
    }


    fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    fn channels( &self ) -> usize {
        self.channels
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_push_respects_capacity_in_whole_frames() {
        let buffer = PrefetchBuffer::new( 5, 48000, 2 );
        assert_eq!( buffer.push( &[ 1.0; 8 ] ), 4 );
        assert_eq!( buffer.len(), 4 );
        assert_eq!( buffer.push( &[ 1.0; 2 ] ), 0 );
    }


    #[test]
    fn test_pop_advances_position() {
        let buffer = PrefetchBuffer::new( 100, 10, 2 );
        buffer.push( &[ 0.5; 40 ] );

        let mut out = [ 0.0; 20 ];
        assert_eq!( buffer.pop( &mut out ), 20 );
        assert_eq!( buffer.position(), Duration::from_secs( 1 ) );
    }


    #[test]
    fn test_reader_fills_underrun_with_silence() {
        let buffer = Arc::new( PrefetchBuffer::new( 100, 44100, 1 ) );
        buffer.push( &[ 0.25; 3 ] );
        let mut reader = TrackReader::new( Arc::clone( &buffer ) );

        let mut out = [ 1.0; 6 ];
        assert_eq!( reader.read( &mut out ), 6 );
        assert_eq!( out, [ 0.25, 0.25, 0.25, 0.0, 0.0, 0.0 ] );
        assert!( !buffer.is_drained() );
    }


    #[test]
    fn test_reader_signals_end_after_finish() {
        let buffer = Arc::new( PrefetchBuffer::new( 100, 44100, 1 ) );
        buffer.push( &[ 0.25; 3 ] );
        buffer.finish();
        let mut reader = TrackReader::new( Arc::clone( &buffer ) );

        let mut out = [ 0.0; 6 ];
        assert_eq!( reader.read( &mut out ), 3 );
        assert!( !buffer.is_drained() );
        assert_eq!( reader.read( &mut out ), 0 );
        assert!( buffer.is_drained() );
    }


    #[test]
    fn test_clear_resets_end_flags() {
        let buffer = PrefetchBuffer::new( 10, 44100, 1 );
        buffer.push( &[ 0.1; 4 ] );
        buffer.finish();
        buffer.clear();
        assert!( buffer.is_empty() );
        assert!( !buffer.is_finished() );
    }
}
