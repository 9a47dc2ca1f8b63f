//! Processing graph lifecycle
//!
//! A graph is one file's worth of playback: an open [`Stream`], the decode
//! worker feeding a [`PrefetchBuffer`], the processing chain
//! `TrackReader → Equalizer → Volume → SpectrumTap`, and the output binding
//! pulling from the chain.
//!
//! Graphs are built off the engine lock ([`build`]), attached to the output
//! under it ([`PendingGraph::start`]) and torn down when the [`LiveGraph`]
//! is dropped.

use std::path::{ Path, PathBuf };
use std::sync::{ mpsc, Arc, Mutex, OnceLock, PoisonError };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread;
use std::time::Duration;

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use tokio_util::sync::CancellationToken;

use crate::buffer::{ PrefetchBuffer, SampleSource, TrackReader };
use crate::config::EngineConfig;
use crate::decoder::{ DecoderError, Stream };
use crate::equalizer::{ Equalizer, EqualizerControl, EqualizerProfile };
use crate::events::{ EventHub, PlayerEvent, StopReason };
use crate::output::{ OutputBackend, OutputBinding, OutputConfig };
use crate::player::{ PlaybackState, PlayerError, SharedState };
use crate::spectrum::{ SpectrumAnalyzer, SpectrumFrame, SpectrumTap };
use crate::volume::{ Volume, VolumeControl };


/// Frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;


/// Converts planar samples back to interleaved format, appending to `out`.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave_into( channels: &[Vec<f32>], out: &mut Vec<f32> ) {
    let Some( first ) = channels.first() else {
        return;
    };
    out.reserve( first.len() * channels.len() );
    for f in 0..first.len() {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
}


/// Converts decoded audio to the output rate.
struct Resampling {
    resampler: FastFixedOut<f32>,
    /// Planar input waiting for a full chunk
    pending: Vec<Vec<f32>>,
}


impl Resampling {
    fn new( from: u32, to: u32, channels: usize ) -> Result<Self, PlayerError> {
        let resampler = FastFixedOut::<f32>::new(
            to as f64 / from as f64,
            2.0,
            PolynomialDegree::Cubic,
            RESAMPLE_CHUNK,
            channels,
        ).map_err( |e| PlayerError::Resampler( e.to_string() ) )?;

        tracing::info!( "Resampling {} Hz to {} Hz", from, to );

        Ok( Self {
            resampler,
            pending: ( 0..channels ).map( |_| Vec::new() ).collect(),
        })
    }


    fn process( &mut self, interleaved: &[f32], out: &mut Vec<f32> ) {
        let channels = self.pending.len();
        for frame in interleaved.chunks_exact( channels ) {
            for ( pending, &sample ) in self.pending.iter_mut().zip( frame ) {
                pending.push( sample );
            }
        }

        while self.pending[ 0 ].len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self.pending
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();

            match self.resampler.process( &chunk, None ) {
                Ok( resampled ) => interleave_into( &resampled, out ),
                Err( e ) => {
                    tracing::error!( "Resample error: {}", e );
                    break;
                }
            }
        }
    }


    /// Pushes out whatever is left at end of stream.
    fn flush( &mut self, out: &mut Vec<f32> ) {
        if self.pending[ 0 ].is_empty() {
            return;
        }
        match self.resampler.process_partial( Some( self.pending.as_slice() ), None ) {
            Ok( resampled ) => interleave_into( &resampled, out ),
            Err( e ) => tracing::error!( "Final resample error: {}", e ),
        }
        for ch in self.pending.iter_mut() {
            ch.clear();
        }
    }


    fn reset( &mut self ) {
        self.resampler.reset();
        for ch in self.pending.iter_mut() {
            ch.clear();
        }
    }
}


/// Pushes all of `samples`, waiting for room unless told to stop.
fn push_all( prefetch: &PrefetchBuffer, samples: &[f32], stop: &AtomicBool ) {
    let mut offset = 0;
    while offset < samples.len() && !stop.load( Ordering::Relaxed ) {
        let pushed = prefetch.push( &samples[ offset.. ] );
        offset += pushed;
        if pushed == 0 {
            // Buffer full, wait a bit
            thread::sleep( Duration::from_millis( 5 ) );
        }
    }
}


/// Decoder side of a graph, owned by the decode worker once started.
struct Decoding {
    stream: Stream,
    resampler: Option<Resampling>,
    block: Vec<f32>,
    out: Vec<f32>,
}


impl Decoding {
    /// Decodes one block into the prefetch buffer. Returns false at end of stream.
    fn decode_block( &mut self, prefetch: &PrefetchBuffer, stop: &AtomicBool ) -> Result<bool, DecoderError> {
        let n = self.stream.read( &mut self.block )?;

        if n == 0 {
            if let Some( resampling ) = &mut self.resampler {
                self.out.clear();
                resampling.flush( &mut self.out );
                push_all( prefetch, &self.out, stop );
            }
            return Ok( false );
        }

        let samples = match &mut self.resampler {
            Some( resampling ) => {
                self.out.clear();
                resampling.process( &self.block[ ..n ], &mut self.out );
                &self.out[ .. ]
            }
            None => &self.block[ ..n ],
        };
        push_all( prefetch, samples, stop );
        Ok( true )
    }


    /// Repositions the stream and discards everything queued.
    fn seek( &mut self, position: Duration, prefetch: &PrefetchBuffer ) -> Result<Duration, DecoderError> {
        self.stream.set_position( position )?;
        if let Some( resampling ) = &mut self.resampler {
            resampling.reset();
        }
        prefetch.clear();

        let actual = self.stream.position();
        prefetch.set_position( actual );
        Ok( actual )
    }
}


/// Requests handled by the decode worker between blocks.
pub( crate ) enum WorkerCommand {
    Seek {
        position: Duration,
        reply: mpsc::Sender<Result<Duration, DecoderError>>,
    },
}


/// Reply slot for a seek handed to the decode worker.
pub( crate ) type PendingSeek = mpsc::Receiver<Result<Duration, DecoderError>>;


/// Waits for the decode worker to answer a seek.
pub( crate ) fn await_seek( pending: PendingSeek, timeout: Duration ) -> Result<Duration, PlayerError> {
    match pending.recv_timeout( timeout ) {
        Ok( result ) => Ok( result? ),
        Err( mpsc::RecvTimeoutError::Timeout ) => Err( PlayerError::SeekTimeout ),
        Err( mpsc::RecvTimeoutError::Disconnected ) => Err( PlayerError::NoTrack ),
    }
}


/// Raises the one `Stopped` notification a graph may produce.
pub( crate ) struct GraphEnd {
    raised: AtomicBool,
    outcome: OnceLock<PlaybackState>,
    path: PathBuf,
    shared: Arc<SharedState>,
}


impl GraphEnd {
    fn new( path: PathBuf, shared: Arc<SharedState> ) -> Self {
        Self { raised: AtomicBool::new( false ), outcome: OnceLock::new(), path, shared }
    }


    /// Moves the engine to the matching state and notifies subscribers.
    ///
    /// Only the first call per graph has any effect.
    pub( crate ) fn raise( &self, reason: StopReason ) -> bool {
        if self.raised.swap( true, Ordering::AcqRel ) {
            return false;
        }

        let state = match reason {
            StopReason::EndOfStream => PlaybackState::EndOfStream,
            StopReason::Requested | StopReason::Error( _ ) => PlaybackState::Stopped,
        };
        tracing::info!( "Stopped {:?}: {:?}", self.path, reason );
        let _ = self.outcome.set( state );

        self.shared.set( state );
        self.shared.events().emit( &PlayerEvent::Stopped {
            path: self.path.clone(),
            reason,
        });
        true
    }


    /// Suppresses any later notification.
    pub( crate ) fn dismiss( &self ) {
        self.raised.store( true, Ordering::Release );
    }


    /// The state the graph ended in, if it has.
    pub( crate ) fn outcome( &self ) -> Option<PlaybackState> {
        self.outcome.get().copied()
    }
}


/// The decode worker loop.
struct DecodeWorker {
    decoding: Decoding,
    prefetch: Arc<PrefetchBuffer>,
    stop: Arc<AtomicBool>,
    commands: mpsc::Receiver<WorkerCommand>,
    /// Queue length in samples above which the worker idles
    decode_ahead: usize,
    end: Arc<GraphEnd>,
    failure: Option<String>,
}


impl DecodeWorker {
    fn run( mut self ) {
        loop {
            if self.stop.load( Ordering::Relaxed ) {
                tracing::debug!( "Decode worker: stop signal received" );
                break;
            }

            self.handle_commands();

            // Decoder done: wait for the output to play out what is queued
            if self.prefetch.is_finished() {
                if self.prefetch.is_drained() {
                    let reason = match self.failure.take() {
                        Some( message ) => StopReason::Error( message ),
                        None => StopReason::EndOfStream,
                    };
                    self.end.raise( reason );
                    break;
                }
                thread::sleep( Duration::from_millis( 10 ) );
                continue;
            }

            if self.prefetch.len() > self.decode_ahead {
                thread::sleep( Duration::from_millis( 5 ) );
                continue;
            }

            match self.decoding.decode_block( &self.prefetch, &self.stop ) {
                Ok( true ) => {}
                Ok( false ) => {
                    tracing::info!( "Decode worker: reached end of {:?}", self.decoding.stream.path() );
                    self.prefetch.finish();
                }
                Err( e ) => {
                    tracing::error!( "Decode error in {:?}: {}", self.decoding.stream.path(), e );
                    self.failure = Some( e.to_string() );
                    self.prefetch.finish();
                }
            }
        }

        tracing::debug!( "Decode worker: exiting" );
    }


    fn handle_commands( &mut self ) {
        while let Ok( command ) = self.commands.try_recv() {
            match command {
                WorkerCommand::Seek { position, reply } => {
                    let result = self.decoding.seek( position, &self.prefetch );
                    if result.is_ok() {
                        self.failure = None;
                    }
                    let _ = reply.send( result );
                }
            }
        }
    }
}


/// Everything a build needs, owned so it can move to a blocking thread.
pub( crate ) struct BuildRequest {
    pub path: PathBuf,
    pub volume: f32,
    pub profile: EqualizerProfile,
    pub config: EngineConfig,
    pub backend: Arc<dyn OutputBackend>,
    pub events: Arc<EventHub>,
}


/// A built graph that is not attached to the output yet.
///
/// Dropping it releases the stream and every stage.
pub( crate ) struct PendingGraph {
    path: PathBuf,
    duration: Option<Duration>,
    decoding: Decoding,
    prefetch: Arc<PrefetchBuffer>,
    chain: Box<dyn SampleSource>,
    equalizer: EqualizerControl,
    volume: VolumeControl,
    analyzer: Arc<Mutex<SpectrumAnalyzer>>,
    output: OutputConfig,
    decode_ahead: usize,
}


fn checkpoint( cancel: &CancellationToken, path: &Path, stage: &str ) -> Result<(), PlayerError> {
    if cancel.is_cancelled() {
        tracing::debug!( "Load of {:?} cancelled {}", path, stage );
        return Err( PlayerError::Cancelled );
    }
    Ok(())
}


/// Opens the file and assembles a graph around it.
///
/// Blocking: runs file I/O and device negotiation. Cancellation is checked
/// between stages; a cancelled build releases everything it opened.
pub( crate ) fn build( request: BuildRequest, cancel: &CancellationToken ) -> Result<PendingGraph, PlayerError> {
    let BuildRequest { path, volume, profile, config, backend, events } = request;

    checkpoint( cancel, &path, "before open" )?;
    let stream = Stream::open( &path )?;
    checkpoint( cancel, &path, "after open" )?;

    let channels = stream.channels();
    let output = backend.negotiate( stream.sample_rate(), channels as u16 )?;
    checkpoint( cancel, &path, "after negotiation" )?;

    let rate = output.sample_rate;
    let resampler = if stream.sample_rate() != rate {
        Some( Resampling::new( stream.sample_rate(), rate, channels )? )
    } else {
        None
    };

    // Room for the configured prefetch and a few resampled blocks
    let ratio = rate as f64 / stream.sample_rate() as f64;
    let block_out = ( ( config.decode_block_frames.max( RESAMPLE_CHUNK ) as f64 * ratio ).ceil() as usize + 1 ) * channels;
    let capacity = EngineConfig::samples_for( config.prefetch, rate, channels ).max( block_out * 4 );
    let decode_ahead = EngineConfig::samples_for( config.decode_ahead, rate, channels );

    let prefetch = Arc::new( PrefetchBuffer::new( capacity, rate, channels ) );

    let equalizer = Equalizer::new( TrackReader::new( Arc::clone( &prefetch ) ), &profile );
    let equalizer_control = equalizer.control();
    let volume = Volume::new( equalizer, volume );
    let volume_control = volume.control();
    let analyzer = Arc::new( Mutex::new( SpectrumAnalyzer::new( config.spectrum.clone(), rate ) ) );
    let tap = SpectrumTap::new( volume, Arc::clone( &analyzer ), events );

    let mut decoding = Decoding {
        stream,
        resampler,
        block: vec![ 0.0; config.decode_block_frames.max( 1 ) * channels ],
        out: Vec::new(),
    };

    // Prime the buffer; a file that fails here fails the load
    let primed = decoding.decode_block( &prefetch, &AtomicBool::new( false ) )?;
    if !primed {
        prefetch.finish();
    }
    checkpoint( cancel, &path, "after first read" )?;

    Ok( PendingGraph {
        duration: decoding.stream.duration(),
        path,
        decoding,
        prefetch,
        chain: Box::new( tap ),
        equalizer: equalizer_control,
        volume: volume_control,
        analyzer,
        output,
        decode_ahead,
    })
}


impl PendingGraph {
    pub( crate ) fn path( &self ) -> &Path {
        &self.path
    }


    /// Brings the stages up to date with settings changed during the build.
    pub( crate ) fn refresh( &self, profile: &EqualizerProfile, volume: f32 ) {
        self.equalizer.update_profile( profile );
        self.volume.set( volume );
    }


    /// Attaches the chain to the output and starts the decode worker.
    ///
    /// The output stays paused until [`LiveGraph::resume`].
    pub( crate ) fn start(
        self,
        backend: &dyn OutputBackend,
        shared: Arc<SharedState>,
    ) -> Result<LiveGraph, PlayerError> {
        let PendingGraph {
            path,
            duration,
            decoding,
            prefetch,
            chain,
            equalizer,
            volume,
            analyzer,
            output,
            decode_ahead,
        } = self;

        let binding = backend.open( &output, chain )?;

        let stop = Arc::new( AtomicBool::new( false ) );
        let end = Arc::new( GraphEnd::new( path.clone(), shared ) );
        let ( commands, receiver ) = mpsc::channel();

        let worker = DecodeWorker {
            decoding,
            prefetch: Arc::clone( &prefetch ),
            stop: Arc::clone( &stop ),
            commands: receiver,
            decode_ahead,
            end: Arc::clone( &end ),
            failure: None,
        };
        let handle = thread::Builder::new()
            .name( "tonearm-decode".to_string() )
            .spawn( move || worker.run() )
            .map_err( PlayerError::Worker )?;

        let graph = LiveGraph {
            path,
            duration,
            prefetch,
            equalizer,
            volume,
            analyzer,
            binding: Some( binding ),
            worker: Some( handle ),
            stop,
            commands,
            end,
            paused: AtomicBool::new( true ),
        };

        tracing::info!( "Attached {:?} to {} output", graph.path, output.api );
        Ok( graph )
    }
}


/// A graph attached to the output.
pub( crate ) struct LiveGraph {
    path: PathBuf,
    duration: Option<Duration>,
    prefetch: Arc<PrefetchBuffer>,
    equalizer: EqualizerControl,
    volume: VolumeControl,
    analyzer: Arc<Mutex<SpectrumAnalyzer>>,
    binding: Option<Box<dyn OutputBinding>>,
    worker: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    commands: mpsc::Sender<WorkerCommand>,
    end: Arc<GraphEnd>,
    paused: AtomicBool,
}


impl LiveGraph {
    pub( crate ) fn path( &self ) -> &Path {
        &self.path
    }


    pub( crate ) fn duration( &self ) -> Option<Duration> {
        self.duration
    }


    pub( crate ) fn position( &self ) -> Duration {
        let position = self.prefetch.position();
        match self.duration {
            Some( duration ) => position.min( duration ),
            None => position,
        }
    }


    pub( crate ) fn pause( &self ) -> Result<(), PlayerError> {
        if let Some( binding ) = &self.binding {
            binding.pause()?;
        }
        self.paused.store( true, Ordering::Relaxed );
        Ok(())
    }


    pub( crate ) fn resume( &self ) -> Result<(), PlayerError> {
        if let Some( binding ) = &self.binding {
            binding.play()?;
        }
        self.paused.store( false, Ordering::Relaxed );
        Ok(())
    }


    pub( crate ) fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    /// Asks the decode worker to reposition. Wait for the answer with [`await_seek`].
    pub( crate ) fn request_seek( &self, position: Duration ) -> Result<PendingSeek, PlayerError> {
        let ( reply, response ) = mpsc::channel();
        self.commands
            .send( WorkerCommand::Seek { position, reply } )
            .map_err( |_| PlayerError::NoTrack )?;
        Ok( response )
    }


    pub( crate ) fn equalizer( &self ) -> &EqualizerControl {
        &self.equalizer
    }


    pub( crate ) fn volume( &self ) -> &VolumeControl {
        &self.volume
    }


    /// Copy of the latest spectrum frame.
    pub( crate ) fn spectrum( &self ) -> Option<SpectrumFrame> {
        self.analyzer.lock().unwrap_or_else( PoisonError::into_inner ).latest()
    }


    pub( crate ) fn end( &self ) -> &GraphEnd {
        &self.end
    }
}


impl Drop for LiveGraph {
    fn drop( &mut self ) {
        self.end.dismiss();
        self.stop.store( true, Ordering::Relaxed );

        // Stop the device first so nothing pulls from the chain while it goes away
        if let Some( binding ) = self.binding.take() {
            if let Err( e ) = binding.pause() {
                tracing::debug!( "Pausing output during teardown failed: {}", e );
            }
            drop( binding );
        }
        self.prefetch.clear();

        if let Some( worker ) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                tracing::debug!( "Graph released from its own decode worker" );
            } else if worker.join().is_err() {
                tracing::warn!( "Decode worker panicked" );
            }
        }

        tracing::info!( "Released graph for {:?}", self.path );
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_interleave_into() {
        let mut out = vec![ 9.0 ];
        interleave_into( &[ vec![ 1.0, 3.0 ], vec![ 2.0, 4.0 ] ], &mut out );
        assert_eq!( out, [ 9.0, 1.0, 2.0, 3.0, 4.0 ] );

        interleave_into( &[], &mut out );
        assert_eq!( out.len(), 5 );
    }


    #[test]
    fn test_resampling_changes_length_by_ratio() {
        let mut resampling = Resampling::new( 22050, 44100, 2 ).unwrap();
        let input = vec![ 0.25; 22050 * 2 ];
        let mut out = Vec::new();
        resampling.process( &input, &mut out );
        resampling.flush( &mut out );

        assert_eq!( out.len() % 2, 0 );
        let frames = out.len() / 2;
        assert!( ( frames as i64 - 44100 ).abs() < 2 * RESAMPLE_CHUNK as i64, "{} frames", frames );
    }


    #[test]
    fn test_push_all_gives_up_on_stop() {
        let prefetch = PrefetchBuffer::new( 4, 44100, 1 );
        let stop = AtomicBool::new( true );
        push_all( &prefetch, &[ 0.0; 16 ], &stop );
        assert!( prefetch.is_empty() );

        let stop = AtomicBool::new( false );
        push_all( &prefetch, &[ 0.0; 3 ], &stop );
        assert_eq!( prefetch.len(), 3 );
    }
}
