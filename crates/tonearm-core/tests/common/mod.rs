//! Shared fixtures for engine tests: tone files and a scripted output backend.

#![allow( dead_code )]

use std::path::{ Path, PathBuf };
use std::sync::{ Arc, Mutex };
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::thread;
use std::time::{ Duration, Instant };

use tonearm_core::{
    OutputBackend, OutputBinding, OutputConfig, OutputError, PlayerEvent, PlaybackEngine, SampleSource,
};


/// Writes a 16-bit sine tone WAV.
pub fn write_tone(
    dir: &Path,
    name: &str,
    frequency: f32,
    amplitude: f32,
    seconds: f32,
    sample_rate: u32,
    channels: u16,
) -> PathBuf {
    let path = dir.join( name );
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create( &path, spec ).unwrap();
    let frames = ( seconds * sample_rate as f32 ) as usize;
    let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
    for i in 0..frames {
        let sample = ( amplitude * ( step * i as f32 ).sin() * i16::MAX as f32 ) as i16;
        for _ in 0..channels {
            writer.write_sample( sample ).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}


/// Writes a file no decoder will accept.
pub fn write_garbage( dir: &Path, name: &str ) -> PathBuf {
    let path = dir.join( name );
    std::fs::write( &path, b"this is not audio at all, just some text bytes" ).unwrap();
    path
}


/// Output backend that pulls from the chain on its own thread at a fixed pace.
pub struct ScriptedBackend {
    pace: Duration,
    block_frames: usize,
    rate: Option<u32>,
    fail_open: AtomicBool,
    live: Arc<AtomicUsize>,
    opened: AtomicUsize,
    peak: AtomicUsize,
}


impl ScriptedBackend {
    /// Pulls 512 frames every `pace`.
    pub fn new( pace: Duration ) -> Self {
        Self {
            pace,
            block_frames: 512,
            rate: None,
            fail_open: AtomicBool::new( false ),
            live: Arc::new( AtomicUsize::new( 0 ) ),
            opened: AtomicUsize::new( 0 ),
            peak: AtomicUsize::new( 0 ),
        }
    }


    /// Forces the device rate, making the engine resample.
    pub fn with_rate( mut self, rate: u32 ) -> Self {
        self.rate = Some( rate );
        self
    }


    pub fn fail_open( &self, fail: bool ) {
        self.fail_open.store( fail, Ordering::SeqCst );
    }


    /// Bindings currently open.
    pub fn live( &self ) -> usize {
        self.live.load( Ordering::SeqCst )
    }


    /// Bindings ever opened.
    pub fn opened( &self ) -> usize {
        self.opened.load( Ordering::SeqCst )
    }


    /// Most bindings ever open at once.
    pub fn peak( &self ) -> usize {
        self.peak.load( Ordering::SeqCst )
    }
}


impl OutputBackend for ScriptedBackend {
    fn negotiate( &self, sample_rate: u32, channels: u16 ) -> Result<OutputConfig, OutputError> {
        Ok( OutputConfig {
            api: "scripted".to_string(),
            sample_rate: self.rate.unwrap_or( sample_rate ),
            channels,
        })
    }


    fn open(
        &self,
        config: &OutputConfig,
        mut source: Box<dyn SampleSource>,
    ) -> Result<Box<dyn OutputBinding>, OutputError> {
        if self.fail_open.load( Ordering::SeqCst ) {
            return Err( OutputError::NoDevice );
        }

        let running = Arc::new( AtomicBool::new( false ) );
        let stop = Arc::new( AtomicBool::new( false ) );
        let pace = self.pace;
        let mut buf = vec![ 0.0; self.block_frames * source.channels() ];

        let thread = {
            let running = Arc::clone( &running );
            let stop = Arc::clone( &stop );
            thread::spawn( move || {
                while !stop.load( Ordering::SeqCst ) {
                    if running.load( Ordering::SeqCst ) {
                        source.read( &mut buf );
                        thread::sleep( pace );
                    } else {
                        thread::sleep( Duration::from_millis( 1 ) );
                    }
                }
            })
        };

        self.opened.fetch_add( 1, Ordering::SeqCst );
        let live = self.live.fetch_add( 1, Ordering::SeqCst ) + 1;
        self.peak.fetch_max( live, Ordering::SeqCst );

        Ok( Box::new( ScriptedBinding {
            config: config.clone(),
            running,
            stop,
            thread: Some( thread ),
            live: Arc::clone( &self.live ),
        }))
    }
}


struct ScriptedBinding {
    config: OutputConfig,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}


impl OutputBinding for ScriptedBinding {
    fn play( &self ) -> Result<(), OutputError> {
        self.running.store( true, Ordering::SeqCst );
        Ok(())
    }


    fn pause( &self ) -> Result<(), OutputError> {
        self.running.store( false, Ordering::SeqCst );
        Ok(())
    }


    fn config( &self ) -> &OutputConfig {
        &self.config
    }
}


impl Drop for ScriptedBinding {
    fn drop( &mut self ) {
        self.stop.store( true, Ordering::SeqCst );
        if let Some( thread ) = self.thread.take() {
            let _ = thread.join();
        }
        self.live.fetch_sub( 1, Ordering::SeqCst );
    }
}


/// Records every non-spectrum event.
pub fn record( engine: &PlaybackEngine ) -> Arc<Mutex<Vec<PlayerEvent>>> {
    let events = Arc::new( Mutex::new( Vec::new() ) );
    let sink = Arc::clone( &events );
    engine.subscribe( move |event| {
        if !matches!( event, PlayerEvent::Spectrum( _ ) ) {
            sink.lock().unwrap().push( event.clone() );
        }
    });
    events
}


/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until( timeout: Duration, condition: impl Fn() -> bool ) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep( Duration::from_millis( 10 ) ).await;
    }
    condition()
}
