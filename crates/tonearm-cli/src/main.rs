//! Tonearm CLI - plays files in order through the equalizer with a live spectrum meter

mod cli;
mod meter;
mod settings;

use std::io::{ self, Write };
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use cli::Args;
use settings::Settings;

use tonearm_core::{
    volume::clamp_volume,
    EngineConfig, LoadOutcome, PlaybackEngine, PlayerEvent, SpectrumSink, StopReason,
};


const METER_INTERVAL: Duration = Duration::from_millis( 50 );


fn init_logging( verbose: u8 ) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_writer( io::stderr )
        .with_max_level( level )
        .init();
}


/// Applies command-line overrides to the stored settings.
fn apply_overrides( settings: &mut Settings, args: &Args ) {
    if let Some( volume ) = args.volume {
        settings.volume = clamp_volume( volume );
    }
    if let Some( profile ) = &args.eq {
        settings.set_profile( profile );
    }
}


/// How playback of one file ended.
enum Finished {
    Track( StopReason ),
    Interrupted,
}


struct Session {
    engine: PlaybackEngine,
    stopped: mpsc::UnboundedReceiver<( PathBuf, StopReason )>,
    sink: Arc<SpectrumSink>,
    cancel: CancellationToken,
    show_meter: bool,
}


impl Session {
    /// Waits for the current track to stop, drawing the meter meanwhile.
    async fn wait( &mut self, path: &Path ) -> Result<Finished> {
        let mut ticker = tokio::time::interval( METER_INTERVAL );

        loop {
            tokio::select! {
                stopped = self.stopped.recv() => match stopped {
                    Some( ( stopped_path, reason ) ) if stopped_path == path => {
                        return Ok( Finished::Track( reason ) );
                    }
                    Some( _ ) => {}
                    None => return Ok( Finished::Interrupted ),
                },
                _ = self.cancel.cancelled() => {
                    self.engine.stop()?;
                    return Ok( Finished::Interrupted );
                }
                _ = ticker.tick(), if self.show_meter => self.draw()?,
            }
        }
    }


    fn draw( &self ) -> io::Result<()> {
        let line = meter::status_line(
            self.engine.state(),
            self.engine.current_track().as_deref(),
            self.engine.position(),
            self.engine.duration(),
            &self.sink.values(),
        );

        let mut out = io::stdout().lock();
        write!( out, "\r\x1b[2K{}", line )?;
        out.flush()
    }


    fn end_line( &self ) {
        if self.show_meter {
            println!();
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging( args.verbose );

    let mut settings = Settings::load();
    apply_overrides( &mut settings, &args );
    if args.save {
        settings.save();
        tracing::info!( "Saved volume and equalizer settings" );
    }

    let mut config = EngineConfig::default();
    config.spectrum.bands = args.bands;
    let expected_bands = config.spectrum.normalized().bands;

    let engine = PlaybackEngine::new( config );
    engine.set_equalizer_profile( settings.profile() );

    let ( tx, stopped ) = mpsc::unbounded_channel();
    let sink = Arc::new( SpectrumSink::new( expected_bands ) );
    {
        let sink = Arc::clone( &sink );
        engine.subscribe( move |event| match event {
            PlayerEvent::Stopped { path, reason } => {
                let _ = tx.send( ( path.clone(), reason.clone() ) );
            }
            PlayerEvent::Spectrum( frame ) => {
                sink.accept( frame );
            }
            _ => {}
        });
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn( async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut session = Session {
        engine,
        stopped,
        sink,
        cancel: cancel.clone(),
        show_meter: !args.no_meter,
    };

    let volume = settings.volume();
    for path in &args.files {
        match session.engine.load_and_play( path, volume, cancel.clone() ).await {
            Ok( LoadOutcome::Playing ) => {}
            Ok( LoadOutcome::Cancelled ) => break,
            Err( e ) => {
                eprintln!( "Skipping {}: {}", path.display(), e );
                continue;
            }
        }

        let finished = session.wait( path ).await?;
        session.end_line();

        match finished {
            Finished::Track( StopReason::EndOfStream ) => {}
            Finished::Track( StopReason::Error( message ) ) => {
                eprintln!( "Playback of {} failed: {}", path.display(), message );
            }
            Finished::Track( StopReason::Requested ) | Finished::Interrupted => break,
        }
    }

    Ok(())
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_overrides_replace_stored_values() {
        let args = Args::try_parse_from( [ "tonearm", "--volume", "3", "--eq", "6", "a.wav" ] ).unwrap();
        let mut settings = Settings::default();
        apply_overrides( &mut settings, &args );

        assert_eq!( settings.volume, 1.0 );
        assert_eq!( settings.profile().bands()[ 0 ].gain_db, 6.0 );
    }


    #[test]
    fn test_no_overrides_keep_settings() {
        let args = Args::try_parse_from( [ "tonearm", "a.wav" ] ).unwrap();
        let mut settings = Settings { volume: 0.25, ..Settings::default() };
        let before = settings.clone();
        apply_overrides( &mut settings, &args );

        assert_eq!( settings, before );
    }
}
