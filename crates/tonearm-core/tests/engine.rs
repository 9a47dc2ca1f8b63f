mod common;

use std::sync::Arc;
use std::time::{ Duration, Instant };

use tonearm_core::{
    CancellationToken, DecoderError, EngineConfig, EqualizerProfile, LoadOutcome, PlaybackEngine,
    PlaybackState, PlayerError, PlayerEvent, SpectrumConfig, SpectrumSink, StopReason,
};

use common::{ record, wait_until, write_garbage, write_tone, ScriptedBackend };


const WAIT: Duration = Duration::from_secs( 5 );


fn engine_with( backend: &Arc<ScriptedBackend> ) -> PlaybackEngine {
    PlaybackEngine::with_backend( EngineConfig::default(), Arc::clone( backend ) as _ )
}


fn stopped_count( events: &[PlayerEvent] ) -> usize {
    events.iter().filter( |e| matches!( e, PlayerEvent::Stopped { .. } ) ).count()
}


#[tokio::test]
async fn test_load_and_play_reports_track() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 2.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );
    let events = record( &engine );

    let outcome = engine.load_and_play( &path, 0.8, CancellationToken::new() ).await.unwrap();

    assert_eq!( outcome, LoadOutcome::Playing );
    assert_eq!( engine.state(), PlaybackState::Playing );
    assert_eq!( engine.current_track(), Some( path.clone() ) );
    assert_eq!( engine.duration(), Some( Duration::from_secs( 2 ) ) );
    assert_eq!( engine.volume(), 0.8 );
    assert_eq!( backend.live(), 1 );
    assert!( wait_until( WAIT, || engine.position() > Duration::ZERO ).await );

    let events = events.lock().unwrap();
    assert!( events.iter().any( |e| matches!( e, PlayerEvent::TrackChanged { path: p, .. } if *p == path ) ) );
    assert!( events.iter().any( |e| matches!( e, PlayerEvent::StateChanged { state: PlaybackState::Loading } ) ) );
    assert!( events.iter().any( |e| matches!( e, PlayerEvent::StateChanged { state: PlaybackState::Playing } ) ) );
}


#[tokio::test]
async fn test_end_of_stream_notifies_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "short.wav", 440.0, 0.5, 0.3, 44100, 2 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 1 ) ) );
    let engine = engine_with( &backend );
    let events = record( &engine );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    assert!( wait_until( WAIT, || stopped_count( &events.lock().unwrap() ) > 0 ).await );
    tokio::time::sleep( Duration::from_millis( 100 ) ).await;

    assert_eq!( engine.state(), PlaybackState::EndOfStream );
    assert_eq!( engine.current_track(), Some( path.clone() ) );
    {
        let events = events.lock().unwrap();
        assert_eq!( stopped_count( &events ), 1 );
        assert!( events.iter().any( |e| matches!(
            e,
            PlayerEvent::Stopped { reason: StopReason::EndOfStream, .. }
        )));
    }

    // Nothing left to seek in or pause
    assert!( matches!( engine.seek( Duration::ZERO ), Err( PlayerError::InvalidState { .. } ) ) );
    assert!( matches!( engine.pause(), Err( PlayerError::InvalidState { .. } ) ) );

    // Stopping an ended graph releases it without a second notification
    engine.stop().unwrap();
    assert_eq!( stopped_count( &events.lock().unwrap() ), 1 );
    assert_eq!( engine.state(), PlaybackState::Stopped );
    assert_eq!( backend.live(), 0 );
}


#[tokio::test]
async fn test_stop_notifies_requested() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "long.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );
    let events = record( &engine );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    engine.stop().unwrap();

    assert_eq!( engine.state(), PlaybackState::Stopped );
    assert_eq!( engine.current_track(), None );
    assert_eq!( engine.position(), Duration::ZERO );
    assert_eq!( backend.live(), 0 );

    let events = events.lock().unwrap();
    assert_eq!( stopped_count( &events ), 1 );
    assert!( events.iter().any( |e| matches!(
        e,
        PlayerEvent::Stopped { reason: StopReason::Requested, .. }
    )));
}


#[tokio::test]
async fn test_decode_failure_leaves_previous_playing() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_tone( dir.path(), "good.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let broken = write_garbage( dir.path(), "broken.wav" );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    engine.load_and_play( &good, 1.0, CancellationToken::new() ).await.unwrap();
    let result = engine.load_and_play( &broken, 1.0, CancellationToken::new() ).await;

    assert!( matches!( result, Err( PlayerError::Decode( DecoderError::Unreadable { .. } ) ) ) );
    assert_eq!( engine.state(), PlaybackState::Playing );
    assert_eq!( engine.current_track(), Some( good ) );
    assert_eq!( backend.live(), 1 );
    assert_eq!( backend.opened(), 1 );
}


#[tokio::test]
async fn test_decode_failure_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_tone( dir.path(), "good.wav", 440.0, 0.5, 2.0, 44100, 1 );
    let missing = dir.path().join( "missing.flac" );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    assert!( engine.load_and_play( &missing, 1.0, CancellationToken::new() ).await.is_err() );
    assert_eq!( engine.state(), PlaybackState::Idle );
    assert_eq!( engine.current_track(), None );

    let outcome = engine.load_and_play( &good, 1.0, CancellationToken::new() ).await.unwrap();
    assert_eq!( outcome, LoadOutcome::Playing );
    assert_eq!( engine.current_track(), Some( good ) );
}


#[tokio::test]
async fn test_cancelled_load_keeps_current_graph() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_tone( dir.path(), "first.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let second = write_tone( dir.path(), "second.wav", 880.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    engine.load_and_play( &first, 1.0, CancellationToken::new() ).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = engine.load_and_play( &second, 1.0, cancel ).await.unwrap();

    assert_eq!( outcome, LoadOutcome::Cancelled );
    assert_eq!( engine.state(), PlaybackState::Playing );
    assert_eq!( engine.current_track(), Some( first ) );
    assert_eq!( backend.live(), 1 );
    assert_eq!( backend.opened(), 1 );

    let before = engine.position();
    assert!( wait_until( WAIT, || engine.position() > before ).await );
}


#[tokio::test]
async fn test_pause_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    assert!( matches!( engine.pause(), Err( PlayerError::NoTrack ) ) );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    assert!( wait_until( WAIT, || engine.position() > Duration::ZERO ).await );

    engine.pause().unwrap();
    assert_eq!( engine.state(), PlaybackState::Paused );
    tokio::time::sleep( Duration::from_millis( 30 ) ).await;
    let paused_at = engine.position();
    tokio::time::sleep( Duration::from_millis( 100 ) ).await;
    assert_eq!( engine.position(), paused_at );

    // Pausing twice is harmless
    engine.pause().unwrap();

    engine.resume().unwrap();
    assert_eq!( engine.state(), PlaybackState::Playing );
    assert!( wait_until( WAIT, || engine.position() > paused_at ).await );
}


#[tokio::test]
async fn test_seek_moves_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 10.0, 44100, 2 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    assert!( matches!( engine.seek( Duration::from_secs( 1 ) ), Err( PlayerError::NoTrack ) ) );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    let actual = engine.seek( Duration::from_secs( 6 ) ).unwrap();

    assert!( ( actual.as_secs_f64() - 6.0 ).abs() < 0.01, "landed at {:?}", actual );
    assert!( engine.position() >= Duration::from_secs( 6 ) );
    assert!( engine.position() < Duration::from_secs( 7 ) );

    // Paused seeks are allowed too
    engine.pause().unwrap();
    engine.seek( Duration::from_secs( 2 ) ).unwrap();
    assert!( engine.position() < Duration::from_secs( 3 ) );
    assert_eq!( engine.state(), PlaybackState::Paused );
}


#[tokio::test]
async fn test_equalizer_profile_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_tone( dir.path(), "first.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let second = write_tone( dir.path(), "second.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    assert!( engine.equalizer_profile().is_flat() );

    engine.load_and_play( &first, 1.0, CancellationToken::new() ).await.unwrap();
    let profile = EqualizerProfile::flat().with_gain( 5, 6.0 ).with_gain( 0, -3.0 );
    engine.set_equalizer_profile( profile.clone() );
    assert_eq!( engine.equalizer_profile(), profile );

    engine.load_and_play( &second, 1.0, CancellationToken::new() ).await.unwrap();
    assert_eq!( engine.equalizer_profile(), profile );
    assert_eq!( engine.current_track(), Some( second ) );
    assert_eq!( backend.live(), 1 );
}


#[tokio::test]
async fn test_output_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 1.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    backend.fail_open( true );
    let engine = engine_with( &backend );

    let result = engine.load_and_play( &path, 1.0, CancellationToken::new() ).await;

    assert!( matches!( result, Err( PlayerError::Output( _ ) ) ) );
    assert_eq!( engine.state(), PlaybackState::Idle );
    assert_eq!( engine.current_track(), None );
    assert_eq!( backend.live(), 0 );
}


#[tokio::test]
async fn test_spectrum_frames_match_configured_bands() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 1000.0, 0.5, 10.0, 44100, 2 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 5 ) ) );
    let config = EngineConfig {
        spectrum: SpectrumConfig { bands: 16, ..SpectrumConfig::default() },
        ..EngineConfig::default()
    };
    let engine = PlaybackEngine::with_backend( config, Arc::clone( &backend ) as _ );

    let sink = Arc::new( SpectrumSink::new( 16 ) );
    let mismatched = Arc::new( SpectrumSink::new( 32 ) );
    {
        let sink = Arc::clone( &sink );
        let mismatched = Arc::clone( &mismatched );
        engine.subscribe( move |event| {
            if let PlayerEvent::Spectrum( frame ) = event {
                sink.accept( frame );
                mismatched.accept( frame );
            }
        });
    }

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    assert!( wait_until( WAIT, || sink.accepted() > 2 ).await );

    assert!( sink.values().iter().all( |v| ( 0.0..=1.0 ).contains( v ) ) );
    assert!( sink.values().iter().any( |&v| v > 0.0 ) );
    assert_eq!( mismatched.accepted(), 0 );
    assert!( mismatched.ignored() > 0 );

    let frame = engine.spectrum().unwrap();
    assert_eq!( frame.len(), 16 );
}


#[tokio::test]
async fn test_volume_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 2.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    engine.load_and_play( &path, 3.0, CancellationToken::new() ).await.unwrap();
    assert_eq!( engine.volume(), 1.0 );

    engine.set_volume( -0.5 );
    assert_eq!( engine.volume(), 0.0 );

    engine.set_volume( f32::NAN );
    assert_eq!( engine.volume(), 0.0 );

    engine.set_volume( 0.4 );
    assert_eq!( engine.volume(), 0.4 );
}


#[tokio::test]
async fn test_plays_through_resampler() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 3.0, 44100, 2 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 5 ) ).with_rate( 48000 ) );
    let engine = engine_with( &backend );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();

    assert_eq!( engine.duration(), Some( Duration::from_secs( 3 ) ) );
    assert!( wait_until( WAIT, || engine.position() > Duration::from_millis( 100 ) ).await );
}


#[tokio::test]
async fn test_replacement_releases_output_before_opening() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = ( 0..3 )
        .map( |i| write_tone( dir.path(), &format!( "tone{}.wav", i ), 330.0 + 110.0 * i as f32, 0.5, 5.0, 44100, 2 ) )
        .collect();
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    for path in &paths {
        engine.load_and_play( path, 1.0, CancellationToken::new() ).await.unwrap();
    }

    assert_eq!( backend.opened(), 3 );
    assert_eq!( backend.peak(), 1 );
    assert_eq!( backend.live(), 1 );
}


#[tokio::test]
async fn test_output_failure_while_replacing_leaves_idle() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_tone( dir.path(), "first.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let second = write_tone( dir.path(), "second.wav", 880.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );
    let events = record( &engine );

    engine.load_and_play( &first, 1.0, CancellationToken::new() ).await.unwrap();
    backend.fail_open( true );
    let result = engine.load_and_play( &second, 1.0, CancellationToken::new() ).await;

    assert!( matches!( result, Err( PlayerError::Output( _ ) ) ) );
    assert_eq!( engine.state(), PlaybackState::Idle );
    assert_eq!( engine.current_track(), None );
    assert_eq!( backend.live(), 0 );
    assert_eq!( stopped_count( &events.lock().unwrap() ), 0 );

    backend.fail_open( false );
    let outcome = engine.load_and_play( &second, 1.0, CancellationToken::new() ).await.unwrap();
    assert_eq!( outcome, LoadOutcome::Playing );
    assert_eq!( backend.peak(), 1 );
}


#[tokio::test]
async fn test_mid_stream_decode_error_stops_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "cut.wav", 440.0, 0.5, 3.0, 44100, 1 );

    // Header still claims three seconds; the data ends half way
    let len = std::fs::metadata( &path ).unwrap().len();
    std::fs::OpenOptions::new().write( true ).open( &path ).unwrap().set_len( len / 2 ).unwrap();

    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 1 ) ) );
    let engine = engine_with( &backend );
    let events = record( &engine );

    let outcome = engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    assert_eq!( outcome, LoadOutcome::Playing );
    assert!( wait_until( WAIT, || stopped_count( &events.lock().unwrap() ) > 0 ).await );

    // No retry, no second notification
    tokio::time::sleep( Duration::from_millis( 200 ) ).await;
    let events = events.lock().unwrap();
    assert_eq!( stopped_count( &events ), 1 );
    assert!( events.iter().any( |e| matches!(
        e,
        PlayerEvent::Stopped { reason: StopReason::Error( _ ), .. }
    )));
    assert_eq!( engine.state(), PlaybackState::Stopped );
}


#[tokio::test]
async fn test_pending_seek_does_not_block_queries() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );

    // A tiny queue and a large decode-ahead keep the worker waiting for room while paused
    let config = EngineConfig {
        prefetch: Duration::from_millis( 1 ),
        decode_ahead: Duration::from_secs( 10 ),
        seek_timeout: Duration::from_secs( 1 ),
        ..EngineConfig::default()
    };
    let engine = Arc::new( PlaybackEngine::with_backend( config, Arc::clone( &backend ) as _ ) );

    engine.load_and_play( &path, 1.0, CancellationToken::new() ).await.unwrap();
    engine.pause().unwrap();
    tokio::time::sleep( Duration::from_millis( 200 ) ).await;

    let seeking = {
        let engine = Arc::clone( &engine );
        tokio::task::spawn_blocking( move || engine.seek( Duration::from_secs( 5 ) ) )
    };
    tokio::time::sleep( Duration::from_millis( 100 ) ).await;

    let started = Instant::now();
    let _ = engine.position();
    assert_eq!( engine.state(), PlaybackState::Paused );
    assert!( started.elapsed() < Duration::from_millis( 300 ), "queries waited {:?}", started.elapsed() );

    let result = seeking.await.unwrap();
    assert!( matches!( result, Err( PlayerError::SeekTimeout ) ) );
}


#[tokio::test]
async fn test_pause_while_loading_carries_over() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_tone( dir.path(), "first.wav", 440.0, 0.5, 10.0, 44100, 1 );
    let second = write_tone( dir.path(), "second.wav", 880.0, 0.5, 10.0, 44100, 1 );
    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = engine_with( &backend );

    engine.load_and_play( &first, 1.0, CancellationToken::new() ).await.unwrap();

    let ( loaded, paused ) = tokio::join!(
        engine.load_and_play( &second, 1.0, CancellationToken::new() ),
        async { engine.pause() },
    );

    assert_eq!( loaded.unwrap(), LoadOutcome::Playing );
    paused.unwrap();
    assert_eq!( engine.state(), PlaybackState::Paused );
    assert_eq!( engine.current_track(), Some( second ) );

    let at = engine.position();
    tokio::time::sleep( Duration::from_millis( 100 ) ).await;
    assert_eq!( engine.position(), at );

    engine.resume().unwrap();
    assert!( wait_until( WAIT, || engine.position() > at ).await );
}
