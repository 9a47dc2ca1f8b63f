mod common;

use std::sync::Arc;
use std::time::Duration;

use tonearm_core::{ CancellationToken, EngineConfig, LoadOutcome, PlaybackEngine, PlaybackState };

use common::{ wait_until, write_tone, ScriptedBackend };


#[tokio::test]
async fn test_stop_then_two_loads_leaves_one_graph() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_tone( dir.path(), "first.wav", 220.0, 0.5, 10.0, 44100, 2 );
    let second = write_tone( dir.path(), "second.wav", 440.0, 0.5, 10.0, 44100, 2 );
    let third = write_tone( dir.path(), "third.wav", 880.0, 0.5, 10.0, 44100, 2 );

    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = PlaybackEngine::with_backend( EngineConfig::default(), Arc::clone( &backend ) as _ );

    engine.load_and_play( &first, 1.0, CancellationToken::new() ).await.unwrap();
    engine.stop().unwrap();
    assert_eq!( backend.live(), 0 );

    let ( a, b ) = tokio::join!(
        engine.load_and_play( &second, 1.0, CancellationToken::new() ),
        engine.load_and_play( &third, 1.0, CancellationToken::new() ),
    );

    assert_eq!( a.unwrap(), LoadOutcome::Cancelled );
    assert_eq!( b.unwrap(), LoadOutcome::Playing );
    assert_eq!( engine.current_track(), Some( third ) );
    assert_eq!( engine.state(), PlaybackState::Playing );
    assert_eq!( backend.live(), 1 );

    // The superseded load never reached the output
    tokio::time::sleep( Duration::from_millis( 200 ) ).await;
    assert_eq!( backend.opened(), 2 );
    assert_eq!( backend.live(), 1 );

    engine.stop().unwrap();
    assert_eq!( backend.live(), 0 );
}


#[tokio::test]
async fn test_stop_cancels_load_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tone( dir.path(), "tone.wav", 440.0, 0.5, 5.0, 44100, 1 );

    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 10 ) ) );
    let engine = PlaybackEngine::with_backend( EngineConfig::default(), Arc::clone( &backend ) as _ );

    let ( loaded, stopped ) = tokio::join!(
        engine.load_and_play( &path, 1.0, CancellationToken::new() ),
        async { engine.stop() },
    );

    assert_eq!( loaded.unwrap(), LoadOutcome::Cancelled );
    stopped.unwrap();
    assert_eq!( engine.state(), PlaybackState::Stopped );
    assert_eq!( engine.current_track(), None );
    assert!( wait_until( Duration::from_millis( 500 ), || backend.opened() == 0 ).await );
    assert_eq!( backend.live(), 0 );
}


#[tokio::test]
async fn test_many_replacements_release_every_graph() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = ( 0..6 )
        .map( |i| write_tone( dir.path(), &format!( "tone{}.wav", i ), 200.0 + 100.0 * i as f32, 0.4, 3.0, 22050, 1 ) )
        .collect();

    let backend = Arc::new( ScriptedBackend::new( Duration::from_millis( 5 ) ) );
    let engine = PlaybackEngine::with_backend( EngineConfig::default(), Arc::clone( &backend ) as _ );

    for path in &paths {
        let outcome = engine.load_and_play( path, 1.0, CancellationToken::new() ).await.unwrap();
        assert_eq!( outcome, LoadOutcome::Playing );
        assert_eq!( backend.live(), 1 );
    }

    assert_eq!( backend.opened(), paths.len() );
    assert_eq!( engine.current_track().as_ref(), paths.last() );

    drop( engine );
    assert_eq!( backend.live(), 0 );
}
