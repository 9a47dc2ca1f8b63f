//! Playback engine
//!
//! [`PlaybackEngine`] owns at most one live graph and serializes every
//! transport operation against it. Loads build their graph without holding
//! the engine lock and only take it to swap the result in, so a slow open
//! never blocks `pause`, `stop` or queries.
//!
//! Each load gets a cancellation token. Starting another load or calling
//! `stop` cancels the one in flight; a cancelled load releases what it
//! built and leaves the current graph alone.

use std::io;
use std::path::PathBuf;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, RwLock };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::decoder::DecoderError;
use crate::equalizer::EqualizerProfile;
use crate::events::{ EventHub, PlayerEvent, StopReason, SubscriptionId };
use crate::graph::{ self, BuildRequest, LiveGraph, PendingGraph };
use crate::output::{ CpalBackend, OutputBackend, OutputError };
use crate::spectrum::SpectrumFrame;
use crate::volume::clamp_volume;


/// Errors that can occur during playback.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "Failed to open track: {0}" )]
    Decode( #[from] DecoderError ),

    #[error( "Audio output error: {0}" )]
    Output( #[from] OutputError ),

    #[error( "Load cancelled" )]
    Cancelled,

    #[error( "No track loaded" )]
    NoTrack,

    #[error( "Cannot {action} while {state:?}" )]
    InvalidState { action: &'static str, state: PlaybackState },

    #[error( "Failed to create resampler: {0}" )]
    Resampler( String ),

    #[error( "Decode worker failed: {0}" )]
    Worker( io::Error ),

    #[error( "Seek timed out" )]
    SeekTimeout,
}


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    EndOfStream,
}


/// What became of a load request that did not fail.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum LoadOutcome {
    /// The new graph is live and playing.
    Playing,

    /// A newer request or `stop` superseded this one; nothing changed.
    Cancelled,
}


/// State cell shared with decode workers; every change is published.
pub( crate ) struct SharedState {
    state: RwLock<PlaybackState>,
    events: Arc<EventHub>,
}


impl SharedState {
    fn new( events: Arc<EventHub> ) -> Self {
        Self { state: RwLock::new( PlaybackState::Idle ), events }
    }


    pub( crate ) fn get( &self ) -> PlaybackState {
        *self.state.read().unwrap_or_else( PoisonError::into_inner )
    }


    pub( crate ) fn set( &self, state: PlaybackState ) {
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else( PoisonError::into_inner ),
            state,
        );
        if previous != state {
            tracing::debug!( "State {:?} -> {:?}", previous, state );
            self.events.emit( &PlayerEvent::StateChanged { state } );
        }
    }


    pub( crate ) fn events( &self ) -> &EventHub {
        &self.events
    }
}


/// Core audio engine.
pub struct PlaybackEngine {
    config: EngineConfig,
    backend: Arc<dyn OutputBackend>,
    events: Arc<EventHub>,
    shared: Arc<SharedState>,
    /// The gate: held for every graph swap and transport operation
    live: Mutex<Option<LiveGraph>>,
    in_flight: Mutex<Option<( u64, CancellationToken )>>,
    next_load: AtomicU64,
    profile: RwLock<EqualizerProfile>,
    /// Volume level (0.0 to 1.0), persisted across track changes
    volume: RwLock<f32>,
}


impl PlaybackEngine {
    /// Creates an engine playing through the system's audio hosts.
    pub fn new( config: EngineConfig ) -> Self {
        Self::with_backend( config, Arc::new( CpalBackend::new() ) )
    }


    /// Creates an engine playing through `backend`.
    pub fn with_backend( config: EngineConfig, backend: Arc<dyn OutputBackend> ) -> Self {
        let events = Arc::new( EventHub::new() );
        Self {
            config,
            backend,
            shared: Arc::new( SharedState::new( Arc::clone( &events ) ) ),
            events,
            live: Mutex::new( None ),
            in_flight: Mutex::new( None ),
            next_load: AtomicU64::new( 0 ),
            profile: RwLock::new( EqualizerProfile::flat() ),
            volume: RwLock::new( 1.0 ),
        }
    }


    fn live( &self ) -> MutexGuard<'_, Option<LiveGraph>> {
        self.live.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Loads `path` and starts playing it, replacing whatever is playing.
    ///
    /// The file is opened and the graph built on a blocking thread. The
    /// current graph keeps playing until the new one is ready. If `cancel`
    /// fires, a newer load starts, or `stop` is called before the swap, the
    /// load is abandoned and [`LoadOutcome::Cancelled`] is returned.
    ///
    /// The previous graph is released before the new one opens the output,
    /// so a pause issued meanwhile carries over to the new graph. A build
    /// failure leaves the previous graph untouched; an output failure after
    /// the swap leaves the engine idle.
    pub async fn load_and_play(
        &self,
        path: impl Into<PathBuf>,
        volume: f32,
        cancel: CancellationToken,
    ) -> Result<LoadOutcome, PlayerError> {
        let path = path.into();
        let volume = clamp_volume( volume );
        *self.volume.write().unwrap_or_else( PoisonError::into_inner ) = volume;

        let ( load_id, token ) = self.begin_load( &cancel );
        tracing::info!( "Loading {:?}", path );
        self.shared.set( PlaybackState::Loading );

        let request = BuildRequest {
            path: path.clone(),
            volume,
            profile: self.equalizer_profile(),
            config: self.config.clone(),
            backend: Arc::clone( &self.backend ),
            events: Arc::clone( &self.events ),
        };

        let build_token = token.clone();
        let build = tokio::task::spawn_blocking( move || graph::build( request, &build_token ) );

        let built = tokio::select! {
            _ = token.cancelled() => Err( PlayerError::Cancelled ),
            joined = build => match joined {
                Ok( result ) => result,
                Err( e ) => Err( PlayerError::Worker( io::Error::other( e.to_string() ) ) ),
            },
        };

        let result = match built {
            Ok( pending ) => self.install( pending, &token ),
            Err( e ) => Err( e ),
        };

        let newest = self.end_load( load_id );
        match result {
            Ok( LoadOutcome::Playing ) => Ok( LoadOutcome::Playing ),
            Ok( LoadOutcome::Cancelled ) | Err( PlayerError::Cancelled ) => {
                tracing::debug!( "Load of {:?} was superseded", path );
                if newest {
                    self.restore_state();
                }
                Ok( LoadOutcome::Cancelled )
            }
            Err( e ) => {
                tracing::warn!( "Failed to load {:?}: {}", path, e );
                if newest {
                    self.restore_state();
                }
                Err( e )
            }
        }
    }


    /// Registers a new in-flight load, cancelling the previous one.
    fn begin_load( &self, cancel: &CancellationToken ) -> ( u64, CancellationToken ) {
        let id = self.next_load.fetch_add( 1, Ordering::Relaxed );
        let token = cancel.child_token();
        let previous = self.in_flight
            .lock()
            .unwrap_or_else( PoisonError::into_inner )
            .replace( ( id, token.clone() ) );
        if let Some( ( _, previous ) ) = previous {
            previous.cancel();
        }
        ( id, token )
    }


    /// Clears the in-flight slot if it still belongs to load `id`. Returns whether it did.
    fn end_load( &self, id: u64 ) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else( PoisonError::into_inner );
        let ours = matches!( in_flight.as_ref(), Some( ( current, _ ) ) if *current == id );
        if ours {
            *in_flight = None;
        }
        ours
    }


    fn cancel_in_flight( &self ) {
        if let Some( ( _, token ) ) = self.in_flight.lock().unwrap_or_else( PoisonError::into_inner ).take() {
            token.cancel();
        }
    }


    /// Swaps a built graph in under the gate.
    fn install( &self, pending: PendingGraph, token: &CancellationToken ) -> Result<LoadOutcome, PlayerError> {
        let mut live = self.live();

        if token.is_cancelled() {
            tracing::debug!( "Discarding built graph for {:?}", pending.path() );
            return Ok( LoadOutcome::Cancelled );
        }

        // Settings may have changed while building
        pending.refresh( &self.equalizer_profile(), self.volume() );

        // A pause issued while loading carries over to the new graph
        let paused = self.shared.get() == PlaybackState::Paused;

        // Only one graph may hold the output: release the old one before opening
        if let Some( previous ) = live.take() {
            tracing::debug!( "Replacing {:?}", previous.path() );
            drop( previous );
        }

        let graph = pending.start( self.backend.as_ref(), Arc::clone( &self.shared ) )?;
        let state = if paused {
            PlaybackState::Paused
        } else {
            graph.resume()?;
            PlaybackState::Playing
        };

        let path = graph.path().to_path_buf();
        let duration = graph.duration();
        *live = Some( graph );

        self.shared.set( state );
        self.events.emit( &PlayerEvent::TrackChanged { path, duration } );
        Ok( LoadOutcome::Playing )
    }


    /// Puts the state back in line with the live graph after a load that did not install.
    fn restore_state( &self ) {
        let live = self.live();
        let state = match live.as_ref() {
            None => PlaybackState::Idle,
            Some( graph ) => match graph.end().outcome() {
                Some( ended ) => ended,
                None if graph.is_paused() => PlaybackState::Paused,
                None => PlaybackState::Playing,
            },
        };
        self.shared.set( state );
    }


    /// Pauses playback.
    pub fn pause( &self ) -> Result<(), PlayerError> {
        let live = self.live();
        let graph = live.as_ref().ok_or( PlayerError::NoTrack )?;

        match self.shared.get() {
            PlaybackState::Paused => Ok(()),
            PlaybackState::Playing | PlaybackState::Loading => {
                graph.pause()?;
                self.shared.set( PlaybackState::Paused );
                tracing::info!( "Paused" );
                Ok(())
            }
            state => Err( PlayerError::InvalidState { action: "pause", state } ),
        }
    }


    /// Resumes playback.
    pub fn resume( &self ) -> Result<(), PlayerError> {
        let live = self.live();
        let graph = live.as_ref().ok_or( PlayerError::NoTrack )?;

        match self.shared.get() {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused | PlaybackState::Loading => {
                graph.resume()?;
                self.shared.set( PlaybackState::Playing );
                tracing::info!( "Resumed" );
                Ok(())
            }
            state => Err( PlayerError::InvalidState { action: "resume", state } ),
        }
    }


    /// Stops playback and cancels any load in flight.
    pub fn stop( &self ) -> Result<(), PlayerError> {
        self.cancel_in_flight();

        let mut live = self.live();
        if let Some( graph ) = live.take() {
            graph.end().raise( StopReason::Requested );
            drop( graph );
        }
        self.shared.set( PlaybackState::Stopped );
        Ok(())
    }


    /// Seeks within the current track. Only valid while playing or paused.
    ///
    /// The engine lock is released while the decode worker repositions.
    pub fn seek( &self, position: Duration ) -> Result<Duration, PlayerError> {
        let pending = {
            let live = self.live();
            let graph = live.as_ref().ok_or( PlayerError::NoTrack )?;

            match self.shared.get() {
                PlaybackState::Playing | PlaybackState::Paused => {
                    tracing::info!( "Seeking to {:?} in {:?}", position, graph.path() );
                    graph.request_seek( position )?
                }
                state => return Err( PlayerError::InvalidState { action: "seek", state } ),
            }
        };

        graph::await_seek( pending, self.config.seek_timeout )
    }


    /// Replaces the equalizer profile on the live graph and for future graphs.
    pub fn set_equalizer_profile( &self, profile: EqualizerProfile ) {
        *self.profile.write().unwrap_or_else( PoisonError::into_inner ) = profile.clone();

        let live = self.live();
        if let Some( graph ) = live.as_ref() {
            graph.equalizer().update_profile( &profile );
        }
    }


    pub fn equalizer_profile( &self ) -> EqualizerProfile {
        self.profile.read().unwrap_or_else( PoisonError::into_inner ).clone()
    }


    /// Sets the volume level, clamped to [0.0, 1.0].
    pub fn set_volume( &self, volume: f32 ) {
        let volume = clamp_volume( volume );
        *self.volume.write().unwrap_or_else( PoisonError::into_inner ) = volume;

        let live = self.live();
        if let Some( graph ) = live.as_ref() {
            graph.volume().set( volume );
        }
    }


    /// Gets the current volume level.
    pub fn volume( &self ) -> f32 {
        *self.volume.read().unwrap_or_else( PoisonError::into_inner )
    }


    /// Gets the current playback state.
    pub fn state( &self ) -> PlaybackState {
        self.shared.get()
    }


    /// Gets the current playback position.
    pub fn position( &self ) -> Duration {
        self.live().as_ref().map( LiveGraph::position ).unwrap_or( Duration::ZERO )
    }


    /// Gets the total duration of the current track.
    pub fn duration( &self ) -> Option<Duration> {
        self.live().as_ref().and_then( LiveGraph::duration )
    }


    /// Gets the current track path, if any.
    pub fn current_track( &self ) -> Option<PathBuf> {
        self.live().as_ref().map( |graph| graph.path().to_path_buf() )
    }


    /// Copy of the latest spectrum frame of the live graph.
    pub fn spectrum( &self ) -> Option<SpectrumFrame> {
        self.live().as_ref().and_then( LiveGraph::spectrum )
    }


    /// Registers an event callback. See [`crate::events`] for the rules callbacks must follow.
    pub fn subscribe<F>( &self, callback: F ) -> SubscriptionId
    where
        F: Fn( &PlayerEvent ) + Send + Sync + 'static,
    {
        self.events.subscribe( callback )
    }


    pub fn unsubscribe( &self, id: SubscriptionId ) -> bool {
        self.events.unsubscribe( id )
    }


    pub fn config( &self ) -> &EngineConfig {
        &self.config
    }
}


impl Drop for PlaybackEngine {
    fn drop( &mut self ) {
        self.cancel_in_flight();
        // Released without a Stopped notification
        if let Some( graph ) = self.live().take() {
            graph.end().dismiss();
            drop( graph );
        }
    }
}
