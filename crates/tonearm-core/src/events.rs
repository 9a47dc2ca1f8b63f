//! Engine notifications
//!
//! A plain list of callbacks. Each event is delivered synchronously on the
//! thread that detected it: control events on the caller's or decode
//! worker's thread, spectrum frames on the output thread.
//!
//! Callbacks must return quickly and must not call transport controls
//! (`load_and_play`, `stop`, ...) on the engine; forward to a channel instead.

use std::path::PathBuf;
use std::sync::{ Arc, PoisonError, RwLock };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::Duration;

use crate::player::PlaybackState;
use crate::spectrum::SpectrumFrame;


/// Why a graph stopped.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum StopReason {
    /// The decoder ran out and the output drained.
    EndOfStream,

    /// `stop()` was called.
    Requested,

    /// Decoding failed mid-stream.
    Error( String ),
}


/// Events emitted by the engine.
#[derive( Debug, Clone )]
pub enum PlayerEvent {
    TrackChanged { path: PathBuf, duration: Option<Duration> },
    StateChanged { state: PlaybackState },
    Stopped { path: PathBuf, reason: StopReason },
    Spectrum( SpectrumFrame ),
}


/// Handle returned by [`EventHub::subscribe`].
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub struct SubscriptionId( u64 );


type Callback = Arc<dyn Fn( &PlayerEvent ) + Send + Sync>;


/// Subscriber list.
#[derive( Default )]
pub struct EventHub {
    subscribers: RwLock<Vec<( SubscriptionId, Callback )>>,
    next_id: AtomicU64,
}


impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }


    /// Registers a callback for every future event.
    pub fn subscribe<F>( &self, callback: F ) -> SubscriptionId
    where
        F: Fn( &PlayerEvent ) + Send + Sync + 'static,
    {
        let id = SubscriptionId( self.next_id.fetch_add( 1, Ordering::Relaxed ) );
        self.subscribers
            .write()
            .unwrap_or_else( PoisonError::into_inner )
            .push( ( id, Arc::new( callback ) ) );
        id
    }


    /// Removes a callback. Returns false if it was not registered.
    pub fn unsubscribe( &self, id: SubscriptionId ) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else( PoisonError::into_inner );
        let before = subscribers.len();
        subscribers.retain( |( sid, _ )| *sid != id );
        subscribers.len() != before
    }


    pub fn subscriber_count( &self ) -> usize {
        self.subscribers.read().unwrap_or_else( PoisonError::into_inner ).len()
    }


    /// Delivers an event to every subscriber.
    ///
    /// The list is copied first, so callbacks may subscribe or unsubscribe.
    pub fn emit( &self, event: &PlayerEvent ) {
        let callbacks: Vec<Callback> = self.subscribers
            .read()
            .unwrap_or_else( PoisonError::into_inner )
            .iter()
            .map( |( _, cb )| Arc::clone( cb ) )
            .collect();

        for callback in callbacks {
            callback( event );
        }
    }


    /// Delivers an event from the real-time thread.
    ///
    /// Never waits: if the list is being modified the event is dropped.
    pub fn emit_realtime( &self, event: &PlayerEvent ) -> bool {
        match self.subscribers.try_read() {
            Ok( subscribers ) => {
                for ( _, callback ) in subscribers.iter() {
                    callback( event );
                }
                true
            }
            Err( _ ) => false,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::sync::Mutex;


    #[test]
    fn test_emit_reaches_all_subscribers() {
        let hub = EventHub::new();
        let seen = Arc::new( Mutex::new( Vec::new() ) );

        for tag in 0..3 {
            let seen = Arc::clone( &seen );
            hub.subscribe( move |event| {
                if let PlayerEvent::StateChanged { state } = event {
                    seen.lock().unwrap().push( ( tag, *state ) );
                }
            });
        }

        hub.emit( &PlayerEvent::StateChanged { state: PlaybackState::Playing } );
        assert_eq!( seen.lock().unwrap().len(), 3 );
    }


    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new();
        let count = Arc::new( AtomicU64::new( 0 ) );
        let counter = Arc::clone( &count );
        let id = hub.subscribe( move |_| {
            counter.fetch_add( 1, Ordering::Relaxed );
        });

        hub.emit( &PlayerEvent::StateChanged { state: PlaybackState::Idle } );
        assert!( hub.unsubscribe( id ) );
        assert!( !hub.unsubscribe( id ) );
        hub.emit( &PlayerEvent::StateChanged { state: PlaybackState::Idle } );

        assert_eq!( count.load( Ordering::Relaxed ), 1 );
        assert_eq!( hub.subscriber_count(), 0 );
    }


    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let hub = Arc::new( EventHub::new() );
        let inner = Arc::clone( &hub );
        hub.subscribe( move |_| {
            inner.subscribe( |_| {} );
        });

        hub.emit( &PlayerEvent::StateChanged { state: PlaybackState::Stopped } );
        assert_eq!( hub.subscriber_count(), 2 );
    }
}
