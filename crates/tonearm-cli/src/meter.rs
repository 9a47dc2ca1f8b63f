//! Single-line spectrum meter and status formatting.

use std::path::Path;
use std::time::Duration;

use tonearm_core::PlaybackState;


const GLYPHS: [char; 8] = [ '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█' ];


/// Renders band values in [0, 1] as block glyphs, one per band.
pub fn bars( values: &[f32] ) -> String {
    values
        .iter()
        .map( |&v| {
            let v = if v.is_finite() { v.clamp( 0.0, 1.0 ) } else { 0.0 };
            let index = ( v * ( GLYPHS.len() - 1 ) as f32 ).round() as usize;
            GLYPHS[ index.min( GLYPHS.len() - 1 ) ]
        })
        .collect()
}


/// Formats time as M:SS.
pub fn format_time( d: Duration ) -> String {
    let secs = d.as_secs();
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


fn state_label( state: PlaybackState ) -> &'static str {
    match state {
        PlaybackState::Idle => "idle",
        PlaybackState::Loading => "loading",
        PlaybackState::Playing => "playing",
        PlaybackState::Paused => "paused",
        PlaybackState::Stopped => "stopped",
        PlaybackState::EndOfStream => "ended",
    }
}


/// One status line: state, file name, position and the meter.
pub fn status_line(
    state: PlaybackState,
    path: Option<&Path>,
    position: Duration,
    duration: Option<Duration>,
    values: &[f32],
) -> String {
    let name = path
        .and_then( |p| p.file_name() )
        .map( |n| n.to_string_lossy().into_owned() )
        .unwrap_or_else( || "No track".to_string() );

    let time = match duration {
        Some( total ) => format!( "{} / {}", format_time( position ), format_time( total ) ),
        None => format_time( position ),
    };

    format!( "[{}] {} {} {}", state_label( state ), name, time, bars( values ) )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_bars_maps_range_to_glyphs() {
        assert_eq!( bars( &[ 0.0, 1.0, 0.5 ] ), "▁█▅" );
        assert_eq!( bars( &[ -1.0, 7.0, f32::NAN ] ), "▁█▁" );
        assert_eq!( bars( &[] ), "" );
    }


    #[test]
    fn test_format_time() {
        assert_eq!( format_time( Duration::from_secs( 0 ) ), "0:00" );
        assert_eq!( format_time( Duration::from_millis( 65_900 ) ), "1:05" );
        assert_eq!( format_time( Duration::from_secs( 3600 ) ), "60:00" );
    }


    #[test]
    fn test_status_line() {
        let line = status_line(
            PlaybackState::Playing,
            Some( Path::new( "/music/song.flac" ) ),
            Duration::from_secs( 5 ),
            Some( Duration::from_secs( 125 ) ),
            &[ 0.0, 1.0 ],
        );
        assert_eq!( line, "[playing] song.flac 0:05 / 2:05 ▁█" );

        let idle = status_line( PlaybackState::Idle, None, Duration::ZERO, None, &[] );
        assert_eq!( idle, "[idle] No track 0:00 " );
    }
}
