//! Command-line argument parsing for Tonearm.

use std::path::PathBuf;

use clap::Parser;
use tonearm_core::equalizer::{ DEFAULT_FREQUENCIES, DEFAULT_Q };
use tonearm_core::{ BandSetting, EqualizerProfile };


/// Tonearm - play audio files through a ten-band equalizer with a live spectrum meter.
#[derive( Parser, Debug )]
#[command( name = "tonearm" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Files to play, in order.
    #[arg( required = true )]
    pub files: Vec<PathBuf>,

    /// Volume from 0.0 to 1.0. Defaults to the saved volume.
    #[arg( long )]
    pub volume: Option<f32>,

    /// Comma-separated band gains in dB, lowest band first (e.g. "3,2,0,0,0,0,0,0,1,2").
    #[arg( long, value_parser = parse_gains, allow_hyphen_values = true )]
    pub eq: Option<EqualizerProfile>,

    /// Number of spectrum bands to display.
    #[arg( long, default_value_t = tonearm_core::spectrum::DEFAULT_BANDS )]
    pub bands: usize,

    /// Do not draw the spectrum meter.
    #[arg( long )]
    pub no_meter: bool,

    /// Save the volume and equalizer as the new defaults.
    #[arg( long )]
    pub save: bool,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg( short, long, action = clap::ArgAction::Count )]
    pub verbose: u8,
}


/// Parses `--eq`: up to ten gains for the default band frequencies.
///
/// Unlike profiles loaded from settings, out-of-range values are rejected
/// instead of clamped.
pub fn parse_gains( value: &str ) -> Result<EqualizerProfile, String> {
    let gains = value
        .split( ',' )
        .map( str::trim )
        .enumerate()
        .map( |( index, gain )| {
            gain.parse::<f32>()
                .map_err( |_| format!( "band {}: {:?} is not a number", index, gain ) )
        })
        .collect::<Result<Vec<_>, _>>()?;

    if gains.len() > DEFAULT_FREQUENCIES.len() {
        return Err( format!( "expected at most {} gains, got {}", DEFAULT_FREQUENCIES.len(), gains.len() ) );
    }

    let bands = DEFAULT_FREQUENCIES
        .iter()
        .zip( gains.iter().copied().chain( std::iter::repeat( 0.0 ) ) )
        .map( |( &frequency, gain_db )| BandSetting::new( frequency, gain_db, DEFAULT_Q ) );

    EqualizerProfile::strict( bands ).map_err( |e| e.to_string() )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_gains_pads_missing_bands() {
        let profile = parse_gains( "3, -2.5" ).unwrap();
        assert_eq!( profile.bands().len(), 10 );
        assert_eq!( profile.bands()[ 0 ].gain_db, 3.0 );
        assert_eq!( profile.bands()[ 1 ].gain_db, -2.5 );
        assert!( profile.bands()[ 2.. ].iter().all( |b| b.gain_db == 0.0 ) );
    }


    #[test]
    fn test_parse_gains_rejects_bad_input() {
        assert!( parse_gains( "1,2,x" ).is_err() );
        assert!( parse_gains( "13" ).is_err() );
        assert!( parse_gains( "0,0,0,0,0,0,0,0,0,0,0" ).is_err() );
        assert!( parse_gains( "" ).is_err() );
    }


    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from( [ "tonearm", "--eq", "-3,0,6", "--volume", "0.5", "-vv", "a.wav", "b.flac" ] ).unwrap();
        assert_eq!( args.files.len(), 2 );
        assert_eq!( args.volume, Some( 0.5 ) );
        assert_eq!( args.verbose, 2 );
        assert_eq!( args.eq.unwrap().bands()[ 0 ].gain_db, -3.0 );
        assert_eq!( args.bands, 32 );
    }
}
