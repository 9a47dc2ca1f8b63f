//! Application settings management
//!
//! Persists the volume and equalizer profile between runs. Anything
//! unreadable falls back to defaults; stored bands are coerced, not rejected.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };
use tonearm_core::equalizer::DEFAULT_Q;
use tonearm_core::volume::clamp_volume;
use tonearm_core::{ BandSetting, EqualizerProfile };


/// One stored equalizer band.
#[derive( Debug, Clone, Copy, PartialEq, Serialize, Deserialize )]
pub struct StoredBand {
    pub frequency: f32,
    pub gain_db: f32,
    #[serde( default = "default_q" )]
    pub q: f32,
}


fn default_q() -> f32 {
    DEFAULT_Q
}


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Playback volume (0.0 to 1.0)
    pub volume: f32,

    /// Equalizer bands, lowest first
    pub equalizer: Vec<StoredBand>,
}


impl Default for Settings {
    fn default() -> Self {
        let mut settings = Self { volume: 1.0, equalizer: Vec::new() };
        settings.set_profile( &EqualizerProfile::flat() );
        settings
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "tonearm" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    pub fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( path ) {
            Ok( contents ) => {
                serde_json::from_str( &contents ).unwrap_or_else( |e| {
                    tracing::warn!( "Ignoring unreadable settings {:?}: {}", path, e );
                    Self::default()
                })
            }
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        if let Some( path ) = Self::settings_path() {
            self.save_to( &path );
        }
    }


    pub fn save_to( &self, path: &Path ) {
        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    /// Stored volume, clamped.
    pub fn volume( &self ) -> f32 {
        clamp_volume( self.volume )
    }


    /// Stored equalizer as a complete profile.
    pub fn profile( &self ) -> EqualizerProfile {
        EqualizerProfile::new(
            self.equalizer
                .iter()
                .map( |b| BandSetting::new( b.frequency, b.gain_db, b.q ) )
        )
    }


    pub fn set_profile( &mut self, profile: &EqualizerProfile ) {
        self.equalizer = profile
            .bands()
            .iter()
            .map( |b| StoredBand { frequency: b.frequency, gain_db: b.gain_db, q: b.q } )
            .collect();
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "nested" ).join( "settings.json" );

        let mut settings = Settings { volume: 0.4, ..Settings::default() };
        settings.set_profile( &EqualizerProfile::flat().with_gain( 3, 4.5 ) );
        settings.save_to( &path );

        let loaded = Settings::load_from( &path );
        assert_eq!( loaded, settings );
        assert_eq!( loaded.profile().bands()[ 3 ].gain_db, 4.5 );
    }


    #[test]
    fn test_missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        assert_eq!( Settings::load_from( &path ), Settings::default() );

        fs::write( &path, "{ not json" ).unwrap();
        assert_eq!( Settings::load_from( &path ), Settings::default() );
    }


    #[test]
    fn test_stored_values_are_coerced() {
        let json = r#"{ "volume": 4.0, "equalizer": [ { "frequency": 31.0, "gain_db": 40.0, "q": 0.0 } ] }"#;
        let settings: Settings = serde_json::from_str( json ).unwrap();

        assert_eq!( settings.volume(), 1.0 );
        let profile = settings.profile();
        assert_eq!( profile.bands().len(), 10 );
        assert_eq!( profile.bands()[ 0 ].gain_db, 12.0 );
        assert_eq!( profile.bands()[ 0 ].q, DEFAULT_Q );
    }
}
