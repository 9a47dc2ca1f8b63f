//! Decoder adapter
//!
//! Wraps the available decoding backends behind a single pull interface.
//! A backend is chosen by file extension; if it cannot open the file the
//! other backend is tried before giving up.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{ Time, TimeBase };
use thiserror::Error;


/// Errors that can occur while opening or reading a stream.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Failed to open file: {0}" )]
    FileOpen( #[from] std::io::Error ),

    #[error( "Unsupported format: {0}" )]
    UnsupportedFormat( String ),

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Unreadable file {path:?} ({primary}: {primary_error}; {fallback}: {fallback_error})" )]
    Unreadable {
        path: PathBuf,
        primary: DecoderKind,
        primary_error: Box<DecoderError>,
        fallback: DecoderKind,
        fallback_error: Box<DecoderError>,
    },

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Seek error: {0}" )]
    Seek( String ),
}


/// Decoding backend.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum DecoderKind {
    /// Direct PCM reader for uncompressed WAV files.
    Pcm,

    /// General media framework (probes the container, any supported codec).
    Media,
}


impl DecoderKind {
    /// Picks the primary backend for a path based on its extension.
    pub fn for_path( path: &Path ) -> Self {
        let ext = path
            .extension()
            .and_then( |e| e.to_str() )
            .map( |e| e.to_ascii_lowercase() );

        match ext.as_deref() {
            Some( "wav" ) | Some( "wave" ) => DecoderKind::Pcm,
            _ => DecoderKind::Media,
        }
    }


    /// The backend tried when this one fails.
    pub fn fallback( self ) -> Self {
        match self {
            DecoderKind::Pcm => DecoderKind::Media,
            DecoderKind::Media => DecoderKind::Pcm,
        }
    }
}


impl fmt::Display for DecoderKind {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        match self {
            DecoderKind::Pcm => f.write_str( "pcm" ),
            DecoderKind::Media => f.write_str( "media" ),
        }
    }
}


/// An open, decoder-backed audio stream bound to one file.
///
/// The underlying file handle lives exactly as long as the stream.
pub struct Stream {
    path: PathBuf,
    kind: DecoderKind,
    backend: Backend,
    sample_rate: u32,
    channels: usize,
    total_frames: Option<u64>,
    /// Frames handed out by `read` since the start of the track.
    position_frames: u64,
}


enum Backend {
    Pcm( PcmBackend ),
    Media( MediaBackend ),
}


impl Stream {
    /// Opens a file with the backend picked by extension, falling back to the other one.
    pub fn open( path: &Path ) -> Result<Self, DecoderError> {
        let primary = DecoderKind::for_path( path );

        let primary_error = match Self::open_with( path, primary ) {
            Ok( stream ) => return Ok( stream ),
            Err( e ) => e,
        };

        let fallback = primary.fallback();
        tracing::warn!(
            "{} backend could not open {:?} ({}), trying {} backend",
            primary,
            path,
            primary_error,
            fallback
        );

        Self::open_with( path, fallback ).map_err( |fallback_error| DecoderError::Unreadable {
            path: path.to_path_buf(),
            primary,
            primary_error: Box::new( primary_error ),
            fallback,
            fallback_error: Box::new( fallback_error ),
        })
    }


    /// Opens a file with a specific backend.
    pub fn open_with( path: &Path, kind: DecoderKind ) -> Result<Self, DecoderError> {
        let backend = match kind {
            DecoderKind::Pcm => Backend::Pcm( PcmBackend::open( path )? ),
            DecoderKind::Media => Backend::Media( MediaBackend::open( path )? ),
        };

        let ( sample_rate, channels, total_frames ) = match &backend {
            Backend::Pcm( b ) => ( b.sample_rate, b.channels, Some( b.total_frames ) ),
            Backend::Media( b ) => ( b.sample_rate, b.channels, b.total_frames ),
        };

        tracing::info!(
            "Opened {:?} with {} backend: {} Hz, {} channels, {:?} frames",
            path,
            kind,
            sample_rate,
            channels,
            total_frames
        );

        Ok( Self {
            path: path.to_path_buf(),
            kind,
            backend,
            sample_rate,
            channels,
            total_frames,
            position_frames: 0,
        })
    }


    /// Returns the path this stream was opened from.
    pub fn path( &self ) -> &Path {
        &self.path
    }


    /// Returns the backend that opened the stream.
    pub fn kind( &self ) -> DecoderKind {
        self.kind
    }


    /// Returns the sample rate of the audio.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    /// Returns the number of channels.
    pub fn channels( &self ) -> usize {
        self.channels
    }


    /// Returns the total duration, if the container declares it.
    pub fn duration( &self ) -> Option<Duration> {
        self.total_frames
            .map( |frames| Duration::from_secs_f64( frames as f64 / self.sample_rate as f64 ) )
    }


    /// Returns the current read position.
    pub fn position( &self ) -> Duration {
        Duration::from_secs_f64( self.position_frames as f64 / self.sample_rate as f64 )
    }


    /// Moves the read position. Positions past the end clamp to the end.
    pub fn set_position( &mut self, position: Duration ) -> Result<(), DecoderError> {
        let mut frame = ( position.as_secs_f64() * self.sample_rate as f64 ) as u64;
        if let Some( total ) = self.total_frames {
            frame = frame.min( total );
        }

        self.position_frames = match &mut self.backend {
            Backend::Pcm( b ) => b.seek( frame )?,
            Backend::Media( b ) => {
                b.seek( Duration::from_secs_f64( frame as f64 / self.sample_rate as f64 ) )?
            }
        };

        tracing::debug!( "Seeked {:?} to frame {}", self.path, self.position_frames );
        Ok(())
    }


    /// Fills `buf` with interleaved samples and returns how many were written.
    ///
    /// Only whole frames are written. A return of zero means end of stream.
    pub fn read( &mut self, buf: &mut [f32] ) -> Result<usize, DecoderError> {
        let whole = buf.len() - buf.len() % self.channels;
        let written = match &mut self.backend {
            Backend::Pcm( b ) => b.read( &mut buf[ ..whole ] )?,
            Backend::Media( b ) => b.read( &mut buf[ ..whole ] )?,
        };

        self.position_frames += ( written / self.channels ) as u64;
        Ok( written )
    }
}


impl Drop for Stream {
    fn drop( &mut self ) {
        tracing::debug!( "Closed {:?}", self.path );
    }
}


/// WAV reader backed by `hound`.
struct PcmBackend {
    reader: hound::WavReader<BufReader<File>>,
    sample_rate: u32,
    channels: usize,
    total_frames: u64,
    /// Scale applied to integer samples.
    int_scale: f32,
    float: bool,
}


impl PcmBackend {
    fn open( path: &Path ) -> Result<Self, DecoderError> {
        let reader = hound::WavReader::open( path ).map_err( |e| match e {
            hound::Error::IoError( io ) => DecoderError::FileOpen( io ),
            other => DecoderError::UnsupportedFormat( other.to_string() ),
        })?;

        let spec = reader.spec();
        if spec.channels == 0 {
            return Err( DecoderError::NoAudioTrack );
        }

        let float = spec.sample_format == hound::SampleFormat::Float;
        if !float && !( 1..=32 ).contains( &spec.bits_per_sample ) {
            return Err( DecoderError::UnsupportedFormat(
                format!( "{} bits per sample", spec.bits_per_sample )
            ));
        }

        Ok( Self {
            total_frames: reader.duration() as u64,
            sample_rate: spec.sample_rate,
            channels: spec.channels as usize,
            int_scale: 1.0 / ( 1u64 << ( spec.bits_per_sample.max( 1 ) - 1 ) ) as f32,
            float,
            reader,
        })
    }


    fn read( &mut self, buf: &mut [f32] ) -> Result<usize, DecoderError> {
        let mut written = 0;

        if self.float {
            for ( slot, sample ) in buf.iter_mut().zip( self.reader.samples::<f32>() ) {
                *slot = sample.map_err( |e| DecoderError::Decode( e.to_string() ) )?;
                written += 1;
            }
        } else {
            let scale = self.int_scale;
            for ( slot, sample ) in buf.iter_mut().zip( self.reader.samples::<i32>() ) {
                *slot = sample.map_err( |e| DecoderError::Decode( e.to_string() ) )? as f32 * scale;
                written += 1;
            }
        }

        // A truncated final frame is dropped rather than handed out half-filled
        Ok( written - written % self.channels )
    }


    fn seek( &mut self, frame: u64 ) -> Result<u64, DecoderError> {
        let frame = frame.min( u32::MAX as u64 ) as u32;
        self.reader
            .seek( frame )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;
        Ok( frame as u64 )
    }
}


/// Any container/codec Symphonia can probe.
struct MediaBackend {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_rate: u32,
    channels: usize,
    total_frames: Option<u64>,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Decoded samples not yet handed out, starting at `pending_offset`.
    pending: Vec<f32>,
    pending_offset: usize,
    /// Samples still to drop after a seek landed before the requested frame
    skip: usize,
}


impl MediaBackend {
    fn open( path: &Path ) -> Result<Self, DecoderError> {
        // Network shares get a larger read-ahead buffer
        let buffer_len = if path.starts_with( r"\\" ) {
            256 * 1024
        } else {
            64 * 1024
        };

        let file = File::open( path )?;
        let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions { buffer_len } );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| DecoderError::UnsupportedFormat( e.to_string() ) )?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;
        let sample_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 ).max( 1 );
        let time_base = codec_params.time_base;
        let total_frames = codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        Ok( Self {
            track_id,
            time_base,
            total_frames,
            sample_rate,
            channels,
            format_reader,
            decoder,
            sample_buf: None,
            pending: Vec::new(),
            pending_offset: 0,
            skip: 0,
        })
    }


    fn read( &mut self, buf: &mut [f32] ) -> Result<usize, DecoderError> {
        let mut written = 0;

        while written < buf.len() {
            if self.pending_offset >= self.pending.len() && !self.decode_next()? {
                break;
            }

            let available = &self.pending[ self.pending_offset.. ];
            let n = available.len().min( buf.len() - written );
            buf[ written..written + n ].copy_from_slice( &available[ ..n ] );
            self.pending_offset += n;
            written += n;
        }

        Ok( written )
    }


    /// Decodes the next packet into `pending`. Returns false at end of stream.
    fn decode_next( &mut self ) -> Result<bool, DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( false );
                }
                Err( SymphoniaError::ResetRequired ) => return Ok( false ),
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                // Corrupt packets are skipped, the stream can recover on the next one
                Err( SymphoniaError::DecodeError( e ) ) => {
                    tracing::debug!( "Skipping undecodable packet: {}", e );
                    continue;
                }
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let needs_alloc = self.sample_buf
                .as_ref()
                .map_or( true, |b| b.capacity() < frames );
            if needs_alloc {
                self.sample_buf = Some( SampleBuffer::new( frames as u64, spec ) );
            }

            if let Some( sample_buf ) = self.sample_buf.as_mut() {
                sample_buf.copy_interleaved_ref( decoded );
                self.pending.clear();
                self.pending.extend_from_slice( sample_buf.samples() );

                let dropped = self.skip.min( self.pending.len() );
                self.skip -= dropped;
                self.pending_offset = dropped;
                if self.pending_offset < self.pending.len() {
                    return Ok( true );
                }
            }
        }
    }


    fn seek( &mut self, position: Duration ) -> Result<u64, DecoderError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position.as_secs_f64() ),
            track_id: Some( self.track_id ),
        };

        let seeked = self.format_reader
            .seek( SeekMode::Accurate, seek_to )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;

        // Formats seek to a packet boundary; decode forward to the requested frame
        let actual = self.frame_at( seeked.actual_ts );
        let required = self.frame_at( seeked.required_ts ).max( actual );
        self.skip = ( required - actual ) as usize * self.channels;

        Ok( required )
    }


    fn frame_at( &self, ts: u64 ) -> u64 {
        match self.time_base {
            Some( tb ) => {
                let time = tb.calc_time( ts );
                ( ( time.seconds as f64 + time.frac ) * self.sample_rate as f64 ).round() as u64
            }
            None => ts,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use hound::{ SampleFormat, WavSpec, WavWriter };


    fn write_ramp( path: &Path, channels: u16, frames: u32 ) {
        let spec = WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create( path, spec ).unwrap();
        for frame in 0..frames {
            for _ in 0..channels {
                writer.write_sample( ( frame % 1000 ) as i16 ).unwrap();
            }
        }
        writer.finalize().unwrap();
    }


    #[test]
    fn test_kind_for_path() {
        assert_eq!( DecoderKind::for_path( Path::new( "a/b.WAV" ) ), DecoderKind::Pcm );
        assert_eq!( DecoderKind::for_path( Path::new( "a/b.flac" ) ), DecoderKind::Media );
        assert_eq!( DecoderKind::for_path( Path::new( "noext" ) ), DecoderKind::Media );
        assert_eq!( DecoderKind::Pcm.fallback(), DecoderKind::Media );
    }


    #[test]
    fn test_open_wav_reports_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_ramp( &path, 2, 8000 );

        let stream = Stream::open( &path ).unwrap();
        assert_eq!( stream.kind(), DecoderKind::Pcm );
        assert_eq!( stream.sample_rate(), 8000 );
        assert_eq!( stream.channels(), 2 );
        assert_eq!( stream.duration(), Some( Duration::from_secs( 1 ) ) );
        assert_eq!( stream.position(), Duration::ZERO );
    }


    #[test]
    fn test_read_to_end_then_empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_ramp( &path, 1, 1000 );

        let mut stream = Stream::open( &path ).unwrap();
        let mut buf = vec![ 0.0f32; 256 ];
        let mut total = 0;
        loop {
            let n = stream.read( &mut buf ).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!( total, 1000 );
        assert_eq!( stream.read( &mut buf ).unwrap(), 0 );
        assert_eq!( stream.position(), Duration::from_millis( 125 ) );
    }


    #[test]
    fn test_read_only_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "stereo.wav" );
        write_ramp( &path, 2, 100 );

        let mut stream = Stream::open( &path ).unwrap();
        let mut buf = vec![ 0.0f32; 5 ];
        assert_eq!( stream.read( &mut buf ).unwrap(), 4 );
    }


    #[test]
    fn test_set_position_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_ramp( &path, 1, 8000 );

        let mut stream = Stream::open( &path ).unwrap();
        stream.set_position( Duration::from_millis( 500 ) ).unwrap();
        assert_eq!( stream.position(), Duration::from_millis( 500 ) );

        let mut buf = [ 0.0f32; 1 ];
        stream.read( &mut buf ).unwrap();
        // Frame 4000 holds 4000 % 1000 == 0
        assert_eq!( buf[ 0 ], 0.0 );
    }


    #[test]
    fn test_set_position_past_end_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_ramp( &path, 1, 8000 );

        for kind in [ DecoderKind::Pcm, DecoderKind::Media ] {
            let mut stream = Stream::open_with( &path, kind ).unwrap();
            stream.set_position( Duration::from_secs( 100 ) ).unwrap();
            assert_eq!( stream.position(), Duration::from_secs( 1 ), "{} backend", kind );
        }
    }


    #[test]
    fn test_media_seek_lands_on_requested_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_ramp( &path, 1, 8000 );

        let mut stream = Stream::open_with( &path, DecoderKind::Media ).unwrap();
        stream.set_position( Duration::from_millis( 500 ) ).unwrap();
        assert_eq!( stream.position(), Duration::from_millis( 500 ) );

        let mut buf = [ 1.0f32; 2 ];
        assert_eq!( stream.read( &mut buf ).unwrap(), 2 );
        // Frames 4000 and 4001 hold 0 and 1
        assert_eq!( buf[ 0 ], 0.0 );
        assert!( buf[ 1 ] > 0.0 );
    }


    #[test]
    fn test_missing_file_is_unreadable() {
        let result = Stream::open( Path::new( "/definitely/not/here.wav" ) );
        assert!( matches!( result, Err( DecoderError::Unreadable { primary: DecoderKind::Pcm, .. } ) ) );
    }


    #[test]
    fn test_garbage_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "junk.mp3" );
        std::fs::write( &path, b"this is not audio at all" ).unwrap();

        let result = Stream::open( &path );
        assert!( matches!( result, Err( DecoderError::Unreadable { primary: DecoderKind::Media, .. } ) ) );
    }
}
