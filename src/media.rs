//! Voice transcoding glue: SILK blobs in, MP3 files out.
//!
//! The SILK decoder and LAME encoder are external codecs; this module
//! defines the seams they plug into and owns the streaming glue between
//! them. An embedding application injects implementations; the export
//! pipeline only ever sees [`Transcoder`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::{VOICE_MP3_QUALITY, VOICE_SAMPLE_RATE};
use crate::error::MediaError;

/// Decodes a SILK bitstream into 16-bit PCM at a requested rate.
pub trait SilkDecoder: Send + Sync {
    fn decode(&self, silk: &[u8], sample_rate: u32) -> Result<Vec<i16>, MediaError>;
}

/// Encodes mono 16-bit PCM into an MP3 stream.
pub trait Mp3Encoder: Send + Sync {
    fn encode(
        &self,
        pcm: &[i16],
        config: &EncoderConfig,
        dst: &mut dyn Write,
    ) -> Result<(), MediaError>;
}

/// Fixed encoder parameters for exported voice messages.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub input_rate: u32,
    pub output_rate: u32,
    pub channels: u8,
    pub quality: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_rate: VOICE_SAMPLE_RATE,
            output_rate: VOICE_SAMPLE_RATE,
            channels: 1,
            quality: VOICE_MP3_QUALITY,
        }
    }
}

/// A decoder/encoder pair wired together for the voice export phase.
pub struct Transcoder {
    decoder: Box<dyn SilkDecoder>,
    encoder: Box<dyn Mp3Encoder>,
}

impl Transcoder {
    pub fn new(decoder: Box<dyn SilkDecoder>, encoder: Box<dyn Mp3Encoder>) -> Self {
        Self { decoder, encoder }
    }

    /// Transcodes one SILK blob into an MP3 file at `dst`.
    ///
    /// The PCM buffer lives entirely in memory. An empty decode fails
    /// before the destination is created, so a bad blob leaves nothing
    /// behind.
    pub fn silk_to_mp3(&self, silk: &[u8], dst: &Path) -> Result<(), MediaError> {
        let pcm = self.decoder.decode(silk, VOICE_SAMPLE_RATE)?;
        if pcm.is_empty() {
            return Err(MediaError::TranscodeEmpty);
        }

        let mut writer = BufWriter::new(File::create(dst)?);
        self.encoder.encode(&pcm, &EncoderConfig::default(), &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Treats every input pair of bytes as one little-endian sample.
    pub(crate) struct PassthroughDecoder;

    impl SilkDecoder for PassthroughDecoder {
        fn decode(&self, silk: &[u8], _sample_rate: u32) -> Result<Vec<i16>, MediaError> {
            Ok(silk
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect())
        }
    }

    /// Writes samples back out little-endian with a marker prefix.
    pub(crate) struct RawEncoder;

    impl Mp3Encoder for RawEncoder {
        fn encode(
            &self,
            pcm: &[i16],
            config: &EncoderConfig,
            dst: &mut dyn Write,
        ) -> Result<(), MediaError> {
            assert_eq!(config.channels, 1);
            dst.write_all(b"MP3!")?;
            for sample in pcm {
                dst.write_all(&sample.to_le_bytes())?;
            }
            Ok(())
        }
    }

    pub(crate) fn fake_transcoder() -> Transcoder {
        Transcoder::new(Box::new(PassthroughDecoder), Box::new(RawEncoder))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::testutil::fake_transcoder;
    use super::*;

    #[test]
    fn transcodes_through_both_codecs() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("42.mp3");

        fake_transcoder().silk_to_mp3(&[0x01, 0x00, 0xFF, 0x7F], &dst).unwrap();

        let out = std::fs::read(&dst).unwrap();
        assert_eq!(&out[..4], b"MP3!");
        assert_eq!(&out[4..], &[0x01, 0x00, 0xFF, 0x7F]);
    }

    #[test]
    fn empty_decode_creates_no_file() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("silent.mp3");

        match fake_transcoder().silk_to_mp3(&[], &dst) {
            Err(MediaError::TranscodeEmpty) => {}
            other => panic!("expected TranscodeEmpty, got {other:?}"),
        }
        assert!(!dst.exists());
    }
}
