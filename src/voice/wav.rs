//! PCM and WAV helpers

use crate::{Error, Result};

/// Sample rate of device audio (16kHz mono speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Decode little-endian 16-bit PCM bytes into samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian 16-bit PCM bytes
#[must_use]
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert 16-bit samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Read a mono 16-bit WAV file back into samples and its sample rate
///
/// # Errors
///
/// Returns error if the data is not 16-bit integer WAV
pub fn wav_to_samples(data: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(data))
        .map_err(|e| Error::Audio(e.to_string()))?;

    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::Audio(format!(
            "expected 16-bit integer PCM, got {} bits {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_byte_order() {
        let bytes = pcm_to_le_bytes(&[1, -2, 300]);
        assert_eq!(bytes, vec![1, 0, 0xFE, 0xFF, 0x2C, 0x01]);
        assert_eq!(pcm_from_le_bytes(&bytes), vec![1, -2, 300]);
    }

    #[test]
    fn test_pcm_ignores_odd_trailing_byte() {
        assert_eq!(pcm_from_le_bytes(&[0x10, 0x00, 0x7F]), vec![16]);
    }

    #[test]
    fn test_samples_to_wav_header() {
        let wav = samples_to_wav(&[0, 100, -100, i16::MAX], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let (samples, rate) = wav_to_samples(&wav).unwrap();
        assert_eq!(rate, SAMPLE_RATE);
        assert_eq!(samples, vec![0, 100, -100, i16::MAX]);
    }
}
