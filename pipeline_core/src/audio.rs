// WAV decoding, concatenation and the open-ended header used for streaming.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{PipelineError, Result};

/// PCM content of one chunk.
#[derive(Debug, Clone)]
pub struct DecodedWav {
    pub spec: WavSpec,
    pub samples: Vec<i16>,
}

/// Decode a 16-bit integer PCM WAV blob.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedWav> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(PipelineError::Audio(format!(
            "expected 16-bit PCM, got {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(DecodedWav { spec, samples })
}

/// Interleaved zero samples lasting `seconds`.
pub fn silence(spec: &WavSpec, seconds: f32) -> Vec<i16> {
    let frames = (seconds.max(0.0) * spec.sample_rate as f32).round() as usize;
    vec![0; frames * spec.channels as usize]
}

fn same_format(a: &WavSpec, b: &WavSpec) -> bool {
    a.sample_rate == b.sample_rate && a.channels == b.channels && a.bits_per_sample == b.bits_per_sample
}

/// Concatenate WAV blobs in order with `pause` seconds of silence between
/// them. All inputs must share sample rate and channel layout.
pub fn concat_wav<B: AsRef<[u8]>>(chunks: &[B], pause: f32) -> Result<Vec<u8>> {
    let mut decoded = chunks.iter().map(|c| decode_wav(c.as_ref()));
    let first = decoded
        .next()
        .ok_or_else(|| PipelineError::Audio("nothing to concatenate".to_string()))??;
    let spec = first.spec;
    let gap = silence(&spec, pause);

    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut out, spec)?;
        for sample in &first.samples {
            writer.write_sample(*sample)?;
        }
        for next in decoded {
            let next = next?;
            if !same_format(&spec, &next.spec) {
                return Err(PipelineError::Audio(format!(
                    "chunk format {}Hz/{}ch does not match {}Hz/{}ch",
                    next.spec.sample_rate, next.spec.channels, spec.sample_rate, spec.channels
                )));
            }
            for sample in gap.iter().chain(next.samples.iter()) {
                writer.write_sample(*sample)?;
            }
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}

/// RIFF header for a stream whose length is not known up front. Sizes are
/// set to the maximum so players keep reading until the connection closes.
pub fn streaming_header(spec: &WavSpec) -> Vec<u8> {
    let num_channels = spec.channels;
    let bits_per_sample: u16 = 16;
    let byte_rate: u32 = spec.sample_rate * num_channels as u32 * (bits_per_sample as u32 / 8);
    let block_align: u16 = num_channels * (bits_per_sample / 8);
    let data_size: u32 = u32::MAX - 36;
    let riff_size: u32 = u32::MAX;

    let mut out = Vec::<u8>::with_capacity(44);

    // RIFF header
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&num_channels.to_le_bytes());
    out.extend_from_slice(&spec.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out
}

/// Little-endian PCM bytes for a sample slice.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Encode samples as a complete WAV file.
pub fn encode_wav(spec: WavSpec, samples: &[i16]) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut out, spec)?;
        for sample in samples {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(sample_rate: u32) -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_concat_inserts_pause_between_chunks_only() {
        let a = encode_wav(spec(1000), &[1, 1]).unwrap();
        let b = encode_wav(spec(1000), &[2, 2, 2]).unwrap();
        let merged = decode_wav(&concat_wav(&[a, b], 0.005).unwrap()).unwrap();
        assert_eq!(merged.samples, vec![1, 1, 0, 0, 0, 0, 0, 2, 2, 2]);
    }

    #[test]
    fn test_concat_rejects_mixed_sample_rates() {
        let a = encode_wav(spec(1000), &[1]).unwrap();
        let b = encode_wav(spec(2000), &[2]).unwrap();
        assert!(matches!(concat_wav(&[a, b], 0.0), Err(PipelineError::Audio(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav").is_err());
    }

    #[test]
    fn test_streaming_header_layout() {
        let header = streaming_header(&spec(24000));
        assert_eq!(header.len(), 44);
        assert_eq!(&header[..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([header[24], header[25], header[26], header[27]]), 24000);
        assert_eq!(&header[36..40], b"data");
    }

    #[test]
    fn test_pcm_bytes_little_endian() {
        assert_eq!(pcm_bytes(&[1, -1]), vec![1, 0, 0xff, 0xff]);
    }
}
