//! WAV chunk handling and container merging
//!
//! Recording slices the microphone feed into short, individually valid WAV
//! files. Before dispatching a speech span we rebuild a single container:
//! payload bytes from every chunk are concatenated and one new header is
//! synthesized, so downstream decoders see an ordinary WAV file rather than
//! a stack of headers.

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::PipelineError;

/// Canonical PCM header length: RIFF descriptor + fmt sub-chunk + data header
const WAV_HEADER_LEN: usize = 44;

/// Format parameters captured from a WAV `fmt ` sub-chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
        }
    }

    fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }
}

/// One timer-sliced recording fragment: a complete WAV file with its own
/// header. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    bytes: Vec<u8>,
}

impl AudioChunk {
    /// Wrap already-encoded WAV bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encode f32 samples (range [-1.0, 1.0]) into a 16-bit PCM WAV chunk.
    pub fn from_samples(samples: &[f32], format: &WavFormat) -> Result<Self, PipelineError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut buffer, spec)?;
            for &sample in samples {
                let clipped = sample.clamp(-1.0, 1.0);
                let amplitude = (clipped * i16::MAX as f32) as i16;
                writer.write_sample(amplitude)?;
            }
            writer.finalize()?;
        }
        Ok(Self {
            bytes: buffer.into_inner(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Raw PCM payload of this chunk's `data` sub-chunk.
    pub fn payload(&self) -> Result<&[u8], PipelineError> {
        let parsed = parse_container(&self.bytes)?;
        Ok(&self.bytes[parsed.data_range.clone()])
    }

    /// Format parameters declared by this chunk's header.
    pub fn format(&self) -> Result<WavFormat, PipelineError> {
        Ok(parse_container(&self.bytes)?.format)
    }
}

/// A single reconstructed WAV payload built from one or more chunks
#[derive(Debug, Clone)]
pub struct MergedContainer {
    pub bytes: Vec<u8>,
    pub format: WavFormat,
}

struct ParsedContainer {
    format: WavFormat,
    data_range: std::ops::Range<usize>,
}

/// Walk a RIFF/WAVE sub-chunk list, capturing the `fmt ` fields and the
/// `data` payload range. Optional sub-chunks between them (`LIST`, `fact`,
/// cue points) are skipped, including their odd-size padding byte.
fn parse_container(bytes: &[u8]) -> Result<ParsedContainer, PipelineError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(PipelineError::InvalidAudio(
            "missing RIFF/WAVE signature".to_string(),
        ));
    }

    let mut format: Option<WavFormat> = None;
    let mut data_range: Option<std::ops::Range<usize>> = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = body_start + size;
        if body_end > bytes.len() {
            return Err(PipelineError::InvalidAudio(format!(
                "truncated '{}' sub-chunk: declared {} bytes, {} available",
                String::from_utf8_lossy(id),
                size,
                bytes.len() - body_start
            )));
        }

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(PipelineError::InvalidAudio(
                        "fmt sub-chunk shorter than 16 bytes".to_string(),
                    ));
                }
                let body = &bytes[body_start..body_end];
                format = Some(WavFormat {
                    channels: u16::from_le_bytes([body[2], body[3]]),
                    sample_rate: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
                });
            }
            b"data" => {
                data_range = Some(body_start..body_end);
            }
            _ => {} // optional metadata sub-chunk, skip
        }

        // sub-chunks are word-aligned; odd sizes carry a padding byte
        offset = body_end + (size & 1);
    }

    match (format, data_range) {
        (Some(format), Some(data_range)) => Ok(ParsedContainer { format, data_range }),
        (None, _) => Err(PipelineError::InvalidAudio(
            "no fmt sub-chunk found".to_string(),
        )),
        (_, None) => Err(PipelineError::InvalidAudio(
            "no data sub-chunk found".to_string(),
        )),
    }
}

/// Synthesize a canonical 44-byte PCM header for `data_len` payload bytes.
fn synthesize_header(format: &WavFormat, data_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(WAV_HEADER_LEN);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM format tag
    header.extend_from_slice(&format.channels.to_le_bytes());
    header.extend_from_slice(&format.sample_rate.to_le_bytes());
    header.extend_from_slice(&format.byte_rate().to_le_bytes());
    header.extend_from_slice(&format.block_align().to_le_bytes());
    header.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&(data_len as u32).to_le_bytes());
    header
}

/// Rebuild one valid WAV container from a sequence of header-bearing chunks.
///
/// A single chunk is returned unchanged, byte for byte. Otherwise the first
/// chunk's format parameters win, every chunk contributes only its `data`
/// payload (zero-length payloads contribute zero bytes), and a fresh header
/// sized to the concatenation is synthesized.
pub fn merge(chunks: &[AudioChunk]) -> Result<MergedContainer, PipelineError> {
    match chunks {
        [] => Err(PipelineError::InvalidAudio(
            "cannot merge zero chunks".to_string(),
        )),
        [only] => {
            let parsed = parse_container(only.bytes())?;
            Ok(MergedContainer {
                bytes: only.bytes().to_vec(),
                format: parsed.format,
            })
        }
        _ => {
            let first = parse_container(chunks[0].bytes())?;
            let mut payload: Vec<u8> = Vec::new();
            for chunk in chunks {
                let parsed = parse_container(chunk.bytes())?;
                payload.extend_from_slice(&chunk.bytes()[parsed.data_range]);
            }

            let mut bytes = synthesize_header(&first.format, payload.len());
            bytes.extend_from_slice(&payload);
            Ok(MergedContainer {
                bytes,
                format: first.format,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(samples: &[f32]) -> AudioChunk {
        AudioChunk::from_samples(samples, &WavFormat::mono(16000)).unwrap()
    }

    #[test]
    fn merge_declares_summed_payload_length_and_first_chunk_format() {
        let chunks = vec![
            chunk_of(&[0.1; 160]),
            chunk_of(&[0.2; 320]),
            chunk_of(&[0.3; 80]),
        ];
        let expected_len: usize = chunks.iter().map(|c| c.payload().unwrap().len()).sum();

        let merged = merge(&chunks).unwrap();
        assert_eq!(merged.format, WavFormat::mono(16000));

        let declared = u32::from_le_bytes(merged.bytes[40..44].try_into().unwrap()) as usize;
        assert_eq!(declared, expected_len);
        assert_eq!(merged.bytes.len(), WAV_HEADER_LEN + expected_len);
    }

    #[test]
    fn merged_payload_is_concatenation_in_arrival_order() {
        let a = chunk_of(&[0.5, -0.5, 0.25]);
        let b = chunk_of(&[0.0, 1.0]);
        let mut expected = a.payload().unwrap().to_vec();
        expected.extend_from_slice(b.payload().unwrap());

        let merged = merge(&[a, b]).unwrap();
        assert_eq!(&merged.bytes[WAV_HEADER_LEN..], &expected[..]);
    }

    #[test]
    fn merged_output_decodes_with_a_standard_reader() {
        let chunks = vec![chunk_of(&[0.1; 100]), chunk_of(&[0.2; 100])];
        let merged = merge(&chunks).unwrap();

        let reader = hound::WavReader::new(Cursor::new(merged.bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 200);
    }

    #[test]
    fn single_chunk_is_returned_byte_identical() {
        let chunk = chunk_of(&[0.1, 0.2, 0.3]);
        let merged = merge(std::slice::from_ref(&chunk)).unwrap();
        assert_eq!(merged.bytes, chunk.bytes());
    }

    #[test]
    fn zero_length_data_payload_is_preserved_not_rejected() {
        let empty = chunk_of(&[]);
        let full = chunk_of(&[0.4; 50]);
        let merged = merge(&[empty, full.clone()]).unwrap();
        assert_eq!(
            &merged.bytes[WAV_HEADER_LEN..],
            full.payload().unwrap()
        );
    }

    #[test]
    fn optional_metadata_sub_chunks_are_tolerated() {
        // Hand-build a WAV with a LIST sub-chunk between fmt and data.
        let format = WavFormat::mono(16000);
        let payload = [1u8, 2, 3, 4];
        let list_body = b"INFOIART\x04\x00\x00\x00test";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        let riff_size = 4 + 24 + (8 + list_body.len()) + 8 + payload.len();
        bytes.extend_from_slice(&(riff_size as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&format.channels.to_le_bytes());
        bytes.extend_from_slice(&format.sample_rate.to_le_bytes());
        bytes.extend_from_slice(&format.byte_rate().to_le_bytes());
        bytes.extend_from_slice(&format.block_align().to_le_bytes());
        bytes.extend_from_slice(&format.bits_per_sample.to_le_bytes());
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&(list_body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(list_body);
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let with_list = AudioChunk::from_bytes(bytes);
        assert_eq!(with_list.payload().unwrap(), &payload);

        let plain = chunk_of(&[0.1; 10]);
        let merged = merge(&[with_list, plain.clone()]).unwrap();
        let mut expected = payload.to_vec();
        expected.extend_from_slice(plain.payload().unwrap());
        assert_eq!(&merged.bytes[WAV_HEADER_LEN..], &expected[..]);
    }

    #[test]
    fn malformed_container_is_rejected() {
        let garbage = AudioChunk::from_bytes(b"not a wav file at all".to_vec());
        assert!(matches!(
            garbage.payload(),
            Err(PipelineError::InvalidAudio(_))
        ));

        let truncated = AudioChunk::from_bytes(b"RIFF\x00\x00\x00\x00WAVEdata\xff\x00\x00\x00".to_vec());
        assert!(merge(&[truncated.clone(), truncated]).is_err());
    }
}
