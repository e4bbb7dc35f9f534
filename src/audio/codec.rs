//! # Audio Codec
//!
//! Pure conversion functions used on both the inbound and outbound paths.
//!
//! ## Key Functions:
//! - **G.711**: `decode_g711` / `encode_g711` for A-law and µ-law (ITU-T G.711 segment tables)
//! - **Resampling**: `resample` converts PCM16 between rates by linear interpolation,
//!   carrying a `ResampleState` across the chunks of one utterance
//! - **Container**: `wrap_container` / `unwrap_container` for canonical RIFF/WAVE
//!
//! ## Rust Concepts:
//! - **Pure functions**: nothing here holds state except what the caller threads through
//! - **byteorder**: explicit little-endian reads/writes instead of manual bit shifting

use crate::error::{VoiceError, VoiceResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// G.711 companding law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum G711Law {
    ALaw,
    MuLaw,
}

const QUANT_MASK: u8 = 0x0F;
const SEG_MASK: u8 = 0x70;
const SEG_SHIFT: u8 = 4;
const SIGN_BIT: u8 = 0x80;

const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const ULAW_SEG_END: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

/// Size of the canonical RIFF/WAVE header written by `wrap_container`.
pub const WAV_HEADER_LEN: usize = 44;

fn segment(value: i32, table: &[i32; 8]) -> usize {
    table.iter().position(|&end| value <= end).unwrap_or(table.len())
}

/// Decode a single A-law code word.
pub fn alaw_to_linear(code: u8) -> i16 {
    let a = code ^ 0x55;
    let mut t = ((a & QUANT_MASK) as i32) << 4;
    let seg = (a & SEG_MASK) >> SEG_SHIFT;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & SIGN_BIT != 0 { t as i16 } else { -t as i16 }
}

/// Encode one PCM16 sample as A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &ALAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    let mut aval = (seg as u8) << SEG_SHIFT;
    if seg < 2 {
        aval |= ((pcm >> 1) as u8) & QUANT_MASK;
    } else {
        aval |= ((pcm >> seg) as u8) & QUANT_MASK;
    }
    aval ^ mask
}

/// Decode a single µ-law code word.
pub fn ulaw_to_linear(code: u8) -> i16 {
    let u = !code;
    let mut t = (((u & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= (u & SEG_MASK) >> SEG_SHIFT;
    if u & SIGN_BIT != 0 { (ULAW_BIAS - t) as i16 } else { (t - ULAW_BIAS) as i16 }
}

/// Encode one PCM16 sample as µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let mask = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };

    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &ULAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    let uval = ((seg as u8) << 4) | (((pcm >> (seg + 1)) as u8) & QUANT_MASK);
    uval ^ mask
}

/// Decode G.711 bytes into PCM16 samples.
///
/// Every byte is a valid code word under both laws, so the only malformed
/// input is an empty buffer.
pub fn decode_g711(bytes: &[u8], law: G711Law) -> VoiceResult<Vec<i16>> {
    if bytes.is_empty() {
        return Err(VoiceError::Format("empty G.711 frame".to_string()));
    }

    let decode = match law {
        G711Law::ALaw => alaw_to_linear,
        G711Law::MuLaw => ulaw_to_linear,
    };
    Ok(bytes.iter().map(|&b| decode(b)).collect())
}

/// Decode a G.711 frame whose law is not known up front: A-law first, µ-law as fallback.
pub fn decode_g711_auto(bytes: &[u8]) -> VoiceResult<(Vec<i16>, G711Law)> {
    match decode_g711(bytes, G711Law::ALaw) {
        Ok(samples) => Ok((samples, G711Law::ALaw)),
        Err(alaw_err) => {
            tracing::debug!(error = %alaw_err, "A-law decode failed, trying µ-law");
            decode_g711(bytes, G711Law::MuLaw).map(|samples| (samples, G711Law::MuLaw))
        }
    }
}

/// Encode PCM16 samples with the given law.
pub fn encode_g711(samples: &[i16], law: G711Law) -> Vec<u8> {
    let encode = match law {
        G711Law::ALaw => linear_to_alaw,
        G711Law::MuLaw => linear_to_ulaw,
    };
    samples.iter().map(|&s| encode(s)).collect()
}

/// Resampler position carried between chunks of one utterance.
///
/// `phase` is the position of the next output sample, measured in units of
/// `1 / out_rate` input samples relative to the start of the next chunk.
/// `prev` is the last input sample of the previous chunk, used as the left
/// neighbour when the next output falls between chunks.
///
/// `ResampleState::default()` is the reset state used at utterance boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResampleState {
    phase: i64,
    prev: Option<i16>,
}

/// Linearly resample PCM16 from `in_rate` to `out_rate`.
///
/// Feeding an utterance in chunks while threading the returned state gives
/// exactly the same samples as one call over the concatenated input.
/// Equal rates pass samples through untouched.
pub fn resample(samples: &[i16], in_rate: u32, out_rate: u32, state: ResampleState) -> (Vec<i16>, ResampleState) {
    if in_rate == out_rate || in_rate == 0 || out_rate == 0 {
        let prev = samples.last().copied().or(state.prev);
        return (samples.to_vec(), ResampleState { phase: 0, prev });
    }
    if samples.is_empty() {
        return (Vec::new(), state);
    }

    let step = in_rate as i64;
    let denom = out_rate as i64;
    let len = samples.len() as i64;
    let mut phase = state.phase;
    let mut out = Vec::with_capacity((samples.len() as u64 * out_rate as u64 / in_rate as u64 + 1) as usize);

    loop {
        let index = phase.div_euclid(denom);
        let frac = phase.rem_euclid(denom);
        if index + 1 >= len {
            break;
        }

        let left = if index < 0 {
            // index == -1: straddles the previous chunk
            match state.prev {
                Some(prev) => prev as i64,
                None => samples[0] as i64,
            }
        } else {
            samples[index as usize] as i64
        };
        let right = samples[(index + 1) as usize] as i64;

        let value = (left * (denom - frac) + right * frac) / denom;
        out.push(value.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
        phase += step;
    }

    let next = ResampleState {
        phase: phase - len * denom,
        prev: samples.last().copied(),
    };
    (out, next)
}

/// Convert little-endian PCM16 bytes to samples.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> VoiceResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Format(format!(
            "PCM16 data must have an even length, got {} bytes",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Convert samples to little-endian PCM16 bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Prefix PCM16 samples with a canonical 44-byte RIFF/WAVE header.
///
/// Layout (little-endian): `RIFF`, `36 + data_len`, `WAVE`, `fmt `, 16, PCM(1),
/// channels, rate, byte rate, block align, 16 bits, `data`, `data_len`.
pub fn wrap_container(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    const BITS_PER_SAMPLE: u16 = 16;

    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut out = vec![0u8; WAV_HEADER_LEN + data_len as usize];
    {
        let header = &mut out[..WAV_HEADER_LEN];
        header[0..4].copy_from_slice(b"RIFF");
        LittleEndian::write_u32(&mut header[4..8], 36 + data_len);
        header[8..12].copy_from_slice(b"WAVE");
        header[12..16].copy_from_slice(b"fmt ");
        LittleEndian::write_u32(&mut header[16..20], 16);
        LittleEndian::write_u16(&mut header[20..22], 1);
        LittleEndian::write_u16(&mut header[22..24], channels);
        LittleEndian::write_u32(&mut header[24..28], sample_rate);
        LittleEndian::write_u32(&mut header[28..32], byte_rate);
        LittleEndian::write_u16(&mut header[32..34], block_align);
        LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);
        header[36..40].copy_from_slice(b"data");
        LittleEndian::write_u32(&mut header[40..44], data_len);
    }
    LittleEndian::write_i16_into(samples, &mut out[WAV_HEADER_LEN..]);
    out
}

/// Format information read from a WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Parse a RIFF/WAVE buffer holding 16-bit PCM.
pub fn unwrap_container(bytes: &[u8]) -> VoiceResult<(WavInfo, Vec<i16>)> {
    let mut reader = Cursor::new(bytes);
    let (header, data) = wav::read(&mut reader)
        .map_err(|e| VoiceError::Format(format!("invalid WAV container: {}", e)))?;

    let info = WavInfo {
        sample_rate: header.sampling_rate,
        channels: header.channel_count,
        bit_depth: header.bits_per_sample,
    };

    match data {
        wav::BitDepth::Sixteen(samples) => Ok((info, samples)),
        _ => Err(VoiceError::Format(format!(
            "unsupported WAV bit depth {}, expected 16",
            info.bit_depth
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alaw_reference_points() {
        assert_eq!(linear_to_alaw(0), 0xD5);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32256);
        assert_eq!(alaw_to_linear(0x2A), -32256);
    }

    #[test]
    fn test_ulaw_reference_points() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(ulaw_to_linear(0x7F), 0);
        assert_eq!(ulaw_to_linear(0x80), 32124);
        assert_eq!(ulaw_to_linear(0x00), -32124);
    }

    #[test]
    fn test_every_code_word_survives_reencoding() {
        for code in 0..=255u8 {
            assert_eq!(linear_to_alaw(alaw_to_linear(code)), code, "A-law {:#04x}", code);
            // 0x7F is negative zero and canonicalises to 0xFF
            if code != 0x7F {
                assert_eq!(linear_to_ulaw(ulaw_to_linear(code)), code, "µ-law {:#04x}", code);
            }
        }
    }

    #[test]
    fn test_g711_quantisation_error_is_bounded() {
        for sample in [-32768i16, -20000, -1000, -37, 0, 5, 100, 1234, 16000, 32767] {
            for law in [G711Law::ALaw, G711Law::MuLaw] {
                let decoded = decode_g711(&encode_g711(&[sample], law), law).unwrap()[0];
                let error = (decoded as i32 - sample as i32).abs();
                // Worst-case step is 1024 in the top segment
                assert!(error <= 1024, "{:?} {} -> {}", law, sample, decoded);
            }
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_auto_prefers_alaw() {
        assert!(matches!(decode_g711(&[], G711Law::ALaw), Err(VoiceError::Format(_))));
        assert!(decode_g711_auto(&[]).is_err());

        let (samples, law) = decode_g711_auto(&[0xD5, 0xD5]).unwrap();
        assert_eq!(law, G711Law::ALaw);
        assert_eq!(samples, vec![8, 8]);
    }

    #[test]
    fn test_resample_equal_rates_is_passthrough() {
        let input = vec![1i16, -2, 3, -4];
        let (out, _) = resample(&input, 8000, 8000, ResampleState::default());
        assert_eq!(out, input);
    }

    #[test]
    fn test_resample_downsample_picks_every_third_sample() {
        let input: Vec<i16> = (0..30).map(|i| i * 10).collect();
        let (out, _) = resample(&input, 24000, 8000, ResampleState::default());
        assert_eq!(out, vec![0, 30, 60, 90, 120, 150, 180, 210, 240, 270]);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let (out, _) = resample(&[0, 100, 200], 8000, 16000, ResampleState::default());
        assert_eq!(out, vec![0, 50, 100, 150]);
    }

    #[test]
    fn test_resample_chunked_matches_one_shot() {
        let input: Vec<i16> = (0..2400).map(|i| ((i * 37) % 2000 - 1000) as i16).collect();

        for (in_rate, out_rate) in [(24000, 8000), (8000, 24000), (48000, 16000), (22050, 8000)] {
            let (expected, _) = resample(&input, in_rate, out_rate, ResampleState::default());

            let mut state = ResampleState::default();
            let mut chunked = Vec::new();
            for chunk in input.chunks(97) {
                let (out, next) = resample(chunk, in_rate, out_rate, state);
                chunked.extend(out);
                state = next;
            }
            assert_eq!(chunked, expected, "{} -> {}", in_rate, out_rate);
        }
    }

    #[test]
    fn test_wrap_container_header_layout() {
        let samples = vec![0i16, 1, -1, i16::MAX];
        let wav = wrap_container(&samples, 8000, 1);

        assert_eq!(wav.len(), WAV_HEADER_LEN + 8);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(LittleEndian::read_u32(&wav[4..8]), 36 + 8);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(LittleEndian::read_u16(&wav[20..22]), 1);
        assert_eq!(LittleEndian::read_u32(&wav[24..28]), 8000);
        assert_eq!(LittleEndian::read_u32(&wav[28..32]), 16000);
        assert_eq!(LittleEndian::read_u16(&wav[32..34]), 2);
        assert_eq!(LittleEndian::read_u16(&wav[34..36]), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(LittleEndian::read_u32(&wav[40..44]), 8);
        assert_eq!(pcm_bytes_to_samples(&wav[44..]).unwrap(), samples);
    }

    #[test]
    fn test_unwrap_container_reads_what_wrap_writes() {
        let samples: Vec<i16> = (0..160).map(|i| i * 3 - 200).collect();
        let (info, decoded) = unwrap_container(&wrap_container(&samples, 16000, 1)).unwrap();
        assert_eq!(info, WavInfo { sample_rate: 16000, channels: 1, bit_depth: 16 });
        assert_eq!(decoded, samples);

        assert!(matches!(unwrap_container(b"not a wav file"), Err(VoiceError::Format(_))));
    }

    #[test]
    fn test_pcm_bytes_require_even_length() {
        assert!(pcm_bytes_to_samples(&[1, 2, 3]).is_err());
        assert_eq!(pcm_bytes_to_samples(&samples_to_pcm_bytes(&[-5, 7])).unwrap(), vec![-5, 7]);
    }
}
