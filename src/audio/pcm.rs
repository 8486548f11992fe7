//! Conversions for 16-bit signed little-endian mono PCM

/// Convert f32 samples in [-1.0, 1.0] to s16le bytes
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode s16le bytes; a trailing odd byte is ignored
pub fn s16le_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Root-mean-square level normalised to [0, 1]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let level = (sum_squares / samples.len() as f64).sqrt() as f32;
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_conversion_clamps() {
        let bytes = f32_to_s16le(&[0.0, 1.5, -1.5]);
        assert_eq!(s16le_to_i16(&bytes), vec![0, 32767, -32768]);
    }

    #[test]
    fn test_odd_byte_ignored() {
        assert_eq!(s16le_to_i16(&[0x01, 0x00, 0xff]), vec![1]);
    }

    #[test]
    fn test_rms_levels() {
        assert!(rms(&[0; 160]) < 0.001);
        assert!(rms(&[16384; 160]) > 0.49);
        assert_eq!(rms(&[]), 0.0);
    }
}
