//! Sample format conversions between float and 16-bit PCM.

/// Convert one float sample to signed 16-bit.
///
/// Negative values scale by 32768 and non-negative values by 32767, so both
/// full-scale ends map exactly onto the i16 range. NaN maps to zero.
#[inline]
pub fn float_to_s16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

pub fn encode_f32(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| float_to_s16(s)).collect()
}

/// Inverse of [`float_to_s16`].
#[inline]
pub fn s16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

pub fn s16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Interpret little-endian bytes as 16-bit samples.
///
/// Returns `None` for an odd byte count.
pub fn le_bytes_to_s16(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect(),
    )
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_uses_asymmetric_range() {
        assert_eq!(float_to_s16(1.0), 32767);
        assert_eq!(float_to_s16(-1.0), -32768);
        assert_eq!(float_to_s16(0.0), 0);
        assert_eq!(float_to_s16(-0.0), 0);
        assert_eq!(float_to_s16(0.5), 16383);
        assert_eq!(float_to_s16(-0.5), -16384);
    }

    #[test]
    fn out_of_range_and_nan() {
        assert_eq!(float_to_s16(3.5), 32767);
        assert_eq!(float_to_s16(-12.0), -32768);
        assert_eq!(float_to_s16(f32::NAN), 0);
        assert_eq!(float_to_s16(f32::INFINITY), 32767);
        assert_eq!(float_to_s16(f32::NEG_INFINITY), -32768);
    }

    #[test]
    fn encode_keeps_length() {
        let out = encode_f32(&[0.0; 512]);
        assert_eq!(out.len(), 512);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(s16_to_le_bytes(&out), vec![0u8; 1024]);
    }

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(s16_to_le_bytes(&[0x0102, -1]), vec![0x02, 0x01, 0xff, 0xff]);
        assert_eq!(le_bytes_to_s16(&[0x02, 0x01, 0xff, 0xff]), Some(vec![0x0102, -1]));
        assert_eq!(le_bytes_to_s16(&[1, 2, 3]), None);
    }

    #[test]
    fn float_conversion_inverts_at_full_scale() {
        assert_eq!(s16_to_float(32767), 1.0);
        assert_eq!(s16_to_float(-32768), -1.0);
        assert_eq!(s16_to_float(0), 0.0);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix_to_mono(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}
