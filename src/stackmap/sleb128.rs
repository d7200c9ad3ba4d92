//! Signed LEB128 encoding.
//!
//! LiteCG's stack-map stream is a sequence of SLEB128-encoded 64-bit
//! values. Decoding must sign-extend exactly: when the encoding used
//! fewer than 64 bits and the sign bit (0x40) of the final byte is set,
//! the remaining high bits are filled with ones. Getting this wrong
//! silently corrupts large negative frame offsets.

/// Append the SLEB128 encoding of `value` to `out`.
pub fn encode(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value as u8) & 0x7F;
        value >>= 7;
        let sign_clear = value == 0 && byte & 0x40 == 0;
        let sign_set = value == -1 && byte & 0x40 != 0;
        if sign_clear || sign_set {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode one SLEB128 value starting at `*pos`, advancing `*pos` past it.
///
/// Panics on a truncated stream: a malformed stack-map encoding is an
/// unrecoverable inconsistency, not an expected input.
pub fn decode(bytes: &[u8], pos: &mut usize) -> i64 {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    loop {
        assert!(*pos < bytes.len(), "truncated SLEB128 stream");
        let byte = bytes[*pos];
        *pos += 1;
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                // Sign-extend: fill the bits the encoding did not cover.
                result |= !0i64 << shift;
            }
            return result;
        }
        assert!(shift < 64, "SLEB128 value exceeds 64 bits");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: i64) -> i64 {
        let mut buf = Vec::new();
        encode(value, &mut buf);
        let mut pos = 0;
        let decoded = decode(&buf, &mut pos);
        assert_eq!(pos, buf.len(), "decoder must consume the whole encoding");
        decoded
    }

    #[test]
    fn test_round_trip_basics() {
        for v in [0i64, 1, -1, 63, 64, -64, -65, 127, 128, -128] {
            assert_eq!(round_trip(v), v, "value {}", v);
        }
    }

    #[test]
    fn test_round_trip_extremes() {
        for v in [i64::MIN, i64::MIN + 1, i64::MAX, i64::MAX - 1] {
            assert_eq!(round_trip(v), v);
        }
    }

    #[test]
    fn test_round_trip_frame_offsets() {
        // Typical frame-pointer-relative offsets, all multiples of 8.
        for v in (-4096i64..=4096).step_by(8) {
            assert_eq!(round_trip(v), v);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = Vec::new();
        encode(-1, &mut buf);
        assert_eq!(buf, [0x7F]);

        buf.clear();
        encode(63, &mut buf);
        assert_eq!(buf, [0x3F]);

        buf.clear();
        encode(-64, &mut buf);
        assert_eq!(buf, [0x40]);

        buf.clear();
        encode(-123456, &mut buf);
        assert_eq!(buf, [0xC0, 0xBB, 0x78]);
    }

    #[test]
    fn test_sign_extension_short_encoding() {
        // 0x40 alone decodes to -64: sign bit set, one byte consumed.
        let mut pos = 0;
        assert_eq!(decode(&[0x40], &mut pos), -64);
        assert_eq!(pos, 1);
    }

    #[test]
    #[should_panic(expected = "truncated SLEB128")]
    fn test_truncated_stream_is_fatal() {
        let mut pos = 0;
        let _ = decode(&[0x80, 0x80], &mut pos);
    }

    #[test]
    fn test_sequential_decode() {
        let mut buf = Vec::new();
        for v in [2i64, -16, 100000] {
            encode(v, &mut buf);
        }
        let mut pos = 0;
        assert_eq!(decode(&buf, &mut pos), 2);
        assert_eq!(decode(&buf, &mut pos), -16);
        assert_eq!(decode(&buf, &mut pos), 100000);
        assert_eq!(pos, buf.len());
    }
}
