use crate::error::ProtocolError;
use crate::types::Pose;

// -- Vision request/reply --
pub const CMD_ONLINE: &[u8] = b"cmd Online";
pub const CMD_TRIGGER: &[u8] = b"cmd trigger";

/// The vision server answers with a fixed-width ASCII payload.
/// There is no length prefix; the width is agreed out of band.
pub const REPLY_SIZE: usize = 24;

pub const REPLY_DELIMITER: char = ' ';

// -- PLC record geometry --
/// Counters are 2-byte big-endian unsigned integers.
pub const COUNTER_WIDTH: usize = 2;

/// Strip the NUL padding (and stray whitespace) the server puts around the reply.
pub fn trim_padding(text: &str) -> &str {
    text.trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace())
}

/// Decode a vision reply into a pose.
///
/// Reply format: `"<x> <y> <r>"`, ASCII decimal, padded to [`REPLY_SIZE`] bytes.
pub fn parse_pose_reply(data: &[u8]) -> Result<Pose, ProtocolError> {
    if data.len() < REPLY_SIZE {
        return Err(ProtocolError::ShortRead {
            expected: REPLY_SIZE,
            received: data.len(),
        });
    }

    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidEncoding)?;
    let body = trim_padding(text);
    let tokens: Vec<&str> = body.split(REPLY_DELIMITER).collect();
    if tokens.len() != 3 {
        return Err(ProtocolError::TokenCount {
            found: tokens.len(),
            payload: body.to_string(),
        });
    }

    let x = parse_number(tokens[0])?;
    let y = parse_number(tokens[1])?;
    let r = parse_number(tokens[2])?;
    Ok(Pose::new(x, y, r))
}

fn parse_number(token: &str) -> Result<f64, ProtocolError> {
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ProtocolError::InvalidNumber {
            token: token.to_string(),
        }),
    }
}

/// Decode a big-endian counter from the start of `bytes`.
pub fn decode_counter(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < COUNTER_WIDTH {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn encode_counter(value: u16) -> [u8; COUNTER_WIDTH] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(text: &str) -> Vec<u8> {
        let mut buf = text.as_bytes().to_vec();
        buf.resize(REPLY_SIZE, 0);
        buf
    }

    #[test]
    fn test_parse_padded_reply() {
        let data = padded("100.0 200.0 10.0");
        assert_eq!(data.len(), 24);
        let pose = parse_pose_reply(&data).unwrap();
        assert_eq!(pose, Pose::new(100.0, 200.0, 10.0));
    }

    #[test]
    fn test_parse_signed_values() {
        let pose = parse_pose_reply(&padded("-12.5 +3 -0.75")).unwrap();
        assert_eq!(pose, Pose::new(-12.5, 3.0, -0.75));
    }

    #[test]
    fn test_parse_no_detection() {
        let pose = parse_pose_reply(&padded("0 0 0")).unwrap();
        assert!(pose.is_no_detection());
    }

    #[test]
    fn test_short_read() {
        let err = parse_pose_reply(b"100.0 200.0").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 24,
                received: 11
            }
        ));
    }

    #[test]
    fn test_wrong_token_count() {
        let err = parse_pose_reply(&padded("100.0 200.0")).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenCount { found: 2, .. }));

        // A doubled delimiter yields an empty token, not a silent skip.
        let err = parse_pose_reply(&padded("1.0  2.0 3.0")).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenCount { found: 4, .. }));
    }

    #[test]
    fn test_non_numeric_token() {
        let err = parse_pose_reply(&padded("1.0 abc 3.0")).unwrap_err();
        match err {
            ProtocolError::InvalidNumber { token } => assert_eq!(token, "abc"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_token() {
        let err = parse_pose_reply(&padded("NaN 2.0 3.0")).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidNumber { .. }));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut data = padded("1.0 2.0 3.0");
        data[0] = 0xFF;
        assert!(matches!(
            parse_pose_reply(&data),
            Err(ProtocolError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_counter_is_big_endian() {
        assert_eq!(encode_counter(0x0102), [0x01, 0x02]);
        assert_eq!(decode_counter(&[0x00, 0x03, 0xFF]), Some(3));
        assert_eq!(decode_counter(&[0x07]), None);
    }
}
