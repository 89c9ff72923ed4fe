//! Pkt-line framing for the smart-HTTP ref advertisement.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::GatewayError;

pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Largest payload a single pkt-line may carry.
pub const MAX_PAYLOAD: usize = 65516;

/// Frame `payload` as one pkt-line: a four-digit lowercase hex length that
/// counts itself, followed by the payload.
pub fn encode(payload: &[u8]) -> Result<Bytes, GatewayError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(GatewayError::ProtocolMalformed(format!(
            "pkt-line payload of {} bytes exceeds {MAX_PAYLOAD}",
            payload.len()
        )));
    }
    let len = payload.len() + 4;
    let mut buf = BytesMut::with_capacity(len);
    buf.put_slice(format!("{len:04x}").as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// `# service=git-<service>\n` as a pkt-line, then a flush packet. Smart
/// clients expect this in front of the advertised refs.
pub fn service_header(service: &str) -> Result<Bytes, GatewayError> {
    let line = encode(format!("# service=git-{service}\n").as_bytes())?;
    let mut buf = BytesMut::with_capacity(line.len() + FLUSH_PKT.len());
    buf.put_slice(&line);
    buf.put_slice(FLUSH_PKT);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_counts_itself() {
        let line = b"# service=git-upload-pack\n";
        assert_eq!(line.len(), 26);
        let framed = encode(line).unwrap();
        assert_eq!(&framed[..4], b"001e");
        assert_eq!(&framed[4..], line);
    }

    #[test]
    fn prefix_is_zero_padded_lowercase() {
        assert_eq!(&encode(b"").unwrap()[..], b"0004");
        assert_eq!(&encode(&[b'x'; 6]).unwrap()[..4], b"000a");
        assert_eq!(&encode(&[b'x'; 250]).unwrap()[..4], b"00fe");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(encode(&vec![0u8; MAX_PAYLOAD]).is_ok());
        assert!(matches!(
            encode(&vec![0u8; MAX_PAYLOAD + 1]),
            Err(GatewayError::ProtocolMalformed(_))
        ));
    }

    #[test]
    fn service_header_layout() {
        assert_eq!(
            &service_header("upload-pack").unwrap()[..],
            b"001e# service=git-upload-pack\n0000"
        );
        assert_eq!(
            &service_header("receive-pack").unwrap()[..],
            b"001f# service=git-receive-pack\n0000"
        );
    }
}
