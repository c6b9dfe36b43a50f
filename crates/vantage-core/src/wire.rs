//! # Driver Pipe Codec
//!
//! Messages on the prober↔driver pipe are two frames: a command tag
//! (`REQ`, `RESP` or `$TERM`) followed by a fixed-size binary payload.
//!
//! | command | payload |
//! |---|---|
//! | `REQ`   | target ip (4 bytes, network order) ‖ wait (1 byte) |
//! | `RESP`  | target ip (4 bytes, network order) ‖ verdict (1 byte) |
//! | `$TERM` | empty |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::probe::{ProbeReq, ProbeResp, Verdict};

/// Serialized length of a `REQ` payload.
pub const REQ_PAYLOAD_LEN: usize = 5;

/// Serialized length of a `RESP` payload.
pub const RESP_PAYLOAD_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} command, got {got}")]
    UnexpectedTag {
        expected: &'static str,
        got: &'static str,
    },
    #[error("payload truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("invalid verdict byte {0}")]
    BadVerdict(u8),
}

/// Command tag carried in the first frame of every pipe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Req,
    Resp,
    Term,
}

impl FrameTag {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameTag::Req => "REQ",
            FrameTag::Resp => "RESP",
            FrameTag::Term => "$TERM",
        }
    }
}

/// One two-frame pipe message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Bytes,
}

/// Serialize a probe request into a `REQ` message.
pub fn encode_req(req: &ProbeReq) -> Frame {
    let mut buf = BytesMut::with_capacity(REQ_PAYLOAD_LEN);
    buf.put_u32(req.target_ip);
    buf.put_u8(req.wait);
    Frame {
        tag: FrameTag::Req,
        payload: buf.freeze(),
    }
}

/// Deserialize a `REQ` message back into a probe request.
pub fn decode_req(frame: &Frame) -> Result<ProbeReq, WireError> {
    if frame.tag != FrameTag::Req {
        return Err(WireError::UnexpectedTag {
            expected: FrameTag::Req.as_str(),
            got: frame.tag.as_str(),
        });
    }
    if frame.payload.len() < REQ_PAYLOAD_LEN {
        return Err(WireError::Truncated {
            expected: REQ_PAYLOAD_LEN,
            got: frame.payload.len(),
        });
    }
    let mut buf = frame.payload.clone();
    let target_ip = buf.get_u32();
    let wait = buf.get_u8();
    Ok(ProbeReq { target_ip, wait })
}

/// Serialize a probe response into a `RESP` message.
pub fn encode_resp(resp: &ProbeResp) -> Frame {
    let mut buf = BytesMut::with_capacity(RESP_PAYLOAD_LEN);
    buf.put_u32(resp.target_ip);
    buf.put_u8(resp.verdict.as_u8());
    Frame {
        tag: FrameTag::Resp,
        payload: buf.freeze(),
    }
}

/// Deserialize a `RESP` message back into a probe response.
pub fn decode_resp(frame: &Frame) -> Result<ProbeResp, WireError> {
    if frame.tag != FrameTag::Resp {
        return Err(WireError::UnexpectedTag {
            expected: FrameTag::Resp.as_str(),
            got: frame.tag.as_str(),
        });
    }
    if frame.payload.len() < RESP_PAYLOAD_LEN {
        return Err(WireError::Truncated {
            expected: RESP_PAYLOAD_LEN,
            got: frame.payload.len(),
        });
    }
    let mut buf = frame.payload.clone();
    let target_ip = buf.get_u32();
    let verdict_byte = buf.get_u8();
    let verdict = Verdict::from_u8(verdict_byte).ok_or(WireError::BadVerdict(verdict_byte))?;
    Ok(ProbeResp { target_ip, verdict })
}

/// The termination message sent to a driver worker on destroy.
pub fn term_frame() -> Frame {
    Frame {
        tag: FrameTag::Term,
        payload: Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_round_trip() {
        let req = ProbeReq {
            target_ip: 0xc0a8_0105,
            wait: 3,
        };
        let frame = encode_req(&req);
        assert_eq!(frame.tag.as_str(), "REQ");
        assert_eq!(decode_req(&frame).unwrap(), req);
    }

    #[test]
    fn resp_round_trip() {
        let resp = ProbeResp {
            target_ip: 0x0a00_0001,
            verdict: Verdict::Responsive,
        };
        let frame = encode_resp(&resp);
        assert_eq!(frame.tag.as_str(), "RESP");
        assert_eq!(decode_resp(&frame).unwrap(), resp);
    }

    #[test]
    fn req_payload_is_network_byte_order() {
        let req = ProbeReq {
            target_ip: 0x0102_0304,
            wait: 7,
        };
        let frame = encode_req(&req);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4, 7]);
    }

    #[test]
    fn decode_rejects_wrong_tag() {
        let frame = encode_req(&ProbeReq {
            target_ip: 1,
            wait: 1,
        });
        assert!(matches!(
            decode_resp(&frame),
            Err(WireError::UnexpectedTag { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_payload() {
        let frame = Frame {
            tag: FrameTag::Resp,
            payload: Bytes::from_static(&[1, 2]),
        };
        assert_eq!(
            decode_resp(&frame),
            Err(WireError::Truncated {
                expected: RESP_PAYLOAD_LEN,
                got: 2
            })
        );
    }

    #[test]
    fn decode_rejects_bad_verdict() {
        let frame = Frame {
            tag: FrameTag::Resp,
            payload: Bytes::from_static(&[0, 0, 0, 1, 9]),
        };
        assert_eq!(decode_resp(&frame), Err(WireError::BadVerdict(9)));
    }

    #[test]
    fn term_frame_is_empty() {
        let frame = term_frame();
        assert_eq!(frame.tag.as_str(), "$TERM");
        assert!(frame.payload.is_empty());
    }
}
