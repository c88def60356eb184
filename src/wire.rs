//! A module which contains the definition of the messages that nodes exchange
//! and their framed binary encoding.
//!
//! Every message shares a fixed 12-byte header `(len, typ, iid)` of
//! little-endian `u32`s, where `len` counts the payload bytes following the
//! header, `typ` is the message kind tag and `iid` is the Paxos instance the
//! message belongs to (or, for client traffic, the request sequence number).

use thiserror::Error;

use crate::NodeId;

/// Size in bytes of the fixed frame header.
pub const HEADER_SIZE: usize = 12;

// Message kind tags as they appear in the `typ` header field.
pub const KIND_REQUEST: u32 = 0x0a; // client -> proposer
pub const KIND_RESPONSE: u32 = 0x0b; // proposer -> client
pub const KIND_PREPARE: u32 = 0x1a; // proposer -> acceptor
pub const KIND_PROMISE: u32 = 0x1b; // acceptor -> proposer
pub const KIND_ACCEPT: u32 = 0x2a; // proposer -> acceptor
pub const KIND_ACCEPTED: u32 = 0x2b; // acceptor -> proposer
pub const KIND_COMMIT: u32 = 0x3a; // proposer -> acceptor

/// Sentinel ballot meaning "no ballot". A Promise carrying this in its
/// `max_vbal` field has never accepted a value for the instance.
pub const INVALID_BALLOT: u32 = 0xFFFF_FFFF;

// Return codes carried in `Response.ret`.
pub const STATUS_OK: u32 = 0;
pub const STATUS_TIMEOUT: u32 = 1;
pub const STATUS_CLUSTER_UNAVAILABLE: u32 = 2;
pub const STATUS_NOT_LEADER: u32 = 3;

/// An opaque client value: a byte string with an explicit size on the wire.
/// A zero-size value means "none"; only Promises may carry one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Value {
    pub oct: Vec<u8>,
}

impl Value {
    pub fn new(oct: Vec<u8>) -> Value {
        Value { oct }
    }

    /// The "none" value, encoded as size 0 with no octets.
    pub fn none() -> Value {
        Value { oct: Vec::new() }
    }

    pub fn size(&self) -> u32 {
        self.oct.len() as u32
    }

    pub fn is_none(&self) -> bool {
        self.oct.is_empty()
    }
}

/// A client submission. `iid` in the header is the client's sequence number;
/// the proposer assigns the actual instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub iid: u32,
    pub val: Value,
}

/// The proposer's answer to a Request, carrying one of the `STATUS_*` codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub iid: u32,
    pub ret: u32,
}

/// Phase 1a: a proposer rallies acceptors behind a ballot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    pub iid: u32,
    pub bal: u32,
}

/// Phase 1b: an acceptor promises not to accept below `bal` and reports the
/// value it last accepted, if any. `max_vbal` is `INVALID_BALLOT` when the
/// acceptor has accepted nothing for this instance, in which case `max_val`
/// is none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promise {
    pub iid: u32,
    pub acc: NodeId,
    pub bal: u32,
    pub max_vbal: u32,
    pub max_val: Value,
}

/// Phase 2a: a proposer asks acceptors to accept `val` at `bal`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
    pub iid: u32,
    pub bal: u32,
    pub val: Value,
}

/// Phase 2b: an acceptor has accepted `val` at `bal`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub iid: u32,
    pub acc: NodeId,
    pub bal: u32,
    pub val: Value,
}

/// The decree for `iid` is chosen; the ballot that carried it is `bal`. The
/// value itself travels in the corresponding Accept, not here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub iid: u32,
    pub bal: u32,
}

/// All message kinds a node can put on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
    Commit(Commit),
}

/// Reasons a frame fails to decode. Any of these resets the sender's
/// reassembly buffer at the receiving node.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u32),
    #[error("client request with zero-length value")]
    EmptyValue,
}

impl Message {
    /// The `typ` tag this message is framed with.
    pub fn kind(&self) -> u32 {
        match self {
            Message::Request(_) => KIND_REQUEST,
            Message::Response(_) => KIND_RESPONSE,
            Message::Prepare(_) => KIND_PREPARE,
            Message::Promise(_) => KIND_PROMISE,
            Message::Accept(_) => KIND_ACCEPT,
            Message::Accepted(_) => KIND_ACCEPTED,
            Message::Commit(_) => KIND_COMMIT,
        }
    }

    /// The instance (or request sequence) number in the header.
    pub fn iid(&self) -> u32 {
        match self {
            Message::Request(m) => m.iid,
            Message::Response(m) => m.iid,
            Message::Prepare(m) => m.iid,
            Message::Promise(m) => m.iid,
            Message::Accept(m) => m.iid,
            Message::Accepted(m) => m.iid,
            Message::Commit(m) => m.iid,
        }
    }

    /// Serializes the message into one frame. Deterministic: the same
    /// message always yields the same bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Request(m) => {
                put_u32(&mut payload, m.val.size());
                payload.extend_from_slice(&m.val.oct);
            }
            Message::Response(m) => {
                put_u32(&mut payload, m.ret);
            }
            Message::Prepare(m) => {
                put_u32(&mut payload, m.bal);
            }
            Message::Promise(m) => {
                put_u32(&mut payload, m.acc);
                put_u32(&mut payload, m.bal);
                put_u32(&mut payload, m.max_vbal);
                put_u32(&mut payload, m.max_val.size());
                payload.extend_from_slice(&m.max_val.oct);
            }
            Message::Accept(m) => {
                put_u32(&mut payload, m.bal);
                put_u32(&mut payload, m.val.size());
                payload.extend_from_slice(&m.val.oct);
            }
            Message::Accepted(m) => {
                put_u32(&mut payload, m.acc);
                put_u32(&mut payload, m.bal);
                put_u32(&mut payload, m.val.size());
                payload.extend_from_slice(&m.val.oct);
            }
            Message::Commit(m) => {
                put_u32(&mut payload, m.bal);
            }
        }
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        put_u32(&mut frame, payload.len() as u32);
        put_u32(&mut frame, self.kind());
        put_u32(&mut frame, self.iid());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Decodes exactly one frame from the front of `buf`, returning the message
/// and the number of bytes consumed. The payload is parsed field by field
/// according to the kind tag; the `len` header field is not trusted for
/// anything.
pub fn decode_one(buf: &[u8]) -> Result<(Message, usize), WireError> {
    let mut rd = Reader::new(buf);
    let _len = rd.u32()?;
    let typ = rd.u32()?;
    let iid = rd.u32()?;
    let msg = match typ {
        KIND_REQUEST => {
            let val = rd.value()?;
            if val.is_none() {
                return Err(WireError::EmptyValue);
            }
            Message::Request(Request { iid, val })
        }
        KIND_RESPONSE => {
            let ret = rd.u32()?;
            Message::Response(Response { iid, ret })
        }
        KIND_PREPARE => {
            let bal = rd.u32()?;
            Message::Prepare(Prepare { iid, bal })
        }
        KIND_PROMISE => {
            let acc = rd.u32()?;
            let bal = rd.u32()?;
            let max_vbal = rd.u32()?;
            let max_val = rd.value()?;
            Message::Promise(Promise {
                iid,
                acc,
                bal,
                max_vbal,
                max_val,
            })
        }
        KIND_ACCEPT => {
            let bal = rd.u32()?;
            let val = rd.value()?;
            Message::Accept(Accept { iid, bal, val })
        }
        KIND_ACCEPTED => {
            let acc = rd.u32()?;
            let bal = rd.u32()?;
            let val = rd.value()?;
            Message::Accepted(Accepted { iid, acc, bal, val })
        }
        KIND_COMMIT => {
            let bal = rd.u32()?;
            Message::Commit(Commit { iid, bal })
        }
        other => return Err(WireError::UnknownKind(other)),
    };
    Ok((msg, rd.consumed()))
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// A cursor over an inbound frame.
struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, off: 0 }
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        if self.buf.len() < self.off + 4 {
            return Err(WireError::Truncated);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.off..self.off + 4]);
        self.off += 4;
        Ok(u32::from_le_bytes(raw))
    }

    /// A size-prefixed value. Size 0 yields the none value with no further
    /// bytes consumed.
    fn value(&mut self) -> Result<Value, WireError> {
        let siz = self.u32()? as usize;
        if self.buf.len() < self.off + siz {
            return Err(WireError::Truncated);
        }
        let oct = self.buf[self.off..self.off + siz].to_vec();
        self.off += siz;
        Ok(Value { oct })
    }

    fn consumed(&self) -> usize {
        self.off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(m: Message) {
        let bs = m.encode();
        let (back, nrd) = decode_one(&bs).expect("decode");
        assert_eq!(back, m);
        assert_eq!(nrd, bs.len());
        // encode is deterministic
        assert_eq!(back.encode(), bs);
    }

    #[test]
    fn request_frame_layout() {
        let m = Message::Request(Request {
            iid: 100,
            val: Value::new(vec![101, 0, 0, 0]),
        });
        let bs = m.encode();
        assert_eq!(bs.len(), 20);
        assert_eq!(
            bs,
            vec![
                8, 0, 0, 0, // len: 4-byte size field + 4 octets
                0x0a, 0, 0, 0, // typ
                100, 0, 0, 0, // iid
                4, 0, 0, 0, // val.siz
                101, 0, 0, 0, // val.oct
            ]
        );
        round_trip(m);
    }

    #[test]
    fn all_kinds_round_trip() {
        round_trip(Message::Request(Request {
            iid: 1,
            val: Value::new(vec![42, 84, 42, 84]),
        }));
        round_trip(Message::Response(Response { iid: 1, ret: STATUS_OK }));
        round_trip(Message::Prepare(Prepare { iid: 101, bal: 101 }));
        round_trip(Message::Promise(Promise {
            iid: 1,
            acc: 1,
            bal: 101,
            max_vbal: 100,
            max_val: Value::new(vec![42, 0, 0, 0]),
        }));
        round_trip(Message::Promise(Promise {
            iid: 1,
            acc: 2,
            bal: 101,
            max_vbal: INVALID_BALLOT,
            max_val: Value::none(),
        }));
        round_trip(Message::Accept(Accept {
            iid: 1,
            bal: 101,
            val: Value::new(vec![42, 42, 42, 42]),
        }));
        round_trip(Message::Accepted(Accepted {
            iid: 1,
            acc: 1,
            bal: 101,
            val: Value::new(vec![42, 42, 42, 42]),
        }));
        round_trip(Message::Commit(Commit { iid: 1, bal: 101 }));
    }

    #[test]
    fn header_len_matches_payload() {
        let m = Message::Promise(Promise {
            iid: 7,
            acc: 3,
            bal: 301,
            max_vbal: 150,
            max_val: Value::new(vec![7]),
        });
        let bs = m.encode();
        let len = u32::from_le_bytes([bs[0], bs[1], bs[2], bs[3]]) as usize;
        assert_eq!(len, bs.len() - HEADER_SIZE);
        assert_eq!(len, 4 * 4 + 1);
    }

    #[test]
    fn zero_length_request_value_rejected() {
        let m = Message::Request(Request {
            iid: 5,
            val: Value::new(vec![9]),
        });
        let mut bs = m.encode();
        // rewrite val.siz to 0 and drop the octet
        bs[12..16].copy_from_slice(&0u32.to_le_bytes());
        bs.truncate(16);
        assert_eq!(decode_one(&bs), Err(WireError::EmptyValue));
    }

    #[test]
    fn unknown_kind_rejected() {
        let m = Message::Commit(Commit { iid: 1, bal: 1 });
        let mut bs = m.encode();
        bs[4..8].copy_from_slice(&0xffu32.to_le_bytes());
        assert_eq!(decode_one(&bs), Err(WireError::UnknownKind(0xff)));
    }

    #[test]
    fn truncated_frames_rejected() {
        let m = Message::Accept(Accept {
            iid: 2,
            bal: 202,
            val: Value::new(vec![1, 2, 3]),
        });
        let bs = m.encode();
        for n in 0..bs.len() {
            assert_eq!(decode_one(&bs[..n]), Err(WireError::Truncated), "prefix {}", n);
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let m1 = Message::Prepare(Prepare { iid: 1, bal: 201 });
        let m2 = Message::Commit(Commit { iid: 1, bal: 201 });
        let mut bs = m1.encode();
        let first_len = bs.len();
        bs.extend_from_slice(&m2.encode());

        let (d1, n1) = decode_one(&bs).expect("first frame");
        assert_eq!(d1, m1);
        assert_eq!(n1, first_len);
        let (d2, n2) = decode_one(&bs[n1..]).expect("second frame");
        assert_eq!(d2, m2);
        assert_eq!(n1 + n2, bs.len());
    }
}
