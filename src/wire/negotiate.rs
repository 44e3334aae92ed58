//! The hello handshake exchanged right after connect, before any record
//! flows.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::rec::registry::parse_spec;
use crate::rec::types::FieldType;
use crate::tools::error::{Error, Result};

/// Wire tag of a raw (schema-less) stream.
const TAG_RAW: u8 = 0;
/// Wire tag of a schema-based stream.
const TAG_SCHEMA: u8 = 1;

/// Payload format of a stream, as announced in the hello message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    /// Untyped byte records; no schema is negotiated.
    Raw,
    /// Records conforming to the template described by the spec string
    /// (`"<type> <name>,…"`).
    Schema(String),
}

impl DataFormat {
    /// The spec string of a schema-based format.
    pub fn spec(&self) -> Option<&str> {
        match self {
            DataFormat::Raw => None,
            DataFormat::Schema(spec) => Some(spec),
        }
    }
}

/// Outcome of the format-negotiation handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationResult {
    /// Types and specs match exactly.
    Ok,
    /// The receiver previously accepted a different spec; the template must
    /// be expanded and reinstalled.
    FmtChanged,
    /// The receiver's required fields are a subset of the sender's offer;
    /// extra fields are ignored.
    ReceiverSubset,
    /// The sender's offer is a subset of a previously negotiated superset.
    SenderSubset,
    /// Fields or types disagree; the connection must be closed.
    FmtMismatch,
    /// The sender has no declared format.
    FmtUnknown,
    /// I/O error during the hello exchange.
    Failed,
}

/// Callback consulted by the receiver before accepting a negotiated format.
/// Arguments: the evaluated outcome, the receiver's required spec and the
/// received spec. Returning `false` refuses the connection.
pub type NegotiationCallback = dyn Fn(NegotiationResult, &str, &str) -> bool + Send;

/// Serialize a hello message: a tag byte, and for schema-based streams a
/// big-endian length-prefixed UTF-8 spec string.
pub(crate) fn write_hello(sock: &mut impl Write, format: &DataFormat) -> std::io::Result<()> {
    match format {
        DataFormat::Raw => sock.write_all(&[TAG_RAW]),
        DataFormat::Schema(spec) => {
            let mut msg = Vec::with_capacity(5 + spec.len());
            msg.push(TAG_SCHEMA);
            msg.extend_from_slice(&(spec.len() as u32).to_be_bytes());
            msg.extend_from_slice(spec.as_bytes());
            sock.write_all(&msg)
        }
    }
}

/// Read back a hello message written by [`write_hello`].
pub(crate) fn read_hello(sock: &mut impl Read) -> Result<DataFormat> {
    let mut tag = [0u8; 1];
    sock.read_exact(&mut tag)?;
    match tag[0] {
        TAG_RAW => Ok(DataFormat::Raw),
        TAG_SCHEMA => {
            let mut len = [0u8; 4];
            sock.read_exact(&mut len)?;
            let len = u32::from_be_bytes(len) as usize;
            let mut spec = vec![0u8; len];
            sock.read_exact(&mut spec)?;
            let spec = String::from_utf8(spec)
                .map_err(|_| Error::spec("hello spec string is not UTF-8"))?;
            Ok(DataFormat::Schema(spec))
        }
        other => Err(Error::spec(format!("unknown hello tag {}", other))),
    }
}

/// Parsed field set of a spec string, for subset comparison.
fn field_set(spec: &str) -> Result<Vec<(String, FieldType)>> {
    let mut set: Vec<(String, FieldType)> = parse_spec(spec)?
        .into_iter()
        .map(|(ty, name)| (name, ty))
        .collect();
    set.sort();
    set.dedup();
    Ok(set)
}

/// True iff every field of `inner` appears, with identical type, in `outer`.
fn is_subset(inner: &[(String, FieldType)], outer: &[(String, FieldType)]) -> bool {
    inner.iter().all(|f| outer.contains(f))
}

/// Evaluate a received hello against the required format and the previously
/// accepted spec, following the receiver's acceptance rules.
pub(crate) fn evaluate(
    required: &DataFormat,
    received: &DataFormat,
    previous: Option<&str>,
) -> NegotiationResult {
    match (required, received) {
        (DataFormat::Raw, DataFormat::Raw) => NegotiationResult::Ok,
        (DataFormat::Schema(req), DataFormat::Schema(rcv)) => {
            let (req_set, rcv_set) = match (field_set(req), field_set(rcv)) {
                (Ok(a), Ok(b)) => (a, b),
                _ => return NegotiationResult::FmtMismatch,
            };
            if req_set == rcv_set {
                match previous {
                    Some(prev) if prev != rcv => NegotiationResult::FmtChanged,
                    _ => NegotiationResult::Ok,
                }
            } else if is_subset(&req_set, &rcv_set) {
                match previous {
                    Some(prev) if prev != rcv => NegotiationResult::FmtChanged,
                    _ => NegotiationResult::ReceiverSubset,
                }
            } else if previous
                .and_then(|prev| field_set(prev).ok())
                .map(|prev_set| is_subset(&rcv_set, &prev_set))
                .unwrap_or(false)
            {
                NegotiationResult::SenderSubset
            } else {
                NegotiationResult::FmtMismatch
            }
        }
        _ => NegotiationResult::FmtMismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate, read_hello, write_hello, DataFormat, NegotiationResult};

    #[test]
    pub fn hello_roundtrip() {
        crate::tests::init();
        let mut buf = Vec::new();
        write_hello(&mut buf, &DataFormat::Raw).unwrap();
        assert_eq!(read_hello(&mut buf.as_slice()).unwrap(), DataFormat::Raw);

        let fmt = DataFormat::Schema("uint32 A,string B".to_owned());
        let mut buf = Vec::new();
        write_hello(&mut buf, &fmt).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..5], &(17u32).to_be_bytes());
        assert_eq!(read_hello(&mut buf.as_slice()).unwrap(), fmt);

        assert!(read_hello(&mut [9u8].as_slice()).is_err());
    }

    #[test]
    pub fn exact_match() {
        crate::tests::init();
        let a = DataFormat::Schema("uint32 A,string C".to_owned());
        assert_eq!(evaluate(&a, &a.clone(), None), NegotiationResult::Ok);
        assert_eq!(
            evaluate(&DataFormat::Raw, &DataFormat::Raw, None),
            NegotiationResult::Ok
        );
        // field order does not matter
        let b = DataFormat::Schema("string C,uint32 A".to_owned());
        assert_eq!(evaluate(&a, &b, None), NegotiationResult::Ok);
    }

    #[test]
    pub fn receiver_subset() {
        crate::tests::init();
        let required = DataFormat::Schema("uint32 A,string C".to_owned());
        let offered = DataFormat::Schema("uint32 A,uint32 B,string C".to_owned());
        assert_eq!(
            evaluate(&required, &offered, None),
            NegotiationResult::ReceiverSubset
        );
    }

    #[test]
    pub fn mismatches() {
        crate::tests::init();
        // same name, different type
        let required = DataFormat::Schema("uint64 A".to_owned());
        let offered = DataFormat::Schema("uint32 A".to_owned());
        assert_eq!(
            evaluate(&required, &offered, None),
            NegotiationResult::FmtMismatch
        );
        // missing required field
        let required = DataFormat::Schema("uint32 A,uint32 B".to_owned());
        let offered = DataFormat::Schema("uint32 A".to_owned());
        assert_eq!(
            evaluate(&required, &offered, None),
            NegotiationResult::FmtMismatch
        );
        // raw vs schema
        assert_eq!(
            evaluate(&DataFormat::Raw, &offered, None),
            NegotiationResult::FmtMismatch
        );
    }

    #[test]
    pub fn changed_and_sender_subset() {
        crate::tests::init();
        let required = DataFormat::Schema("uint32 A".to_owned());
        let prev = "uint32 A,uint32 B,string C";

        // a new offer still covering the requirement reads as changed
        let offered = DataFormat::Schema("uint32 A,time TS".to_owned());
        assert_eq!(
            evaluate(&required, &offered, Some(prev)),
            NegotiationResult::FmtChanged
        );

        // an offer shrinking within the previously negotiated superset
        let required = DataFormat::Schema("uint32 A,uint32 B,string C".to_owned());
        let offered = DataFormat::Schema("uint32 A,uint32 B".to_owned());
        assert_eq!(
            evaluate(&required, &offered, Some(prev)),
            NegotiationResult::SenderSubset
        );

        // the same spec as before stays a plain subset acceptance
        let required = DataFormat::Schema("uint32 A".to_owned());
        let offered = DataFormat::Schema(prev.to_owned());
        assert_eq!(
            evaluate(&required, &offered, Some(prev)),
            NegotiationResult::ReceiverSubset
        );
    }
}
