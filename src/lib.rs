//! # telemux - Record transport for network-telemetry pipelines
//!
//! Schema-driven records and a fan-out streaming transport in pure RUST.
//!
//! Independent processing modules are connected through named endpoints into
//! a directed graph. Each message is a structured record conforming to a
//! schema negotiated at connect time:
//!
//! * [`record`] - field registry, templates (ordered schemas), record memory
//!   layout with mixed fixed- and variable-length fields, typed accessors and
//!   record/text conversion.
//! * [`transport`] - the wire protocol and runtime of a multi-consumer
//!   streaming endpoint: batching of records into containers, a bounded ring
//!   shared by all consumers with reference counting, per-consumer sender
//!   threads, periodic auto-flush and the format-negotiation handshake.
//!

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

mod rec;
mod tools;
mod wire;

///
/// Schema-driven records: registry, templates and the record layout
///
pub mod record {
    pub use crate::rec::data::{FixedField, Record, MAX_RECORD_SIZE};
    pub use crate::rec::ipaddr::IpAddr;
    pub use crate::rec::macaddr::MacAddr;
    pub use crate::rec::registry::{FieldId, Registry, INVALID_FIELD};
    pub use crate::rec::template::{Direction, Template};
    pub use crate::rec::text::header_line;
    pub use crate::rec::time::MsgTime;
    pub use crate::rec::types::FieldType;
}

/// Multi-consumer streaming transport with format negotiation
pub mod transport {
    pub use crate::wire::negotiate::{DataFormat, NegotiationCallback, NegotiationResult};
    pub use crate::wire::params::{EndpointAddr, ReceiverConfig, SenderConfig};
    pub use crate::wire::receiver::{ReceiverStats, RecvTimeout, StreamReceiver, Terminator};
    pub use crate::wire::sender::{ClientStats, StreamSender};
}

pub use crate::tools::error;
