//! Customer chat messages: inbound normalisation, reply parsing, outbound
//! templates.
//!
//! Everything here is pure. Transport and storage live in `sizeflow-infra`
//! and `sizeflow-api`.

pub mod inbound;
pub mod parser;
pub mod template;

pub use inbound::{decode, DecodeError, InboundMessage, VendorPayloadKind};
pub use parser::{parse, parse_confirmation, Confirmation, ParsedReply};
pub use template::{MessageTemplate, TemplateName};
