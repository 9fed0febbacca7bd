//! Binary KV protocol
//!
//! The request/response protocol spoken by data nodes: one in-flight
//! request per connection, correlated by an opaque token.

mod opcode;
mod packet;

pub use opcode::{
    Feature, Opcode, Status, DATATYPE_JSON, REQUEST_MAGIC, RESPONSE_MAGIC,
    SUBDOC_FLAG_XATTR_PATH,
};
pub use packet::{encode_request, parse_response, Request, Response, HEADER_LEN, MAX_BODY_LEN};
