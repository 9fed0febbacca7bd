//! Opcodes, status codes and negotiable features of the binary protocol

use std::fmt;

/// Request packet magic
pub const REQUEST_MAGIC: u8 = 0x80;

/// Response packet magic
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Datatype bit marking the value as JSON
pub const DATATYPE_JSON: u8 = 0x01;

/// Sub-document flag addressing an extended attribute path
pub const SUBDOC_FLAG_XATTR_PATH: u8 = 0x04;

/// Commands issued by keymend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a document
    Get = 0x00,
    /// Create a document only if the key is absent
    Add = 0x02,
    /// Remove a document, optionally guarded by CAS
    Delete = 0x04,
    /// Feature negotiation
    Hello = 0x1f,
    /// SASL authentication step
    SaslAuth = 0x21,
    /// Bind the connection to a bucket
    SelectBucket = 0x89,
    /// Fetch the bucket's cluster map
    GetClusterConfig = 0xb5,
    /// Sub-document single-path lookup
    SubdocGet = 0xc5,
}

impl Opcode {
    /// Decode an opcode byte, if keymend knows it
    pub fn from_u8(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => Opcode::Get,
            0x02 => Opcode::Add,
            0x04 => Opcode::Delete,
            0x1f => Opcode::Hello,
            0x21 => Opcode::SaslAuth,
            0x89 => Opcode::SelectBucket,
            0xb5 => Opcode::GetClusterConfig,
            0xc5 => Opcode::SubdocGet,
            _ => return None,
        };
        Some(op)
    }

    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Get => "GET",
            Opcode::Add => "ADD",
            Opcode::Delete => "DELETE",
            Opcode::Hello => "HELLO",
            Opcode::SaslAuth => "SASL_AUTH",
            Opcode::SelectBucket => "SELECT_BUCKET",
            Opcode::GetClusterConfig => "GET_CLUSTER_CONFIG",
            Opcode::SubdocGet => "SUBDOC_GET",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status word
///
/// Kept open-ended: servers add codes over time and an unknown status
/// must still round-trip into an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const KEY_NOT_FOUND: Status = Status(0x0001);
    pub const KEY_EXISTS: Status = Status(0x0002);
    pub const VALUE_TOO_LARGE: Status = Status(0x0003);
    pub const INVALID_ARGUMENTS: Status = Status(0x0004);
    pub const NOT_STORED: Status = Status(0x0005);
    pub const NOT_MY_VBUCKET: Status = Status(0x0007);
    pub const NO_BUCKET: Status = Status(0x0008);
    pub const AUTH_ERROR: Status = Status(0x0020);
    pub const AUTH_CONTINUE: Status = Status(0x0021);
    pub const ACCESS_DENIED: Status = Status(0x0024);
    pub const UNKNOWN_COMMAND: Status = Status(0x0081);
    pub const OUT_OF_MEMORY: Status = Status(0x0082);
    pub const NOT_SUPPORTED: Status = Status(0x0083);
    pub const INTERNAL_ERROR: Status = Status(0x0084);
    pub const BUSY: Status = Status(0x0085);
    pub const TEMPORARY_FAILURE: Status = Status(0x0086);
    pub const UNKNOWN_COLLECTION: Status = Status(0x0088);
    pub const SUBDOC_PATH_NOT_FOUND: Status = Status(0x00c0);

    /// Whether the request succeeded
    pub fn is_success(&self) -> bool {
        *self == Status::SUCCESS
    }

    fn name(&self) -> &'static str {
        match *self {
            Status::SUCCESS => "SUCCESS",
            Status::KEY_NOT_FOUND => "KEY_ENOENT",
            Status::KEY_EXISTS => "KEY_EEXISTS",
            Status::VALUE_TOO_LARGE => "E2BIG",
            Status::INVALID_ARGUMENTS => "EINVAL",
            Status::NOT_STORED => "NOT_STORED",
            Status::NOT_MY_VBUCKET => "NOT_MY_VBUCKET",
            Status::NO_BUCKET => "NO_BUCKET",
            Status::AUTH_ERROR => "AUTH_ERROR",
            Status::AUTH_CONTINUE => "AUTH_CONTINUE",
            Status::ACCESS_DENIED => "EACCESS",
            Status::UNKNOWN_COMMAND => "UNKNOWN_COMMAND",
            Status::OUT_OF_MEMORY => "ENOMEM",
            Status::NOT_SUPPORTED => "NOT_SUPPORTED",
            Status::INTERNAL_ERROR => "EINTERNAL",
            Status::BUSY => "EBUSY",
            Status::TEMPORARY_FAILURE => "TEMPORARY_FAILURE",
            Status::UNKNOWN_COLLECTION => "UNKNOWN_COLLECTION",
            Status::SUBDOC_PATH_NOT_FOUND => "SUBDOC_PATH_ENOENT",
            _ => "UNKNOWN_STATUS",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.name(), self.0)
    }
}

/// HELLO feature codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Feature {
    /// Extended attributes
    Xattr = 0x0006,
    /// Bucket selection on the connection
    SelectBucket = 0x0008,
    /// JSON datatype
    Json = 0x000b,
    /// Collection-id prefixed keys
    Collections = 0x0012,
}

impl Feature {
    /// Decode a feature code, if keymend knows it
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0006 => Some(Feature::Xattr),
            0x0008 => Some(Feature::SelectBucket),
            0x000b => Some(Feature::Json),
            0x0012 => Some(Feature::Collections),
            _ => None,
        }
    }
}
