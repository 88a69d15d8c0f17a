//! Attribute Protocol (ATT) boundary
//!
//! The GATT client does not put bytes on the wire itself. It drives an
//! [`AttributeProtocol`] implementation supplied by the transport layer and
//! receives results through [`AttributeProtocolCallback`].

pub mod constants;
pub mod error;
pub mod protocol;

// Re-export the public API
pub use self::constants::*;
pub use self::error::{AttErrorCode, AttResult};
pub use self::protocol::{AttributeProtocol, AttributeProtocolCallback, RequestId};
