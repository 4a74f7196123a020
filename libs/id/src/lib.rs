//! # outpost-id
//!
//! Identifier types shared by every outpost crate.
//!
//! ## ID Format
//!
//! Generated identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `conn_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Endpoint ids are different: they are names chosen by the upstream
//! (`svc-a`, `billing.internal`) and are validated rather than generated.
//! See [`EndpointId`].

mod endpoint;
mod error;
mod macros;
mod types;

pub use endpoint::EndpointId;
pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
