//! wireprobe-proto: wire protocol scaffolding for the wireprobe harness.
//!
//! This crate is the protocol-library boundary the conformance core calls
//! into. It supplies:
//!
//! - interface and message-signature metadata ([`Interface`], [`MessageSpec`])
//! - the typed argument union ([`Arg`]) and the 24.8 fixed-point type
//! - the framed wire codec (length-checked header + signature-driven args)
//! - per-side object tables with stable integer ids ([`Endpoint`] resources
//!   on the driver side, [`Link`] proxies on the subject side)
//! - the "post outgoing message" primitive
//!
//! It is deliberately mechanical: which objects are permitted to exist, and
//! what a message *means*, is the harness's business.

pub mod arg;
pub mod endpoint;
pub mod interface;
pub mod link;
pub mod wire;

pub use arg::{Arg, Fixed, ObjectId};
pub use endpoint::{Endpoint, Resource, WireEvent};
pub use interface::{DeviceKind, Interface, MessageSpec, ProtocolObject};
pub use link::{Link, Proxy, SOCKET_ENV};
pub use wire::RawMessage;
