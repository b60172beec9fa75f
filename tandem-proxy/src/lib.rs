//! # tandem-proxy — simulator transport for the tandem orchestrator
//!
//! One [`Proxy`] per simulator, whatever its habitat:
//!
//! | Connection | Simulator lives |
//! |------------|-----------------|
//! | [`LocalConnection`] | in this process, implementing [`ApiSimulator`] |
//! | [`RemoteConnection`] | behind a framed JSON channel (TCP or any transport) |
//!
//! The scheduler cannot tell the two apart: both answer the same
//! [`ApiCall`]s through the [`Connection`] trait, and both route
//! simulator-to-orchestrator callbacks through the same
//! [`SimulatorLink`]. Version adapters ([`adapters`]) wrap a
//! connection when `init` reports an older protocol version.

#![deny(missing_docs)]

pub mod adapters;
pub mod call;
pub mod link;
pub mod local;
pub mod proxy;
pub mod remote;

pub use call::{ApiCall, ApiReply};
pub use link::{EntitySelector, LinkHandle, SimulatorLink, dispatch_request};
pub use local::{ApiSimulator, LocalConnection, SimError};
pub use proxy::{Connection, Proxy};
pub use remote::{RemoteConnection, Transport};
