//! termport: a binary term call bridge between runtimes.
//!
//! Two processes hold a byte stream (pipe or socket) and exchange
//! length-prefixed, tagged-term frames. Either side registers handlers by
//! `(module, function)` name and calls the other side's handlers; responses
//! match requests by correlation id, so a handler may call back into its
//! caller's runtime before returning (nested, reentrant calls).
//!
//! # Architecture
//!
//! - **term**: the [`Term`] value model exchanged across the bridge
//! - **codec**: tagged binary term encoding + length-prefixed framing
//! - **protocol**: wire message shapes (`{call, ...}` / `{reply, ...}`)
//! - **dispatch**: the registered function table and handler invocation
//! - **link**: reader loop, writer path, pending call table, caller stub
//! - **transport**: TCP/Unix endpoints and the env handoff to a peer
//! - **peer**: spawning a peer process and bridging over its stdio

pub mod codec;
pub mod dispatch;
pub mod link;
pub mod peer;
pub mod protocol;
pub mod term;
pub mod transport;

pub use codec::{DecodeError, MessageCodec};
pub use dispatch::{Fault, Handler, HandlerRegistry, HandlerResult};
pub use link::{CallError, CallHandle, Link, LinkConfig, LinkState};
pub use peer::{Peer, over_stdio};
pub use protocol::{CallId, CallOutcome, ProtocolError, WireMessage};
pub use term::{Atom, Term};
pub use transport::{BridgeListener, BridgeStream, ENDPOINT_ENV, EndpointInfo};
