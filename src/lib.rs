//! Bidirectional, chunked message streaming over a position-addressed
//! publish/subscribe channel pair.
//!
//! A client pushes an arbitrarily large logical message as a sequence of
//! framed parts; a server dispatches each incoming stream to a handler
//! registered for its stream type, which runs its own state machine and may
//! emit further parts in response.
//!
//! # Architecture
//!
//! ```text
//! +---------+  push   +--------------+  pull   +----------+
//! | Client  | ------> |  channel /0  | ------> |  Server  |
//! | engine  |         +--------------+         |  engine  |
//! |         | <------ |  channel /1  | <------ |          |
//! +---------+  pull   +--------------+  push   +----------+
//! ```
//!
//! Both sides share one base path; each writes the channel the other reads.
//! A stream's identity is the transport position of its first packet, so ids
//! are durable and implicitly ordered.
//!
//! # Example
//!
//! ```no_run
//! use streamgate::fsm::{no_trace, StateMachine, Transition};
//! use streamgate::gateway::{set_stream_event_names, EV_ONE};
//! use streamgate::{Client, Params, Server, StateSet, StreamInfo};
//!
//! # fn main() -> streamgate::Result<()> {
//! let params = Params::default();
//! let mut server = Server::create("/tmp/gw".as_ref(), &params, no_trace())?;
//! server.add_handler(
//!     1,
//!     |part, trace| {
//!         let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
//!         set_stream_event_names(&mut fsm);
//!         fsm.add_transition(Transition::new(0, EV_ONE, 1, "Single message"));
//!         fsm
//!     },
//!     StateSet::from([1]),
//!     StreamInfo::with_id,
//! );
//!
//! let client = Client::create("/tmp/gw".as_ref(), &params)?;
//! let mut fsm: StateMachine<()> = StateMachine::new("push", no_trace());
//! let mut info = StreamInfo::new();
//! client.start(
//!     1,
//!     |part| {
//!         part.buffer = bytes::Bytes::from_static(b"Hello world");
//!         false
//!     },
//!     &mut fsm,
//!     &mut (),
//!     &StateSet::from([0]),
//!     &mut info,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fsm;
pub mod gateway;
pub mod transport;
pub mod wire;

pub use error::{GatewayError, Result};
pub use gateway::client::Client;
pub use gateway::server::{Server, ServerCore, StopHandle};
pub use gateway::{StateSet, StreamInfo, StreamPart};
pub use transport::{Params, Publisher, Record, Subscriber};
