//! tern-net: a multi-reactor, non-blocking TCP server framework.
//!
//! One acceptor loop receives connections and round-robins each onto one
//! of N worker event loops, where it lives for the rest of its lifetime.
//! Loops are thread-affine: every handler for a descriptor runs on its
//! loop's thread, and foreign threads hand work over through a
//! mutex-guarded task queue plus an eventfd wake-up. Payloads are opaque;
//! the embedder frames messages in its callbacks.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tern_net::{Address, Buffer, ConnectionRef, EventLoop, Server};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let main_loop = EventLoop::new()?;
//!     let server = Server::new(main_loop.clone(), &Address::new("0.0.0.0", 7000))?;
//!     server.set_thread_count(4)?;
//!     server.set_message_callback(Arc::new(
//!         |conn: &ConnectionRef, input: &mut Buffer, _now| {
//!             let payload = input.take();
//!             conn.send(&payload);
//!         },
//!     ));
//!     server.start()?;
//!     main_loop.run();
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod address;
pub mod buffer;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub mod poller;
pub mod pool;
pub mod server;
pub mod socket;

pub use acceptor::Acceptor;
pub use address::Address;
pub use buffer::Buffer;
pub use connection::{
    Connection, ConnectionCallback, ConnectionRef, ConnectionState, ErrorCallback,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
pub use dispatcher::{Dispatcher, EventKind, EventSet};
pub use error::{NetError, Result};
pub use event_loop::{EventLoop, LoopStatus};
pub use poller::{Poller, Transition};
pub use pool::WorkerPool;
pub use server::Server;
pub use socket::SocketHandle;
