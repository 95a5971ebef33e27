//! Asynchronous TCP session engine.
//!
//! The engine is completion-based: receive and send operations are posted
//! against a session, run as short-lived I/O tasks, and report back through a
//! single completion queue drained by a fixed pool of worker tasks.
//!
//! # Components
//!
//! - `EngineInner`: shared core — session table, message pools, completion
//!   queue, user callbacks
//! - `IoGuard`: RAII in-flight-operation token; the last guard to drop tears
//!   the session down
//! - worker pool: drains completions, runs frame reassembly and send
//!   recycling
//! - send scheduler: periodically batches each session's queued messages into
//!   one gather write
//! - `NetServer` / `NetClient`: accept-side and connect-side front ends over
//!   the same core
//!
//! # Guarantees
//!
//! - frames are delivered to `on_recv` in network arrival order per session
//! - queued messages leave in `send` call order per session
//! - teardown runs exactly once per session activation, never concurrently
//!   with an in-flight operation's callback

pub use acceptor::NetServer;
pub use connector::NetClient;
pub use engine::{Engine, NetEvents};

mod acceptor;
mod completion;
mod connector;
mod engine;
mod receiver;
mod sender;
