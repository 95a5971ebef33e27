mod buffer;
mod message;
mod network;
mod service;
mod session;

pub use buffer::RingBuffer;
pub use message::{
    FrameHeader, FrameKind, LocalPool, Message, MessagePool, Pooled, Reusable, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use network::{Engine, NetClient, NetEvents, NetServer};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BufferConfig, EngineConfig,
    NetworkConfig, Shutdown, WorkerConfig,
};
pub use session::SessionUid;
