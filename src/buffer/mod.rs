pub use ring_buffer::RingBuffer;
mod ring_buffer;
