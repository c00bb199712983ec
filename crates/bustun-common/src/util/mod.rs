mod ringbuffer;

pub use ringbuffer::RingBuffer;
