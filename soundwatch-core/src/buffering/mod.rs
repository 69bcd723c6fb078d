//! Capture buffers.
//!
//! - [`buffer::AudioBuffer`]: the fixed-length window the worker reads into.
//! - A lock-free SPSC ring (`ringbuf::HeapRb<f32>`) that carries samples from
//!   the real-time audio callback to the worker thread. `push_slice` is
//!   wait-free and allocation-free, so it is safe inside the callback.

pub mod buffer;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the worker thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^19 = 524 288 f32 samples ≈ 10.9 s at 48 kHz.
/// Covers a slow inference call without the callback dropping frames.
pub const RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    create_audio_ring_with_capacity(RING_CAPACITY)
}

pub fn create_audio_ring_with_capacity(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
