//! Sample buffering between the real-time audio threads and the session.
//!
//! - `ringbuf::HeapRb<f32>` carries raw samples out of the cpal callback with
//!   a wait-free `push_slice`.
//! - [`FrameAssembler`] cuts the drained stream into fixed-size frames.
//! - [`OutboundQueue`] is the bounded, newest-wins hand-off between the
//!   capture thread and the transport pump.

pub mod assemble;
pub mod chunk;
pub mod outbound;

use ringbuf::{traits::Split, HeapRb};

pub use assemble::FrameAssembler;
pub use outbound::{OutboundQueue, PushOutcome};
pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the capture worker thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^18 = 262 144 f32 samples ≈ 5.5 s at 48 kHz.
/// Voice frames are drained every few milliseconds, so this only has to
/// absorb scheduler hiccups on the worker thread.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
