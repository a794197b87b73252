pub mod deque;
pub mod read_buffer;
pub mod sketch;
pub mod timer_wheel;
pub mod write_buffer;

pub use deque::{AccessOrder, Arena, Linked, LinkedDeque, Links, NodeRef, WheelOrder, WriteOrder};
pub use read_buffer::{OfferResult, ReadBuffer};
pub use sketch::FrequencySketch;
pub use timer_wheel::{TimerNode, TimerWheel};
pub use write_buffer::{WriteBuffer, WRITE_BUFFER_CAPACITY};
