pub mod node;
pub mod tiny_lfu;

pub use node::{Entry, Node, QueueTag, ValueSlot, NO_DEADLINE};
pub use tiny_lfu::{PolicyConfig, PolicyCore};
