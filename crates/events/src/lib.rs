//! Job lifecycle events and the pub/sub mechanics that carry them.

pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{JobEvent, JobEventKind};
