pub mod event;
pub mod task;

pub use event::{Event, EventError};
pub use task::{Condition, Task};
