pub mod clock;
pub mod scheduler;

pub use clock::{Clock, RuntimeClock};
pub use scheduler::{ReadyFuture, ScheduledTask, Task, TaskScheduler, TokioScheduler};
