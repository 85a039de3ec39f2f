pub mod counters;
pub mod model;
pub mod spec;

pub use counters::{VisibilityCounters, VisibilityState};
pub use model::{TriggerHandler, TriggerState, VisibilityModel};
pub use spec::{ReportWhen, VisibilitySpec};
