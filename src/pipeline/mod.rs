pub mod context;
pub mod dispatch;
pub mod latest;
pub mod receiver;
pub mod stats;

pub use context::IngestContext;
pub use dispatch::{BusMessage, Diagnostic, GraphState, LifecycleState, LoopControl};
pub use latest::LatestFrame;
pub use receiver::Receiver;
pub use stats::{Severity, Statistics, StatsReport, StatsSnapshot};
