//! PAL autosampler dispatch core.
//!
//! - [`method`]: typed chemistry methods and caller requests
//! - [`plan`]: job plans, micro-operations and vendor job entries
//! - [`compiler`]: source/destination resolution and archive bookkeeping
//! - [`trigger`]: start/continue/done hardware rendezvous
//! - [`scheduler`]: inter-run spacing
//! - [`transport`]: local, ssh and simulated job submission
//! - [`datalog`]: auxiliary log files and per-run data records
//! - [`dispatch`]: the persistent dispatch loop

pub mod compiler;
pub mod datalog;
pub mod dispatch;
pub mod method;
pub mod plan;
pub mod scheduler;
pub mod transport;
pub mod trigger;

pub use dispatch::{PalDispatcher, PalOutcome, RunHandle};
pub use method::{MethodKind, PalMethod, PalRequest, PlanSettings};
pub use plan::{JobEntry, JobPlan, MicroOperation, PalAction};
