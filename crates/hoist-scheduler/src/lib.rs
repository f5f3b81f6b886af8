//! hoist-scheduler — allocation scheduling and deployment sequencing.
//!
//! Both halves run during a build, inside the same write transaction:
//!
//! ```text
//! declarations
//!   ├── sequencer::compute_levels  (job dependency graph → level per job)
//!   └── allocation::schedule       (workers × jobs → allocation rows,
//!                                   soft removal, disables, levels stamped)
//! ```
//!
//! The scheduler recomputes the whole allocation set on every build. The
//! deterministic allocation id keeps repeated upserts stable, and rows are
//! never hard-deleted here: the rollout engine deletes a removed allocation
//! only after it has been stopped.

pub mod allocation;
pub mod error;
pub mod sequencer;

pub use allocation::{Projection, ScheduleSummary, declare_cluster, project, schedule};
pub use error::{SchedulerError, SchedulerResult, SequenceError};
pub use sequencer::{Levels, compute_levels, jobs_by_level};
