//! The coordinating side of the grid: planning, supervision and result
//! delivery.
//!
//! ```ignore
//! let cluster = LocalCluster::start(3, EngineConfig::default())?;
//! cluster.store().put_all("input", [("1", "10"), ("2", "20")]);
//!
//! let total = cluster
//!     .engine()
//!     .job("input")
//!     .mapper(workload::sum::map)
//!     .reducer(workload::sum::reduce)
//!     .submit()?
//!     .get()
//!     .await?;
//! ```

pub mod builder;
pub mod cluster;
pub mod coordinator;
pub mod handle;
pub mod jobs;
pub mod planner;

pub use builder::{Grouped, Job, MappingJob, Reduced, ReducingJob};
pub use cluster::{Engine, LocalCluster};
pub use coordinator::{Collation, JobCoordinator};
pub use handle::{JobHandle, JobOutcome};
pub use jobs::{JobInfo, JobRegistry, JobStatus};
pub use planner::{PartitionPlan, PartitionPlanner};
