//! Submission and supervision of Slurm batch jobs.
//!
//! The engine turns a declarative [`JobSpec`] and an explicitly selected
//! [`Payload`] into a Slurm batch job, including the environment needed by
//! multi-node distributed training, and submits it either through the local
//! Slurm tools or through a login node reached over SSH. Submitted jobs are
//! then observed with a [`JobMonitor`].
//!
//! ```no_run
//! use hpi_engine::EngineConfig;
//! use hpi_engine::Executor;
//! use hpi_engine::FunctionPayload;
//! use hpi_engine::JobSpec;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let executor = Executor::new(EngineConfig::default())?;
//! let mut spec = JobSpec::new("train", "gpu", "02:00:00");
//! spec.gpus_per_node = 4;
//! let handle = executor
//!     .submit_function(spec, FunctionPayload::new("train.py"))
//!     .await?;
//! let summary = executor.wait(&handle).await?;
//! println!("job {id} finished: {status}", id = summary.job_id, status = summary.status);
//! # Ok(())
//! # }
//! ```

mod config;
mod env;
mod error;
mod executor;
pub mod gateway;
mod job;
mod monitor;
mod plan;
mod request;
pub mod scheduler;
pub mod script;
pub mod slurm;
mod spec;
pub mod tracking;
mod transport;
mod validate;

pub use config::*;
pub use env::*;
pub use error::*;
pub use executor::*;
pub use job::*;
pub use monitor::*;
pub use plan::*;
pub use request::*;
pub use spec::*;
pub use transport::*;
pub use validate::*;
