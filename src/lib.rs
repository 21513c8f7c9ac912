//! The hpi command line tool.
//!
//! Submits Slurm batch jobs described by a TOML configuration file and
//! follows them until they finish. The heavy lifting is done by the
//! [`hpi_engine`] crate.

pub mod commands;
pub mod config;
