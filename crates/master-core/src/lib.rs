#![deny(unreachable_pub)]

//! Core types and persistence for the Arbor workflow master.
//!
//! This crate owns the on-disk shape of a workflow directory: the
//! `config.xml` settings, the per-job records under `jobs/`, and the
//! in-memory tree state the master schedules from.

pub mod config;
pub mod cputime;
pub mod job;
pub mod layout;
pub mod store;
