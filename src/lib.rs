//! # workd
//!
//! A shared work queue with pluggable job handlers, recurring schedules and
//! crash recovery, driven by interval-polling or event-driven workers.
//!
//! Any number of worker processes may share one queue: the claim step is
//! the single atomic operation that keeps each item executing at most once.

pub mod config;
pub mod db;
pub mod debounce;
pub mod director;
pub mod error;
pub mod event;
pub mod model;
pub mod plugins;
pub mod queue;
pub mod schedule;
pub mod telemetry;
pub mod worker;
