//! Orchestrator core for the warden backup supervisor.
//!
//! Drives a restic-compatible backup binary across multiple repositories on
//! user-declared schedules, records every attempt in a durable operation
//! journal, streams lifecycle events to subscribers, and lets in-flight
//! work be cancelled or superseded.
//!
//! The pieces, leaves first:
//!
//! - [`oplog`] -- the append-only operation journal with live fan-out.
//! - [`events`] -- the broadcast broker behind the fan-out.
//! - [`repo`] -- the `RepoDriver` seam to the backup subprocess, plus the
//!   registry that memoizes drivers and serializes access per repository.
//! - [`tasks`] -- the schedulable units (backup, forget, prune, restore,
//!   index, stats, check) and their state machines.
//! - [`orchestrator`] -- the priority-queue scheduler loop.
//! - [`service`] -- the supervisor facade a transport binds against.
//! - [`signing`] / [`logstore`] -- download-URL signing and log blobs.

pub mod config;
pub mod events;
pub mod logstore;
pub mod oplog;
pub mod orchestrator;
pub mod repo;
pub mod service;
pub mod signing;
pub mod tasks;
