//! Raw query functions for the operation journal.
//!
//! Everything here is mechanical row movement; transition validation and
//! event fan-out are layered on top by `warden-core`.

pub mod operations;
