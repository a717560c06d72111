//! Integration tests for the unregister controller
//!
//! These tests tell the story of a storage administrator handing volumes
//! back to the backend without destroying the data on them.
//!
//! # Test Organization
//!
//! - `fake_cluster`: In-memory cluster with resourceVersion checks and
//!   per-operation fault injection
//!
//! - `reconcile`: Stories about single reconciliations, including crashes
//!   between steps and the attempt that picks up afterwards
//!
//! - `dispatcher`: Stories about the worker pool feeding the reconciler,
//!   with requeues, backoff and isolation between requests

mod dispatcher;
mod reconcile;
