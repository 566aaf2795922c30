//! Internal tests module
//!
//! End-to-end scenarios with full access to crate internals.
