//! Helpers for driving the `keystage` binary from integration tests.

pub mod harness;
