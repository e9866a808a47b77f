//! Property-based tests for backoff, the suspension gate and reconnect budgets.
//!
//! Run with: cargo test --test property_tests
//!
//! These tests use proptest to generate random inputs and verify that
//! invariants hold across all building blocks.

pub mod budget;
