//! Scenario tests for `dcbcore`.
//!
//! The library part holds a small university domain (students registering
//! and enrolling in courses with limited seats) and a harness that wires it
//! to the in-memory store and actor host. The scenarios live under
//! `tests/`.

pub mod university;

pub use university::University;
