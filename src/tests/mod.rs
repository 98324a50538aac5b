//! Unit tests for the x86_vmm crate.
//!
//! Scenario tests run against the simulated kernel and processor in
//! [`crate::test_utils::mock`].

mod general_registers;
