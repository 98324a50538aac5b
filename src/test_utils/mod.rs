//! Test doubles for the host kernel and the processor.

pub mod mock;
