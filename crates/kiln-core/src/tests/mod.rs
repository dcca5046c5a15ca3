//! Test module for kiln-core
//!
//! Scenario tests driven through `KilnCore` with in-memory backends:
//! - Instance registry lifecycle
//! - Init, platform install and compile streams
//! - Board discovery snapshots and watches
//! - Debug target resolution
//! - Debug relay negotiation and byte flow
//! - Config loading through the core

mod resolver_tests;
