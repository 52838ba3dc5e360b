//! Shared test utilities for flashd integration tests.
//!
//! This module provides:
//! - `EngineHarness`, a scheduler wired to an in-memory metrics store,
//!   a fresh registry and a scripted flasher
//! - `MockFlasher` with per-port scripted outcomes
//! - Builders for configurations and port observations

pub mod builders;
pub mod harness;
pub mod mock_flasher;

pub use builders::*;
pub use harness::EngineHarness;
pub use mock_flasher::{Behavior, MockFlasher};
