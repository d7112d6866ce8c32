//! Testing utilities for docstage.
//!
//! This module provides:
//! - Scripted and recording stage handlers
//! - Fixture registries and a harness with a manual clock
//! - Assertions over stage rows, markers and document status

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_document_status, assert_markers_consistent, assert_stage_status,
    wait_for_document_status,
};
pub use fixtures::{
    deterministic_policy, diamond_registry, epoch, linear_registry, TestHarness,
};
pub use mocks::{RecordedCall, RecordingHandler, ScriptedHandler, SlowHandler, Step};
