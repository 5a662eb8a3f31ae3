#![doc = include_str!(".crate-docs.md")]
#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    // clippy::missing_docs_in_private_items,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms,
)]
#![allow(clippy::option_if_let_else, clippy::module_name_repetitions)]

mod config;
mod continuous;
mod error;
mod pipeline;
mod reader;
mod slot;
mod stats;
mod trigger;
mod triggered;
mod work;
mod worker;

pub use self::{
    config::{StageConfig, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STAGE_NAME},
    continuous::ContinuousStage,
    error::{Disconnected, StageError, TimeoutError, WaitError},
    pipeline::PipelineStage,
    reader::LatestReader,
    slot::{LatestValueSlot, SlotState, SlotStream},
    stats::StageStats,
    trigger::{UpdateClaim, UpdateTrigger},
    triggered::TriggeredStage,
    work::{Producer, Transform},
};

/// Polls `condition` until it holds, failing the test after a few seconds.
#[cfg(test)]
fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition was not met in time"
        );
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
