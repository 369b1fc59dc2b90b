//! Test fixtures

mod faults;
mod two_node;

pub use faults::{FaultState, FaultyFileOpener};
pub use two_node::{ALPHA, BETA, LoopbackConnector, TwoNodeFixture};
