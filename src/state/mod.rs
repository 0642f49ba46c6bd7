//! State Management Module
//!
//! Local persistent state of this node.

mod tracker;

pub use tracker::{JoinKind, StateTracker};
