//! Conflict detection and patch synthesis for Paradox-style script mods.
//!
//! A collection is parsed into [`definition::Definition`]s, analysed by
//! [`conflicts::ConflictDetector`] and kept in sync with an on-disk patch mod by
//! [`patch_collection::PatchCollectionService`]. [`merge::MergeService`] flattens
//! a collection into a single mod.

pub mod collaborators;
pub mod collection;
pub mod config;
pub mod conflicts;
pub mod definition;
pub mod error;
pub mod game;
pub mod ignore;
pub mod indexed;
pub mod logging;
pub mod merge;
pub mod parser;
pub mod patch_collection;
pub mod patch_state;
pub mod priority;
pub mod progress;
pub mod staleness;
pub mod storage;
mod sync;
