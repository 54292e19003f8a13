//! An incremental, content-addressed filesystem backup engine.
//!
//! See the [`engine`] module for the core backup lifecycle, [`search`] for
//! how a backup's config document picks which paths it covers, and
//! [`metadata`] for the on-disk history format everything else builds on.

pub mod blob;
pub mod cli;
pub mod config;
pub mod engine;
pub mod hashing;
pub mod metadata;
pub mod path;
pub mod report;
pub mod restore;
pub mod search;
pub mod stat;
