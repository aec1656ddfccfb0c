//! Resolution logic: turns a provisioning request into resolved features.
//!
//! Each module is one phase of a run and is driven by
//! [`crate::provisioner::Provisioner`]; none of them keeps state between runs.
//!
//! # Modules
//!
//! - `layout`: transitive feature packs, install order, package selections
//! - `packages`: per-pack package graph and its closure
//! - `configs`: config selection, group expansion, config ordering
//! - `params`: parameter override stacks and the merge rules
//! - `references`: feature identities, deduplication, foreign keys
//! - `capabilities`: provided/required capability matching

pub mod capabilities;
pub mod configs;
pub mod layout;
pub mod packages;
pub mod params;
pub mod references;
