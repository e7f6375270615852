//! Translation data structures and algorithms
//!
//! This module contains the per-operation machinery of the gateway:
//!
//! - `bundle`: push-bundle parsing and rendering
//! - `commit`: Git-side commit, author and content-hash types
//! - `environment`: startup environment override file
//! - `fetch`: changelists back to commits (interface-level reconstruction)
//! - `mapping`: branch-mapping config and view maps
//! - `submit`: push-level atomicity over per-changelist submits
//! - `translate`: commits to staged depot changelists
//! - `trigger`: submit triggers, protocol bridge and preflight policy

pub mod bundle;
pub mod commit;
pub mod environment;
pub mod fetch;
pub mod mapping;
pub mod submit;
pub mod translate;
pub mod trigger;
