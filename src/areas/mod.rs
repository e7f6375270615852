//! Long-lived gateway components
//!
//! This module contains the stateful building blocks of the gateway:
//!
//! - `depot`: file-backed centralized store (changelists, counters, locks)
//! - `object_store`: content-addressed blob storage inside the depot
//! - `locks`: cross-host repository lock with heartbeat and reaping
//! - `gateway`: per-repository orchestration of push, fetch and admin ops

pub mod depot;
pub mod gateway;
pub mod locks;
pub mod object_store;
