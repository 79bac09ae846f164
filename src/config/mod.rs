//! Edge Configuration Module
//!
//! One declarative TOML document covers the whole deployment: device
//! identity, storage layout, alignment geometry and lag windows, inference
//! tuning, sync/purge behavior and the notification surface. Components
//! receive the sections they need at construction time; there is no global
//! config state.

mod edge_config;
pub mod defaults;

pub use edge_config::*;
