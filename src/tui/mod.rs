//! Terminal monitor for the bus machine.
//!
//! Provides an interactive terminal view with:
//! - Registers and the loop state
//! - The data region, with dirty cache entries alongside
//! - Bus counters
//! - Step/run/pause/reset controls

mod app;
mod ui;

pub use app::{MonitorApp, run_monitor};
