#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod image;
pub mod launcher;
pub mod logging;
pub mod paths;
pub mod registry;
pub mod supervisor;
pub mod vm_state;
