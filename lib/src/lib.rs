//! # Development VM provisioning
//!
//! This crate provisions a cloud virtual machine for development work and
//! bootstraps a toolchain on it, as a sequence of journaled, resumable steps
//! driving external command line tools.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
mod status;
mod utils;

mod bootstrap;
mod cloud;
mod config;
mod errors;
mod hostentry;
mod keys;
mod naming;
mod preflight;
mod provision;
mod remote;
mod retry;
mod secrets;
mod state;
mod step;
mod task;

#[cfg(test)]
mod testutils;
