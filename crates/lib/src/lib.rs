// The internals docs are built with --document-private-items, so allow
// linking to private items from module documentation.
#![allow(rustdoc::private_intra_doc_links)]

//! # Transactional OS upgrades
//!
//! This crate installs, resets and upgrades an image based operating
//! system laid out on a fixed set of labeled partitions. Every system
//! version lives in its own snapshot image on the state partition; a
//! new one becomes bootable in a single atomic step, and a failed run
//! leaves the previous one untouched.
//!
//! The `snapos` binary (`crates/cli`) is a thin wrapper that delegates
//! to [`cli::run_from_iter`]. The API is internal and not stable for
//! external consumption.
//!
//! # Module Index
//!
//! ## Workflows
//!
//! - [`cli`] - Command line parsing and dispatch
//! - [`action`] - Install, reset, upgrade and upgrade-recovery
//! - [`cleanup`] - Deferred cleanup jobs run at the end of a workflow
//! - [`error`] - Error kinds and process exit codes
//!
//! ## Storage
//!
//! - [`snapshotter`] - Numbered system snapshots and the commit point
//! - [`state`] - The install state ledger (`state.yaml`)
//! - [`partition`] - Partition discovery, mounting and formatting
//! - [`image`] - Building filesystem images from trees
//! - [`deploy`] - Populating trees from [`source::ImageSource`] values
//!
//! ## Boot
//!
//! - [`bootloader`] - GRUB installation and environment variables
//! - [`kernel`] - Finding kernels and initrds in trees
//! - [`selinux`] - Relabeling deployed trees
//! - [`hook`] - Running cloud-config hook stages
//! - [`power`] - Reboot and power off

mod action;
mod bootloader;
mod cleanup;
pub mod cli;
mod config;
mod deploy;
pub mod error;
mod hook;
mod image;
mod kernel;
mod partition;
mod power;
mod selinux;
mod snapshotter;
mod source;
mod state;

#[cfg(test)]
mod testutil;
