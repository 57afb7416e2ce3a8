// SPDX-License-Identifier: MPL-2.0

//! Wire constants and small codec helpers shared between `pbl-server` and
//! `pbl-agent`.
//!
//! This crate is `no_std` and allocation-free so it builds identically into
//! the host binary and the bare-metal agent; the two endpoints link the same
//! constants rather than each hard-coding their own copy.

#![no_std]

pub mod align;
pub mod wire;

pub use align::AlignExt;
