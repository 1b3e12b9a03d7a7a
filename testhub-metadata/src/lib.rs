// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Data shapes exchanged between testhub and the controllers that publish
//! tests into it.
//!
//! This crate has no I/O and no async code: it contains the test ID codec,
//! test items and the diff operations that mutate a collection of them, run
//! profiles and requests, and the persisted form of run results.

mod diff;
mod item;
mod profile;
#[cfg(feature = "proptest1")]
mod proptest_helpers;
mod request;
mod result;
mod test_id;

pub use diff::*;
pub use item::*;
pub use profile::*;
#[cfg(feature = "proptest1")]
pub use proptest_helpers::*;
pub use request::*;
pub use result::*;
pub use test_id::*;
