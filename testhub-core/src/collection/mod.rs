// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test trees maintained by applying diffs.
//!
//! [`IncrementalTestCollection`] is the generic tree: it applies an ordered
//! sequence of [`TestDiffOp`](testhub_metadata::TestDiffOp)s and tracks busy
//! items and pending roots. [`MainTestCollection`] is the process-wide tree
//! that controllers publish into.

mod incremental;
mod main_collection;

pub use incremental::*;
pub use main_collection::*;
