// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testhub: the process-wide catalog of tests that
//! controllers publish, and the runs and results built on top of it.
//!
//! The main entry points are:
//!
//! * [`service::TestService`], which replicates the test tree from diffs,
//!   dispatches runs to controllers and coordinates refreshes.
//! * [`result_service::TestResultService`], which holds live and historical
//!   results and persists them through a [`storage::TestResultStorage`].
//! * [`host::ControllerHost`], which adapts both to controllers reached over
//!   some transport.

pub mod cancel;
pub mod collection;
pub mod config;
pub mod errors;
pub mod events;
pub mod exclusions;
mod helpers;
pub mod host;
pub mod observable;
pub mod profiles;
pub mod result;
pub mod result_service;
pub mod service;
pub mod storage;
#[cfg(test)]
mod test_helpers;
