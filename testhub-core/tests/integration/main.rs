// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod collection;
mod fixtures;
mod results;
mod runs;
