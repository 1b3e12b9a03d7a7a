// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::test_id::TestId;
use proptest::prelude::*;

/// Strategy for a single ID segment. Segments never contain the delimiter.
pub fn arb_test_id_segment() -> impl Strategy<Value = String> {
    "[a-z0-9_.:]{1,8}"
}

/// Strategy for a test ID with between one and `max_depth + 1` segments.
pub fn arb_test_id(max_depth: usize) -> impl Strategy<Value = TestId> {
    prop::collection::vec(arb_test_id_segment(), 1..=max_depth + 1).prop_map(TestId::from_parts)
}

impl Arbitrary for TestId {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        arb_test_id(4).boxed()
    }
}
