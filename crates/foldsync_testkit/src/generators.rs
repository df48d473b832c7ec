//! Property-based test generators using proptest.
//!
//! Provides strategies for edit sequences, file arrival orders and crash
//! points.

use crate::crash::CRASH_STATES;
use foldsync_core::MoveState;
use proptest::prelude::*;

/// Strategy for one appended chunk of text.
pub fn chunk_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ]{1,8}").expect("Invalid regex")
}

/// Strategy for a sequence of edits, one update each.
pub fn edits_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(chunk_strategy(), 1..=max.max(1))
}

/// Strategy for an arrival order of `len` files: a permutation of
/// `0..len`.
pub fn arrival_order(len: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..len).collect::<Vec<_>>()).prop_shuffle()
}

/// Strategy for an arrival order that leaves some files behind: a shuffled
/// subset of `0..len`.
pub fn partial_arrival(len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::sample::subsequence((0..len).collect::<Vec<_>>(), 0..=len).prop_shuffle()
}

/// Strategy for a persisted move state to crash in.
pub fn crash_state_strategy() -> impl Strategy<Value = MoveState> {
    prop::sample::select(CRASH_STATES.to_vec())
}

/// Strategy for a list of sequence numbers in `1..=max` with at least one
/// missing.
pub fn gapped_sequences(max: u64) -> impl Strategy<Value = (Vec<u64>, u64)> {
    let max = max.max(2);
    (1..=max).prop_flat_map(move |missing| {
        let present: Vec<u64> = (1..=max).filter(|&s| s != missing).collect();
        (Just(present), Just(missing))
    })
}
