// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure taxonomy of the tree engine. Every fallible operation returns one
/// of these; none of them leaves observable state behind.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    #[error("ring buffer capacity must be a power of two and >= 2")]
    InvalidCapacity,

    #[error("arena capacity exceeded")]
    ArenaFull,

    #[error("arena already freed")]
    ArenaFreed,

    #[error("global node index space exhausted")]
    NodeIndexExhausted,

    #[error("epoch id exceeds u32 range")]
    EpochIdOverflow,

    #[error("unknown version")]
    UnknownVersion,
}
