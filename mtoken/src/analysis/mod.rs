// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Verifier analyses over the token-level flow graph.

pub(crate) mod bitset;
pub(crate) mod cfg;
