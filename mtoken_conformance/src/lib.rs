// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance scenarios live in `tests/conformance.rs`.
