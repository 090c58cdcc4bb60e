// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host ABI for the M-Token VM.
//!
//! The VM delegates every side effect to an embedder-provided [`Host`]:
//! device writes and reads (capability-gated by the interpreter), the
//! cooperative `WAIT` sleep, and the diagnostic trace sink used by `TRACE`,
//! the collector, and internal notes.
//!
//! Host callbacks must not fault the VM and must not re-enter the VM
//! instance that invoked them; errors are encoded in-band (a read typically
//! returns `Int`).

use crate::value::Value;

/// Embedder callbacks consumed by the interpreter.
pub trait Host {
    /// Writes `value` to device `device`. Failures are out of band.
    fn io_write(&mut self, device: u8, value: Value) {
        let _ = (device, value);
    }

    /// Reads a value from device `device`.
    fn io_read(&mut self, device: u8) -> Value {
        let _ = device;
        Value::Int(0)
    }

    /// Cooperative sleep. The host may block, truncate, or ignore.
    fn sleep(&mut self, ms: i32) {
        let _ = ms;
    }

    /// Diagnostic sink. Must not block meaningfully.
    fn trace(&mut self, level: u32, msg: &str) {
        let _ = (level, msg);
    }
}

/// A host that ignores writes, reads zero, and drops diagnostics.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullHost;

impl Host for NullHost {}
