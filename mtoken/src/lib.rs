// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `mtoken`: a compact, verifiable stack bytecode ("M-Token") and its VM.
//!
//! The crate is organized as a three-stage pipeline around shared VM state:
//! load/lower ([`program`]), verify ([`verifier`]), interpret ([`vm`]).
//! Side effects are mediated by an embedder-provided [`host::Host`] and are
//! only reachable through capability bits granted by the `GTWAY` opcode.
//!
//! ## Example
//!
//! ```no_run
//! extern crate alloc;
//!
//! use mtoken::asm::Asm;
//! use mtoken::host::NullHost;
//! use mtoken::opcode::Opcode;
//! use mtoken::verifier::{VerifyConfig, verify_program};
//! use mtoken::vm::{Limits, Vm};
//!
//! let mut a = Asm::new();
//! a.lit(5);
//! a.lit(3);
//! a.lit(2);
//! a.op(Opcode::Mul);
//! a.op(Opcode::Add);
//! a.op(Opcode::Halt);
//!
//! let program = a.build_program()?;
//! verify_program(&program, &VerifyConfig::default())?;
//!
//! let mut vm = Vm::new(program, NullHost, Limits::default());
//! let out = vm.run();
//! assert!(out.completed);
//! assert_eq!(out.result, Some(11));
//! # Ok::<(), alloc::boxed::Box<dyn core::error::Error>>(())
//! ```

#![no_std]

extern crate alloc;

pub(crate) mod analysis;
pub mod asm;
pub mod bytecode;
pub mod disasm;
pub mod format;
pub(crate) mod heap;
pub mod host;
pub(crate) mod lower;
pub mod opcode;
pub mod program;
pub mod trace;
pub mod value;
pub mod verifier;
pub mod vm;
