// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode builder ("assembler") for M-Token streams.
//!
//! A small public helper for constructing programs without hand-computing
//! varint widths, byte offsets, or token-relative jump operands. Primarily
//! intended for tests and prototypes; an agent-side emitter would typically
//! produce token lists directly.

use alloc::vec::Vec;
use core::fmt;

use crate::bytecode::{EncodeError, TemplateOperands, TokenTemplate, encode_tokens};
use crate::opcode::Opcode;
use crate::program::{LoadError, Program};

/// A control-flow label. Place it with [`Asm::place`]; it then names the
/// next emitted token.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A function handle returned by [`Asm::fn_begin`], usable as a call target
/// before or after the definition site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FnRef(u32);

/// A builder error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// A label was referenced but never placed.
    UnresolvedLabel,
    /// Encoding the stream failed.
    Encode(EncodeError),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel => write!(f, "label was referenced but never placed"),
            Self::Encode(e) => write!(f, "encode failed: {e}"),
        }
    }
}

impl core::error::Error for AsmError {}

impl From<EncodeError> for AsmError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

/// A build error from [`Asm::build_program`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// Assembly failed.
    Asm(AsmError),
    /// Loading (tokenize + lower) rejected the produced bytes.
    Load(LoadError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asm(e) => write!(f, "assemble: {e}"),
            Self::Load(e) => write!(f, "load: {e}"),
        }
    }
}

impl core::error::Error for BuildError {}

impl From<AsmError> for BuildError {
    fn from(e: AsmError) -> Self {
        Self::Asm(e)
    }
}

impl From<LoadError> for BuildError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

#[derive(Copy, Clone, Debug)]
enum AsmOperand {
    Concrete(TemplateOperands),
    JumpLabel(Label),
}

/// An M-Token assembler.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    tokens: Vec<(Opcode, AsmOperand)>,
    labels: Vec<Option<u32>>,
}

impl Asm {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens emitted so far.
    #[must_use]
    pub fn token_count(&self) -> u32 {
        self.tokens.len() as u32
    }

    fn emit(&mut self, opcode: Opcode, operand: TemplateOperands) {
        self.tokens.push((opcode, AsmOperand::Concrete(operand)));
    }

    /// Emits an operand-free opcode.
    pub fn op(&mut self, opcode: Opcode) {
        self.emit(opcode, TemplateOperands::None);
    }

    /// `LIT value`.
    pub fn lit(&mut self, value: i64) {
        self.emit(Opcode::Lit, TemplateOperands::Literal(value));
    }

    /// `V index` — push a local.
    pub fn v(&mut self, index: u32) {
        self.emit(Opcode::V, TemplateOperands::Index(index));
    }

    /// `LET index` — pop into a local.
    pub fn let_(&mut self, index: u32) {
        self.emit(Opcode::Let, TemplateOperands::Index(index));
    }

    /// `SET index` — pop into a global.
    pub fn set(&mut self, index: u32) {
        self.emit(Opcode::Set, TemplateOperands::Index(index));
    }

    /// `GTWAY cap` — grant a capability bit.
    pub fn gtway(&mut self, cap: u32) {
        self.emit(Opcode::Gtway, TemplateOperands::Index(cap));
    }

    /// `IOW device` — capability-gated device write.
    pub fn iow(&mut self, device: u32) {
        self.emit(Opcode::Iow, TemplateOperands::Index(device));
    }

    /// `IOR device` — capability-gated device read.
    pub fn ior(&mut self, device: u32) {
        self.emit(Opcode::Ior, TemplateOperands::Index(device));
    }

    /// `WAIT ms`.
    pub fn wait(&mut self, ms: u32) {
        self.emit(Opcode::Wait, TemplateOperands::Index(ms));
    }

    /// `TRACE level`.
    pub fn trace(&mut self, level: u32) {
        self.emit(Opcode::Trace, TemplateOperands::Index(level));
    }

    /// `BP id` — install a breakpoint at this token.
    pub fn bp(&mut self, id: u32) {
        self.emit(Opcode::Bp, TemplateOperands::Index(id));
    }

    /// Creates a fresh, unplaced label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Places `label` at the next emitted token.
    pub fn place(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.token_count());
    }

    /// `JZ label`.
    pub fn jz(&mut self, label: Label) {
        self.tokens.push((Opcode::Jz, AsmOperand::JumpLabel(label)));
    }

    /// `JNZ label`.
    pub fn jnz(&mut self, label: Label) {
        self.tokens.push((Opcode::Jnz, AsmOperand::JumpLabel(label)));
    }

    /// `JMP label`.
    pub fn jmp(&mut self, label: Label) {
        self.tokens.push((Opcode::Jmp, AsmOperand::JumpLabel(label)));
    }

    /// `JZ` with a raw token-relative offset.
    pub fn jz_rel(&mut self, offset: i32) {
        self.emit(Opcode::Jz, TemplateOperands::Jump(offset));
    }

    /// `JNZ` with a raw token-relative offset.
    pub fn jnz_rel(&mut self, offset: i32) {
        self.emit(Opcode::Jnz, TemplateOperands::Jump(offset));
    }

    /// `JMP` with a raw token-relative offset.
    pub fn jmp_rel(&mut self, offset: i32) {
        self.emit(Opcode::Jmp, TemplateOperands::Jump(offset));
    }

    /// Opens a function: emits `FN arity` and the body `B`, returning a
    /// handle usable as a call target.
    pub fn fn_begin(&mut self, arity: u32) -> FnRef {
        let at = self.token_count();
        self.emit(Opcode::Fn, TemplateOperands::Arity(arity));
        self.op(Opcode::B);
        FnRef(at)
    }

    /// Closes the innermost open block (`E`).
    pub fn fn_end(&mut self) {
        self.op(Opcode::E);
    }

    /// `CL f argc`.
    pub fn call(&mut self, f: FnRef, argc: u32) {
        self.emit(
            Opcode::Cl,
            TemplateOperands::Call {
                target_token: f.0,
                argc,
            },
        );
    }

    /// Resolves labels and encodes the stream.
    pub fn finish(&self) -> Result<Vec<u8>, AsmError> {
        let mut templates = Vec::with_capacity(self.tokens.len());
        for (i, &(opcode, operand)) in self.tokens.iter().enumerate() {
            let operands = match operand {
                AsmOperand::Concrete(t) => t,
                AsmOperand::JumpLabel(label) => {
                    let target = self.labels[label.0 as usize].ok_or(AsmError::UnresolvedLabel)?;
                    TemplateOperands::Jump((i64::from(target) - (i as i64 + 1)) as i32)
                }
            };
            templates.push(TokenTemplate { opcode, operands });
        }
        Ok(encode_tokens(&templates)?)
    }

    /// Encodes and loads (tokenize + lower) in one step.
    pub fn build_program(&self) -> Result<Program, BuildError> {
        Ok(Program::load(self.finish()?)?)
    }
}
