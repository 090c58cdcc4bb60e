// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The M-Token interpreter.
//!
//! The VM executes loaded (lowered) [`Program`]s one opcode per step until
//! `HALT`, a trap, or a resource budget trips. Handlers validate their
//! preconditions before mutating state, so a trap never leaves partial
//! writes behind. The decoded token stream built at load time is the only
//! thing dispatch reads; program bytes are never re-decoded at run time.
//!
//! Side effects go through the [`Host`] and are gated by the capability
//! bitmap: a bit is only ever set by a successful `GTWAY` in the same
//! session and survives until `reset`.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::bytecode::Operands;
use crate::heap::{HeapError, ValueHeap};
use crate::host::Host;
use crate::opcode::Opcode;
use crate::program::Program;
use crate::trace::{SimResult, TRACE_MAX, TraceRow};
use crate::value::Value;

/// Hard upper bound on the data stack.
pub const STACK_MAX: usize = 256;
/// Size of the per-frame locals array.
pub const LOCALS_SIZE: usize = 64;
/// Size of the globals array.
pub const GLOBALS_SIZE: usize = 128;
/// Bound on the return-address and saved-frame stacks.
pub const RET_STACK_SIZE: usize = 32;

/// Execution limits for a VM session.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Step budget. Zero disables the budget.
    pub step_limit: u64,
    /// Gas budget. Zero disables gas metering.
    pub gas_limit: u64,
    /// Maximum call depth.
    pub call_depth_limit: u32,
    /// Data stack bound, clamped to [`STACK_MAX`].
    pub stack_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            step_limit: 1_000_000,
            gas_limit: 0,
            call_depth_limit: 32,
            stack_limit: STACK_MAX,
        }
    }
}

/// Auto-collection policy.
#[derive(Copy, Clone, Debug)]
pub struct GcConfig {
    /// Run the collector when the allocation counter crosses `threshold`.
    pub auto: bool,
    /// Allocation count that triggers an automatic collection.
    pub threshold: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            auto: false,
            threshold: 256,
        }
    }
}

/// A runtime fault.
///
/// `Breakpoint` and `DebugStep` are cooperative pauses: re-entering
/// [`Vm::run`] resumes. Every other fault requires [`Vm::reset`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs, reason = "kinds carry their stable names via `Fault::name`")]
pub enum Fault {
    BadEncoding,
    UnknownOp,
    PcOob,
    StackOverflow,
    StackUnderflow,
    RetStackOverflow,
    RetStackUnderflow,
    LocalsOob,
    GlobalsOob,
    IndexOob,
    DivByZero,
    ModByZero,
    TypeMismatch,
    BadArg,
    StepLimit,
    GasExhausted,
    CallDepthLimit,
    OutOfMemory,
    Unauthorized,
    AssertFailed,
    Breakpoint,
    DebugStep,
}

impl Fault {
    /// Stable display name (part of the ABI).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BadEncoding => "BAD_ENCODING",
            Self::UnknownOp => "UNKNOWN_OP",
            Self::PcOob => "PC_OOB",
            Self::StackOverflow => "STACK_OVERFLOW",
            Self::StackUnderflow => "STACK_UNDERFLOW",
            Self::RetStackOverflow => "RET_STACK_OVERFLOW",
            Self::RetStackUnderflow => "RET_STACK_UNDERFLOW",
            Self::LocalsOob => "LOCALS_OOB",
            Self::GlobalsOob => "GLOBALS_OOB",
            Self::IndexOob => "INDEX_OOB",
            Self::DivByZero => "DIV_BY_ZERO",
            Self::ModByZero => "MOD_BY_ZERO",
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::BadArg => "BAD_ARG",
            Self::StepLimit => "STEP_LIMIT",
            Self::GasExhausted => "GAS_EXHAUSTED",
            Self::CallDepthLimit => "CALL_DEPTH_LIMIT",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::AssertFailed => "ASSERT_FAILED",
            Self::Breakpoint => "BREAKPOINT",
            Self::DebugStep => "DEBUG_STEP",
        }
    }

    /// Returns `true` for the resumable debug pauses.
    #[must_use]
    pub const fn is_debug_pause(self) -> bool {
        matches!(self, Self::Breakpoint | Self::DebugStep)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl core::error::Error for Fault {}

/// Coarse VM mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Initial, after `HALT`, or paused at a debug fault.
    Stopped,
    /// Inside `run`/`step`.
    Running,
    /// A non-debug fault is set; `reset` is required.
    Faulted,
}

/// The outcome of one `run`.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    /// `true` when the run ended without a fault.
    pub completed: bool,
    /// The fault that ended the run, if any.
    pub fault: Option<Fault>,
    /// Steps executed in this session.
    pub steps: u64,
    /// Top of stack at the end, coerced to the integer domain.
    pub result: Option<i64>,
}

/// The M-Token virtual machine.
pub struct Vm<H: Host> {
    program: Program,
    host: H,
    limits: Limits,
    gc: GcConfig,

    stack: Vec<Value>,
    locals: Vec<Value>,
    globals: Vec<Value>,
    ret_stack: Vec<u32>,
    frames: Vec<Vec<Value>>,
    caps: [u64; 4],
    heap: ValueHeap,
    breakpoints: HashMap<u32, u32>,

    pc: u32,
    last_pc: u32,
    last_op_index: u32,
    last_op: Option<Opcode>,
    steps: u64,
    gas: u64,
    call_depth: u32,
    running: bool,
    fault: Option<Fault>,
    single_step: bool,
    skip_bp_at: Option<u32>,
}

impl<H: Host> fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("pc", &self.pc)
            .field("steps", &self.steps)
            .field("fault", &self.fault)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<H: Host> Vm<H> {
    /// Creates a VM over a loaded program.
    #[must_use]
    pub fn new(program: Program, host: H, limits: Limits) -> Self {
        let stack_limit = limits.stack_limit.min(STACK_MAX);
        Self {
            program,
            host,
            limits: Limits {
                stack_limit,
                ..limits
            },
            gc: GcConfig::default(),
            stack: Vec::with_capacity(stack_limit),
            locals: vec![Value::default(); LOCALS_SIZE],
            globals: vec![Value::default(); GLOBALS_SIZE],
            ret_stack: Vec::new(),
            frames: Vec::new(),
            caps: [0; 4],
            heap: ValueHeap::new(),
            breakpoints: HashMap::new(),
            pc: 0,
            last_pc: 0,
            last_op_index: 0,
            last_op: None,
            steps: 0,
            gas: 0,
            call_depth: 0,
            running: false,
            fault: None,
            single_step: false,
            skip_bp_at: None,
        }
    }

    /// Replaces the step budget.
    pub fn set_step_limit(&mut self, limit: u64) {
        self.limits.step_limit = limit;
    }

    /// Replaces the gas budget (zero disables metering).
    pub fn set_gas_limit(&mut self, limit: u64) {
        self.limits.gas_limit = limit;
    }

    /// Replaces the call depth budget.
    pub fn set_call_depth_limit(&mut self, limit: u32) {
        self.limits.call_depth_limit = limit;
    }

    /// Replaces the data stack bound, clamped to [`STACK_MAX`].
    pub fn set_stack_limit(&mut self, limit: usize) {
        self.limits.stack_limit = limit.min(STACK_MAX);
    }

    /// Replaces the auto-collection policy.
    pub fn set_gc_config(&mut self, gc: GcConfig) {
        self.gc = gc;
    }

    /// Returns the loaded program.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Returns the host.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Returns the host mutably.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Returns the current fault, if any.
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    /// Returns the coarse VM mode.
    #[must_use]
    pub fn state(&self) -> VmState {
        match self.fault {
            Some(f) if !f.is_debug_pause() => VmState::Faulted,
            _ if self.running => VmState::Running,
            _ => VmState::Stopped,
        }
    }

    /// Steps executed in the current session.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Gas spent in the current session.
    #[must_use]
    pub fn gas(&self) -> u64 {
        self.gas
    }

    /// Current program counter (byte offset).
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Byte offset of the most recently dispatched opcode.
    #[must_use]
    pub fn last_pc(&self) -> u32 {
        self.last_pc
    }

    /// A read-only view of the data stack, bottom first.
    #[must_use]
    pub fn stack_snapshot(&self) -> &[Value] {
        &self.stack
    }

    /// Clears session state: stacks, counters, fault, capabilities.
    ///
    /// The loaded program, limits, host, heap allocation list, and
    /// breakpoints survive.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.locals.fill(Value::default());
        self.globals.fill(Value::default());
        self.ret_stack.clear();
        self.frames.clear();
        self.caps = [0; 4];
        self.pc = 0;
        self.last_pc = 0;
        self.last_op_index = 0;
        self.last_op = None;
        self.steps = 0;
        self.gas = 0;
        self.call_depth = 0;
        self.running = false;
        self.fault = None;
        self.single_step = false;
        self.skip_bp_at = None;
    }

    /// Arms a session: resumes a debug pause in place, otherwise resets and
    /// starts from the top.
    pub fn start(&mut self) {
        match self.fault {
            Some(f) if f.is_debug_pause() => {
                self.fault = None;
                self.skip_bp_at = Some(self.pc);
            }
            _ => self.reset(),
        }
        self.running = true;
    }

    /// Runs until halt, trap, or budget exhaustion.
    pub fn run(&mut self) -> RunResult {
        self.start();
        while self.running && self.pc < self.program.byte_len() {
            self.dispatch();
        }
        self.running = false;
        self.outcome()
    }

    /// Executes one dispatch iteration of an armed session.
    ///
    /// Hosts that need a wall-clock timeout call [`Vm::start`] once and then
    /// drive `step` in a loop, stopping whenever they choose.
    pub fn step(&mut self) {
        if self.running && self.pc >= self.program.byte_len() {
            self.running = false;
            return;
        }
        self.dispatch();
    }

    /// Runs like [`Vm::run`] while recording one trace row per step.
    pub fn simulate(&mut self) -> SimResult {
        self.start();
        let mut trace = Vec::new();

        while self.running && self.pc < self.program.byte_len() {
            let steps_before = self.steps;
            self.dispatch();
            if self.steps > steps_before
                && let Some(opcode) = self.last_op
                && trace.len() < TRACE_MAX
            {
                trace.push(TraceRow {
                    step: self.steps,
                    pc: self.last_pc,
                    opcode,
                    sp: self.sp(),
                    stack_top: self.stack.last().map_or(0, |v| v.as_int()),
                });
            }
        }
        self.running = false;

        let out = self.outcome();
        SimResult {
            completed: out.completed,
            halted: true,
            fault: out.fault,
            steps: out.steps,
            sp: self.sp(),
            result: out.result,
            trace,
        }
    }

    fn outcome(&self) -> RunResult {
        RunResult {
            completed: self.fault.is_none(),
            fault: self.fault,
            steps: self.steps,
            result: self.stack.last().map(|v| v.as_int()),
        }
    }

    fn sp(&self) -> i32 {
        self.stack.len() as i32 - 1
    }

    fn trap(&mut self, fault: Fault) {
        self.fault = Some(fault);
        self.running = false;
    }

    fn dispatch(&mut self) {
        if !self.running {
            return;
        }
        let len = self.program.byte_len();
        if self.pc == len {
            self.running = false;
            return;
        }
        if self.pc > len {
            self.trap(Fault::PcOob);
            return;
        }
        let Some(op_index) = self.program.token_at_byte(self.pc) else {
            self.trap(Fault::PcOob);
            return;
        };

        let resumed_at = self.skip_bp_at.take();
        if self.breakpoints.contains_key(&op_index) && resumed_at != Some(self.pc) {
            self.fault = Some(Fault::Breakpoint);
            self.running = false;
            return;
        }

        self.steps += 1;
        if self.limits.step_limit > 0 && self.steps > self.limits.step_limit {
            self.trap(Fault::StepLimit);
            return;
        }

        self.last_pc = self.pc;
        self.last_op_index = op_index;
        self.last_op = None;

        let Some(token) = self.program.token(op_index).copied() else {
            self.trap(Fault::PcOob);
            return;
        };
        let Some(next_pc) = self.program.token_offset(op_index + 1) else {
            self.trap(Fault::PcOob);
            return;
        };
        self.pc = next_pc;
        self.last_op = Some(token.opcode);

        if self.limits.gas_limit > 0 {
            self.gas += token.opcode.gas_cost();
            if self.gas > self.limits.gas_limit {
                self.trap(Fault::GasExhausted);
                return;
            }
        }

        if let Err(fault) = self.exec(token.opcode, token.operands) {
            self.trap(fault);
            return;
        }

        if self.single_step && self.running {
            self.single_step = false;
            self.fault = Some(Fault::DebugStep);
            self.running = false;
        }
    }

    fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.stack.len() >= self.limits.stack_limit {
            return Err(Fault::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, Fault> {
        Ok(self.pop()?.as_int())
    }

    fn need(&self, count: usize) -> Result<(), Fault> {
        if self.stack.len() < count {
            return Err(Fault::StackUnderflow);
        }
        Ok(())
    }

    /// Resolves a token-relative jump and moves the pc there.
    fn jump_to(&mut self, offset: i32) -> Result<(), Fault> {
        let target = i64::from(self.last_op_index) + 1 + i64::from(offset);
        if target < 0 || target >= i64::from(self.program.token_count()) {
            return Err(Fault::PcOob);
        }
        self.goto_token(target as u32)
    }

    /// Moves the pc to `token`, where one past the end is a clean stop.
    fn goto_token(&mut self, token: u32) -> Result<(), Fault> {
        self.pc = self
            .program
            .token_offset(token)
            .ok_or(Fault::PcOob)?;
        Ok(())
    }

    fn binary_int(&mut self, f: impl FnOnce(i64, i64) -> i64) -> Result<(), Fault> {
        self.need(2)?;
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(f(a, b)))
    }

    fn compare(&mut self, f: impl FnOnce(i64, i64) -> bool) -> Result<(), Fault> {
        self.binary_int(|a, b| i64::from(f(a, b)))
    }

    fn maybe_auto_collect(&mut self) {
        if self.gc.auto && self.heap.allocs_since_collect() >= self.gc.threshold {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let stats = self.heap.collect(
            self.stack
                .iter()
                .chain(self.locals.iter())
                .chain(self.globals.iter())
                .chain(self.frames.iter().flatten())
                .copied(),
        );
        self.host
            .trace(0, &format!("gc: freed={} live={}", stats.freed, stats.live));
    }

    fn heap_fault(e: HeapError) -> Fault {
        match e {
            HeapError::BadHandle => Fault::BadArg,
            HeapError::WrongKind => Fault::TypeMismatch,
            HeapError::OutOfBounds => Fault::IndexOob,
        }
    }

    fn cap_get(&self, device: u32) -> bool {
        if device >= 256 {
            return false;
        }
        (self.caps[(device / 64) as usize] >> (device % 64)) & 1 == 1
    }

    fn cap_set(&mut self, cap: u32) {
        self.caps[(cap / 64) as usize] |= 1 << (cap % 64);
    }

    fn operand_index(operands: Operands) -> u32 {
        match operands {
            Operands::Index(i) => i,
            _ => 0,
        }
    }

    #[allow(
        clippy::too_many_lines,
        reason = "one arm per opcode keeps the contracts auditable"
    )]
    fn exec(&mut self, opcode: Opcode, operands: Operands) -> Result<(), Fault> {
        match opcode {
            Opcode::Lit => {
                let Operands::Literal(v) = operands else {
                    return Err(Fault::BadEncoding);
                };
                self.push(Value::Int(v))
            }
            Opcode::V => {
                let i = Self::operand_index(operands) as usize;
                if i >= LOCALS_SIZE {
                    return Err(Fault::LocalsOob);
                }
                self.push(self.locals[i])
            }
            Opcode::Let => {
                let i = Self::operand_index(operands) as usize;
                self.need(1)?;
                if i >= LOCALS_SIZE {
                    return Err(Fault::LocalsOob);
                }
                self.locals[i] = self.pop()?;
                Ok(())
            }
            Opcode::Set => {
                let i = Self::operand_index(operands) as usize;
                self.need(1)?;
                if i >= GLOBALS_SIZE {
                    return Err(Fault::GlobalsOob);
                }
                self.globals[i] = self.pop()?;
                Ok(())
            }

            Opcode::Add => self.binary_int(i64::wrapping_add),
            Opcode::Sub => self.binary_int(i64::wrapping_sub),
            Opcode::Mul => self.binary_int(i64::wrapping_mul),
            Opcode::Div => {
                self.need(2)?;
                let b = self.pop_int()?;
                if b == 0 {
                    return Err(Fault::DivByZero);
                }
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_div(b)))
            }
            Opcode::Mod => {
                self.need(2)?;
                let b = self.pop_int()?;
                if b == 0 {
                    return Err(Fault::ModByZero);
                }
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_rem(b)))
            }
            Opcode::And => self.binary_int(|a, b| a & b),
            Opcode::Or => self.binary_int(|a, b| a | b),
            Opcode::Xor => self.binary_int(|a, b| a ^ b),
            Opcode::Shl => self.binary_int(|a, b| a << (b & 63)),
            Opcode::Shr => self.binary_int(|a, b| a >> (b & 63)),
            Opcode::Neg => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_neg()))
            }
            Opcode::Not => {
                let a = self.pop_int()?;
                self.push(Value::Int(!a))
            }

            Opcode::Lt => self.compare(|a, b| a < b),
            Opcode::Gt => self.compare(|a, b| a > b),
            Opcode::Le => self.compare(|a, b| a <= b),
            Opcode::Ge => self.compare(|a, b| a >= b),
            Opcode::Eq => {
                self.need(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int(i64::from(a.same_as(b))))
            }
            Opcode::Neq => {
                self.need(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int(i64::from(!a.same_as(b))))
            }

            Opcode::Dup => {
                let top = *self.stack.last().ok_or(Fault::StackUnderflow)?;
                self.push(top)
            }
            Opcode::Drp => {
                self.pop()?;
                Ok(())
            }
            Opcode::Swp => {
                self.need(2)?;
                let n = self.stack.len();
                self.stack.swap(n - 1, n - 2);
                Ok(())
            }
            Opcode::Rot => {
                self.need(3)?;
                let n = self.stack.len();
                // [a, b, c] -> [b, c, a]
                let a = self.stack[n - 3];
                self.stack[n - 3] = self.stack[n - 2];
                self.stack[n - 2] = self.stack[n - 1];
                self.stack[n - 1] = a;
                Ok(())
            }

            Opcode::NewArr => {
                let size = self.pop_int()?;
                if size < 0 {
                    return Err(Fault::BadArg);
                }
                if size > 1_000_000 {
                    return Err(Fault::OutOfMemory);
                }
                let arr = self.heap.new_array(size as usize);
                self.push(Value::Array(arr))?;
                self.maybe_auto_collect();
                Ok(())
            }
            Opcode::Idx => {
                self.need(2)?;
                let index = self.pop_int()?;
                let arr = match self.pop()? {
                    Value::Array(a) => a,
                    _ => return Err(Fault::TypeMismatch),
                };
                if index < 0 {
                    return Err(Fault::IndexOob);
                }
                let v = self
                    .heap
                    .array_get(arr, index as usize)
                    .map_err(Self::heap_fault)?;
                self.push(v)
            }
            Opcode::Sto => {
                self.need(3)?;
                let value = self.pop()?;
                let index = self.pop_int()?;
                let arr = match self.pop()? {
                    Value::Array(a) => a,
                    _ => return Err(Fault::TypeMismatch),
                };
                if index < 0 {
                    return Err(Fault::IndexOob);
                }
                self.heap
                    .array_set(arr, index as usize, value)
                    .map_err(Self::heap_fault)?;
                self.push(Value::Array(arr))
            }
            Opcode::Len => {
                let len = match self.pop()? {
                    Value::Array(a) => self.heap.array_len(a).map_err(Self::heap_fault)?,
                    Value::Str(s) => self.heap.str_len(s).map_err(Self::heap_fault)?,
                    _ => return Err(Fault::TypeMismatch),
                };
                self.push(Value::Int(len as i64))
            }

            Opcode::Alloc => {
                let size = self.pop_int()?;
                if size <= 0 {
                    return Err(Fault::BadArg);
                }
                if size > 1_000_000 {
                    return Err(Fault::OutOfMemory);
                }
                let buf = self.heap.new_buffer(size as usize);
                self.push(Value::Opaque(buf))?;
                self.maybe_auto_collect();
                Ok(())
            }
            Opcode::Free => {
                let buf = match self.pop()? {
                    Value::Opaque(b) => b,
                    _ => return Err(Fault::TypeMismatch),
                };
                self.heap.free_buffer(buf).map_err(Self::heap_fault)
            }

            Opcode::B | Opcode::E | Opcode::Ph => Ok(()),
            Opcode::If => self.exec_if(),

            Opcode::Jz => {
                let Operands::Jump(off) = operands else {
                    return Err(Fault::BadEncoding);
                };
                if self.pop_int()? == 0 {
                    self.jump_to(off)?;
                }
                Ok(())
            }
            Opcode::Jnz => {
                let Operands::Jump(off) = operands else {
                    return Err(Fault::BadEncoding);
                };
                if self.pop_int()? != 0 {
                    self.jump_to(off)?;
                }
                Ok(())
            }
            Opcode::Jmp => {
                let Operands::Jump(off) = operands else {
                    return Err(Fault::BadEncoding);
                };
                self.jump_to(off)
            }

            Opcode::Fn => {
                // Function bodies execute only via CL; fall-through skips.
                let body_b = self.last_op_index + 1;
                if self.program.token(body_b).map(|t| t.opcode) != Some(Opcode::B) {
                    return Err(Fault::BadArg);
                }
                let body_e = self
                    .program
                    .matching_block_end(body_b)
                    .ok_or(Fault::BadArg)?;
                self.goto_token(body_e + 1)
            }
            Opcode::Cl => self.exec_call(operands),
            Opcode::Rt => self.exec_return(),

            Opcode::Iow => {
                let device = Self::operand_index(operands);
                if !self.cap_get(device) {
                    return Err(Fault::Unauthorized);
                }
                let value = self.pop()?;
                self.host.io_write(device as u8, value);
                Ok(())
            }
            Opcode::Ior => {
                let device = Self::operand_index(operands);
                if !self.cap_get(device) {
                    return Err(Fault::Unauthorized);
                }
                if self.stack.len() >= self.limits.stack_limit {
                    return Err(Fault::StackOverflow);
                }
                let value = self.host.io_read(device as u8);
                self.push(value)
            }

            Opcode::Gtway => {
                let cap = Self::operand_index(operands);
                if cap > 255 {
                    return Err(Fault::BadArg);
                }
                self.cap_set(cap);
                Ok(())
            }
            Opcode::Wait => {
                let ms = Self::operand_index(operands);
                self.host.sleep(ms.min(i32::MAX as u32) as i32);
                Ok(())
            }
            Opcode::Halt => {
                self.running = false;
                Ok(())
            }
            Opcode::Trace => {
                let level = Self::operand_index(operands);
                let msg = format!(
                    "trace level={level}: pc={} op={} sp={}",
                    self.last_pc,
                    opcode.mnemonic(),
                    self.sp()
                );
                self.host.trace(level, &msg);
                Ok(())
            }
            Opcode::Gc => {
                self.collect_garbage();
                Ok(())
            }
            Opcode::Bp => {
                let id = Self::operand_index(operands);
                self.breakpoints.insert(self.last_op_index, id);
                Ok(())
            }
            Opcode::Step => {
                self.single_step = true;
                Ok(())
            }

            // Structured loops never reach dispatch: loading lowers them.
            Opcode::Wh | Opcode::Fr => Err(Fault::UnknownOp),
        }
    }

    /// `IF`: a truthy condition falls through into the then-block as-is
    /// (`E` is a no-op, so execution continues through the else-block too);
    /// a falsy condition scans past the then-block and the else-block's
    /// opening `B` and resumes inside the else-block.
    fn exec_if(&mut self) -> Result<(), Fault> {
        let cond = self.pop()?;
        if cond.is_truthy() {
            return Ok(());
        }

        let then_b = self.last_op_index + 1;
        if self.program.token(then_b).map(|t| t.opcode) != Some(Opcode::B) {
            return Err(Fault::BadArg);
        }
        let then_e = self
            .program
            .matching_block_end(then_b)
            .ok_or(Fault::BadArg)?;
        let else_b = then_e + 1;
        if self.program.token(else_b).map(|t| t.opcode) != Some(Opcode::B) {
            return Err(Fault::BadArg);
        }
        self.goto_token(else_b + 1)
    }

    fn exec_call(&mut self, operands: Operands) -> Result<(), Fault> {
        let Operands::Call { target, argc } = operands else {
            return Err(Fault::BadEncoding);
        };
        if self.call_depth >= self.limits.call_depth_limit {
            return Err(Fault::CallDepthLimit);
        }
        if argc as usize > LOCALS_SIZE {
            return Err(Fault::LocalsOob);
        }
        self.need(argc as usize)?;

        let callee = self.program.token_at_byte(target).ok_or(Fault::PcOob)?;
        if self.program.token(callee).map(|t| t.opcode) != Some(Opcode::Fn) {
            return Err(Fault::BadArg);
        }
        if self.program.token(callee + 1).map(|t| t.opcode) != Some(Opcode::B) {
            return Err(Fault::BadArg);
        }
        if self.frames.len() >= RET_STACK_SIZE || self.ret_stack.len() >= RET_STACK_SIZE {
            return Err(Fault::RetStackOverflow);
        }

        let caller_locals =
            core::mem::replace(&mut self.locals, vec![Value::default(); LOCALS_SIZE]);
        self.frames.push(caller_locals);
        // Rightmost pop binds locals[0]: the last-pushed argument is arg 0.
        for i in 0..argc as usize {
            self.locals[i] = self.pop()?;
        }
        self.ret_stack.push(self.pc);
        self.call_depth += 1;

        self.goto_token(callee + 2)
    }

    fn exec_return(&mut self) -> Result<(), Fault> {
        let ret_value = self.pop()?;
        let (Some(caller_locals), Some(ret_addr)) = (self.frames.pop(), self.ret_stack.pop())
        else {
            return Err(Fault::RetStackUnderflow);
        };
        self.locals = caller_locals;
        self.call_depth = self.call_depth.saturating_sub(1);
        self.push(ret_value)?;
        // A return address at the code end is a clean stop.
        if ret_addr > self.program.byte_len() {
            return Err(Fault::PcOob);
        }
        self.pc = ret_addr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::vec::Vec;

    use super::*;
    use crate::asm::Asm;
    use crate::host::NullHost;

    #[derive(Default)]
    struct RecordingHost {
        writes: Vec<(u8, i64)>,
        reads: Vec<u8>,
        read_value: i64,
        sleeps: Vec<i32>,
        traces: Vec<(u32, String)>,
    }

    impl Host for RecordingHost {
        fn io_write(&mut self, device: u8, value: Value) {
            self.writes.push((device, value.as_int()));
        }

        fn io_read(&mut self, device: u8) -> Value {
            self.reads.push(device);
            Value::Int(self.read_value)
        }

        fn sleep(&mut self, ms: i32) {
            self.sleeps.push(ms);
        }

        fn trace(&mut self, level: u32, msg: &str) {
            self.traces.push((level, String::from(msg)));
        }
    }

    fn run_asm(a: Asm) -> RunResult {
        let program = a.build_program().unwrap();
        Vm::new(program, NullHost, Limits::default()).run()
    }

    #[test]
    fn arithmetic_program_runs() {
        let mut a = Asm::new();
        a.lit(5);
        a.lit(3);
        a.lit(2);
        a.op(Opcode::Mul);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(out.completed);
        assert_eq!(out.result, Some(11));
        assert_eq!(out.steps, 6);
    }

    #[test]
    fn division_by_zero_traps() {
        let mut a = Asm::new();
        a.lit(10);
        a.lit(0);
        a.op(Opcode::Div);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(!out.completed);
        assert_eq!(out.fault, Some(Fault::DivByZero));
    }

    #[test]
    fn modulo_sign_follows_dividend() {
        for (a_val, b_val, want) in [(10, 3, 1), (-5, 2, -1), (5, -2, 1)] {
            let mut a = Asm::new();
            a.lit(a_val);
            a.lit(b_val);
            a.op(Opcode::Mod);
            a.op(Opcode::Halt);
            let out = run_asm(a);
            assert_eq!(out.result, Some(want), "{a_val} % {b_val}");
        }
    }

    #[test]
    fn shifts_mask_to_six_bits() {
        let mut a = Asm::new();
        a.lit(1);
        a.lit(65); // 65 & 63 == 1
        a.op(Opcode::Shl);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).result, Some(2));
    }

    #[test]
    fn arithmetic_wraps_two_complement() {
        let mut a = Asm::new();
        a.lit(i64::MAX);
        a.lit(1);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).result, Some(i64::MIN));
    }

    #[test]
    fn locals_and_globals_roundtrip() {
        let mut a = Asm::new();
        a.lit(10);
        a.let_(0);
        a.lit(5);
        a.v(0);
        a.op(Opcode::Add);
        a.set(3);
        a.lit(0); // unrelated filler so the result is observable
        a.op(Opcode::Drp);
        a.lit(1);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(out.completed);
    }

    #[test]
    fn stack_shuffles() {
        let mut a = Asm::new();
        a.lit(1);
        a.lit(2);
        a.lit(3);
        a.op(Opcode::Rot); // 2 3 1
        a.op(Opcode::Swp); // 2 1 3
        a.op(Opcode::Drp); // 2 1
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert_eq!(out.result, Some(1));
    }

    #[test]
    fn nested_calls_compute() {
        // add(a, b) = a + b; double(x) = add(x, x); double(5) + double(3).
        let mut a = Asm::new();
        let add = a.fn_begin(2);
        a.v(0);
        a.v(1);
        a.op(Opcode::Add);
        a.op(Opcode::Rt);
        a.fn_end();
        let double = a.fn_begin(1);
        a.v(0);
        a.v(0);
        a.call(add, 2);
        a.op(Opcode::Rt);
        a.fn_end();
        a.lit(5);
        a.call(double, 1);
        a.lit(3);
        a.call(double, 1);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);

        let out = run_asm(a);
        assert!(out.completed);
        assert_eq!(out.result, Some(16));
    }

    #[test]
    fn call_depth_limit_traps() {
        let mut a = Asm::new();
        let f = a.fn_begin(0);
        a.call(f, 0);
        a.op(Opcode::Rt);
        a.fn_end();
        a.call(f, 0);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::CallDepthLimit));
    }

    #[test]
    fn if_true_falls_through_both_arms() {
        // E is a no-op, so the truthy path runs the then-arm and continues
        // through the else-arm.
        let mut a = Asm::new();
        a.lit(1);
        a.op(Opcode::If);
        a.op(Opcode::B);
        a.lit(10);
        a.op(Opcode::E);
        a.op(Opcode::B);
        a.lit(20);
        a.op(Opcode::E);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(20));
        assert_eq!(vm.stack_snapshot(), &[Value::Int(10), Value::Int(20)]);
    }

    #[test]
    fn if_false_runs_only_else_arm() {
        let mut a = Asm::new();
        a.lit(0);
        a.op(Opcode::If);
        a.op(Opcode::B);
        a.lit(10);
        a.op(Opcode::E);
        a.op(Opcode::B);
        a.lit(20);
        a.op(Opcode::E);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(20));
        assert_eq!(vm.stack_snapshot(), &[Value::Int(20)]);
    }

    #[test]
    fn lowered_while_loop_sums() {
        let mut a = Asm::new();
        a.lit(0);
        a.let_(0); // sum
        a.lit(5);
        a.let_(1); // i
        a.v(1);
        a.lit(0);
        a.op(Opcode::Gt);
        a.op(Opcode::Wh);
        a.op(Opcode::B);
        a.v(0);
        a.v(1);
        a.op(Opcode::Add);
        a.let_(0);
        a.v(1);
        a.lit(1);
        a.op(Opcode::Sub);
        a.let_(1);
        a.op(Opcode::E);
        a.v(0);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(out.completed);
        assert_eq!(out.result, Some(15));
    }

    #[test]
    fn step_limit_trips_on_infinite_backedge() {
        let mut a = Asm::new();
        a.jmp_rel(-1);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        vm.set_step_limit(1000);
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::StepLimit));
        assert_eq!(out.steps, 1001);
    }

    #[test]
    fn jump_to_the_last_token_succeeds() {
        let mut a = Asm::new();
        a.lit(0);
        a.jz_rel(0); // lands exactly on HALT
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        assert!(vm.run().completed);
    }

    #[test]
    fn jump_one_past_the_last_token_traps() {
        let mut a = Asm::new();
        a.jmp_rel(1);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        assert_eq!(vm.run().fault, Some(Fault::PcOob));
    }

    #[test]
    fn unauthorized_write_traps_at_the_io_token() {
        let mut a = Asm::new();
        a.lit(1);
        a.iow(5);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::Unauthorized));
        // The fault is attributed to the IOW token.
        assert_eq!(vm.program().token_at_byte(vm.last_pc()), Some(1));
    }

    #[test]
    fn gateway_authorizes_only_its_device() {
        let mut a = Asm::new();
        a.gtway(1);
        a.lit(100);
        a.iow(1);
        a.lit(200);
        a.iow(2); // not granted
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, RecordingHost::default(), Limits::default());
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::Unauthorized));
        assert_eq!(vm.host().writes, alloc::vec![(1, 100)]);
    }

    #[test]
    fn io_read_pushes_host_value() {
        let mut a = Asm::new();
        a.gtway(7);
        a.ior(7);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(
            program,
            RecordingHost {
                read_value: 42,
                ..RecordingHost::default()
            },
            Limits::default(),
        );
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(42));
        assert_eq!(vm.host().reads, alloc::vec![7]);
    }

    #[test]
    fn capability_above_255_is_bad_arg() {
        let mut a = Asm::new();
        a.gtway(256);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).fault, Some(Fault::BadArg));
    }

    #[test]
    fn wait_reaches_the_host() {
        let mut a = Asm::new();
        a.wait(250);
        a.lit(1);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, RecordingHost::default(), Limits::default());
        assert!(vm.run().completed);
        assert_eq!(vm.host().sleeps, alloc::vec![250]);
    }

    #[test]
    fn trace_reports_and_preserves_state() {
        let mut a = Asm::new();
        a.lit(9);
        a.trace(2);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, RecordingHost::default(), Limits::default());
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(9));
        let (level, msg) = &vm.host().traces[0];
        assert_eq!(*level, 2);
        assert!(msg.contains("sp=0"), "unexpected trace: {msg}");
    }

    #[test]
    fn arrays_store_and_index() {
        let mut a = Asm::new();
        a.lit(3);
        a.op(Opcode::NewArr);
        a.op(Opcode::Dup);
        a.lit(0);
        a.lit(42);
        a.op(Opcode::Sto);
        a.op(Opcode::Drp);
        a.op(Opcode::Dup);
        a.lit(0);
        a.op(Opcode::Idx);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(out.completed);
        assert_eq!(out.result, Some(42));
    }

    #[test]
    fn array_index_bounds() {
        // index == len traps, len - 1 succeeds, negative traps.
        let mut a = Asm::new();
        a.lit(2);
        a.op(Opcode::NewArr);
        a.lit(2);
        a.op(Opcode::Idx);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).fault, Some(Fault::IndexOob));

        let mut a = Asm::new();
        a.lit(2);
        a.op(Opcode::NewArr);
        a.lit(1);
        a.op(Opcode::Idx);
        a.op(Opcode::Halt);
        assert!(run_asm(a).completed);

        let mut a = Asm::new();
        a.lit(2);
        a.op(Opcode::NewArr);
        a.lit(-1);
        a.op(Opcode::Idx);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).fault, Some(Fault::IndexOob));
    }

    #[test]
    fn len_on_non_array_is_type_mismatch() {
        let mut a = Asm::new();
        a.lit(5);
        a.op(Opcode::Len);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).fault, Some(Fault::TypeMismatch));
    }

    #[test]
    fn alloc_free_roundtrip_and_double_free() {
        let mut a = Asm::new();
        a.lit(16);
        a.op(Opcode::Alloc);
        a.op(Opcode::Free);
        a.lit(1);
        a.op(Opcode::Halt);
        assert!(run_asm(a).completed);

        let mut a = Asm::new();
        a.lit(16);
        a.op(Opcode::Alloc);
        a.op(Opcode::Dup);
        a.op(Opcode::Free);
        a.op(Opcode::Free);
        a.op(Opcode::Halt);
        assert_eq!(run_asm(a).fault, Some(Fault::BadArg));
    }

    #[test]
    fn gc_opcode_frees_dropped_arrays() {
        let mut a = Asm::new();
        a.lit(4);
        a.op(Opcode::NewArr);
        a.op(Opcode::Drp);
        a.op(Opcode::Gc);
        a.lit(1);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, RecordingHost::default(), Limits::default());
        assert!(vm.run().completed);
        let gc_line = vm
            .host()
            .traces
            .iter()
            .find(|(_, m)| m.starts_with("gc:"))
            .expect("collector reports through the trace sink");
        assert!(gc_line.1.contains("freed=1"), "{}", gc_line.1);
    }

    #[test]
    fn gas_metering_trips_only_when_enabled() {
        let mut a = Asm::new();
        a.lit(10);
        a.lit(2);
        a.op(Opcode::Div);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();

        let mut vm = Vm::new(program.clone(), NullHost, Limits::default());
        assert!(vm.run().completed);

        let mut vm = Vm::new(program, NullHost, Limits::default());
        vm.set_gas_limit(3); // LIT(2) + LIT(2) already exceeds
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::GasExhausted));
    }

    #[test]
    fn breakpoint_pauses_and_resumes() {
        // The BP token inside the loop is revisited on iteration two.
        let mut a = Asm::new();
        a.lit(0);
        a.let_(0);
        let top = a.new_label();
        a.place(top);
        a.bp(1); // installs at its own token, hit on revisit
        a.v(0);
        a.lit(1);
        a.op(Opcode::Add);
        a.let_(0);
        a.v(0);
        a.lit(3);
        a.op(Opcode::Lt);
        a.jnz(top);
        a.v(0);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());

        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::Breakpoint));
        assert_eq!(vm.state(), VmState::Stopped);

        // Resume twice more: once per remaining iteration.
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::Breakpoint));
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(3));
    }

    #[test]
    fn step_opcode_pauses_then_resumes() {
        let mut a = Asm::new();
        a.op(Opcode::Step);
        a.lit(5);
        a.lit(3);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());

        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::DebugStep));
        assert_eq!(vm.state(), VmState::Stopped);

        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(8));
    }

    #[test]
    fn reset_clears_capabilities_but_keeps_breakpoints() {
        let mut a = Asm::new();
        a.gtway(3);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        assert!(vm.run().completed);
        assert!(vm.cap_get(3));
        vm.breakpoints.insert(0, 9);
        vm.reset();
        assert!(!vm.cap_get(3));
        assert!(vm.breakpoints.contains_key(&0));
    }

    #[test]
    fn simulate_records_rows_and_result() {
        let mut a = Asm::new();
        a.lit(5);
        a.lit(3);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let sim = vm.simulate();

        assert!(sim.completed);
        assert!(sim.halted);
        assert_eq!(sim.result, Some(8));
        assert_eq!(sim.trace.len(), 4);
        assert_eq!(sim.trace[0].opcode, Opcode::Lit);
        assert_eq!(sim.trace[0].sp, 0);
        assert_eq!(sim.trace[2].opcode, Opcode::Add);
        assert_eq!(sim.trace[2].stack_top, 8);
    }

    #[test]
    fn simulate_truncates_to_the_earliest_rows() {
        let mut a = Asm::new();
        a.jmp_rel(-1);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        vm.set_step_limit(5000);
        let sim = vm.simulate();
        assert_eq!(sim.fault, Some(Fault::StepLimit));
        assert_eq!(sim.trace.len(), TRACE_MAX);
        assert_eq!(sim.trace[0].step, 1);
    }

    #[test]
    fn stack_overflow_traps_at_the_limit() {
        let mut a = Asm::new();
        a.lit(1);
        a.jmp_rel(-2); // push forever
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        vm.set_stack_limit(8);
        let out = vm.run();
        assert_eq!(out.fault, Some(Fault::StackOverflow));
    }

    #[test]
    fn running_off_the_end_is_a_clean_stop() {
        let mut a = Asm::new();
        a.lit(7);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        let out = vm.run();
        assert!(out.completed);
        assert_eq!(out.result, Some(7));
        assert_eq!(vm.state(), VmState::Stopped);
    }

    #[test]
    fn eq_on_mixed_types_pushes_zero() {
        let mut a = Asm::new();
        a.lit(2);
        a.op(Opcode::NewArr);
        a.lit(0);
        a.op(Opcode::Eq);
        a.op(Opcode::Halt);
        let out = run_asm(a);
        assert!(out.completed);
        assert_eq!(out.result, Some(0));
    }

    #[test]
    fn auto_collect_fires_at_the_threshold() {
        let mut a = Asm::new();
        for _ in 0..3 {
            a.lit(1);
            a.op(Opcode::NewArr);
            a.op(Opcode::Drp);
        }
        a.lit(1);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, RecordingHost::default(), Limits::default());
        vm.set_gc_config(GcConfig {
            auto: true,
            threshold: 2,
        });
        assert!(vm.run().completed);
        assert!(
            vm.host().traces.iter().any(|(_, m)| m.starts_with("gc:")),
            "auto collection should report through the trace sink"
        );
    }

    #[test]
    fn step_driving_matches_run() {
        let mut a = Asm::new();
        a.lit(5);
        a.lit(3);
        a.op(Opcode::Add);
        a.op(Opcode::Halt);
        let program = a.build_program().unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());

        vm.start();
        assert_eq!(vm.state(), VmState::Running);
        let mut guard = 0;
        while vm.state() == VmState::Running && guard < 100 {
            vm.step();
            guard += 1;
        }
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.steps(), 4);
        assert_eq!(vm.stack_snapshot(), &[Value::Int(8)]);
    }

    #[test]
    fn structured_loop_marker_faults_at_dispatch() {
        // Hand-built raw program that bypasses lowering.
        let bytes = alloc::vec![
            Opcode::Lit.value() as u8,
            2, // zigzag(1)
            Opcode::Wh.value() as u8,
            Opcode::B.value() as u8,
            Opcode::E.value() as u8,
            Opcode::Halt.value() as u8,
        ];
        let program = Program::load_raw(bytes).unwrap();
        let mut vm = Vm::new(program, NullHost, Limits::default());
        assert_eq!(vm.run().fault, Some(Fault::UnknownOp));
    }
}
