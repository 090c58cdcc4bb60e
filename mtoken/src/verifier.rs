// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Static verification of loaded M-Token programs.
//!
//! Verification rejects malformed or unsafe-to-execute programs before they
//! reach the interpreter: block structure, index bounds, per-path stack
//! effect, jump-target legality, reachability, and static capability
//! dominance for every I/O site. A verified program can still trap at run
//! time (division by zero, resource budgets), but it cannot under- or
//! overflow the operand stack through structure alone, and no reachable
//! I/O site executes without its capability bit granted on every path.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::analysis::bitset::BitSet;
use crate::analysis::cfg::{self, CfgError, EdgeKind, FlowGraph};
use crate::bytecode::Operands;
use crate::opcode::Opcode;
use crate::program::Program;
use crate::vm::{GLOBALS_SIZE, LOCALS_SIZE};

/// Width of the capability bitmap (device ids 0..=255).
const CAP_BITS: usize = 256;

/// Verifier configuration.
#[derive(Clone, Debug, Default)]
pub struct VerifyConfig {
    /// Reject extension opcodes (100–199), used when accepting programs
    /// over the public ABI boundary. The heap pair 200/201 stays legal.
    pub core_only: bool,
}

/// A verification error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// An extension opcode under the `core_only` policy.
    ExtensionOpcode {
        /// Token index.
        token: u32,
        /// The offending opcode value.
        opcode: u32,
    },
    /// An `E` with no open block.
    UnexpectedBlockEnd {
        /// Token index.
        token: u32,
    },
    /// A `B` that is never closed.
    UnmatchedBlock {
        /// Token index.
        token: u32,
    },
    /// A `V`/`LET` local index at or above the locals size.
    LocalIndexOutOfBounds {
        /// Token index.
        token: u32,
        /// The index operand.
        index: u32,
    },
    /// A `SET` global index at or above the globals size.
    GlobalIndexOutOfBounds {
        /// Token index.
        token: u32,
        /// The index operand.
        index: u32,
    },
    /// A `GTWAY` capability id above 255.
    CapabilityOutOfRange {
        /// Token index.
        token: u32,
        /// The capability operand.
        cap: u32,
    },
    /// An `IF` without its two back-to-back blocks.
    MalformedIf {
        /// Token index.
        token: u32,
    },
    /// A `WH`/`FR` without its body block.
    MalformedLoop {
        /// Token index.
        token: u32,
    },
    /// An `FN` without its body block.
    MalformedFn {
        /// Token index.
        token: u32,
    },
    /// A jump whose target token index is outside the program.
    JumpOutOfRange {
        /// Token index of the jump.
        token: u32,
        /// The absolute target index.
        target: i64,
    },
    /// A `CL` whose byte-offset target is not an `FN` token boundary.
    CallTargetInvalid {
        /// Token index of the call.
        token: u32,
    },
    /// A path that would pop from an empty stack.
    StackUnderflow {
        /// Token index.
        token: u32,
    },
    /// Two paths reach a merge point with different stack heights.
    BranchStackMismatch {
        /// Token index of the merge point.
        token: u32,
        /// Previously recorded height.
        left: i64,
        /// Newly propagated height.
        right: i64,
    },
    /// A structured loop body with a non-zero net stack effect.
    LoopNotStackNeutral {
        /// Token index of the loop marker.
        token: u32,
        /// The body's net effect.
        net: i64,
    },
    /// An `IOW`/`IOR` not dominated by a matching `GTWAY` on every path.
    UnauthorizedIo {
        /// Token index of the I/O site.
        token: u32,
        /// Device id.
        device: u32,
    },
    /// A token unreachable from token 0.
    Unreachable {
        /// Token index.
        token: u32,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtensionOpcode { token, opcode } => {
                write!(f, "extension opcode {opcode} at token {token}")
            }
            Self::UnexpectedBlockEnd { token } => write!(f, "unmatched E at token {token}"),
            Self::UnmatchedBlock { token } => write!(f, "unclosed B at token {token}"),
            Self::LocalIndexOutOfBounds { token, index } => {
                write!(f, "local index {index} out of bounds at token {token}")
            }
            Self::GlobalIndexOutOfBounds { token, index } => {
                write!(f, "global index {index} out of bounds at token {token}")
            }
            Self::CapabilityOutOfRange { token, cap } => {
                write!(f, "capability id {cap} out of range at token {token}")
            }
            Self::MalformedIf { token } => write!(f, "malformed IF at token {token}"),
            Self::MalformedLoop { token } => write!(f, "malformed loop at token {token}"),
            Self::MalformedFn { token } => write!(f, "malformed FN at token {token}"),
            Self::JumpOutOfRange { token, target } => {
                write!(f, "jump at token {token} targets {target} out of range")
            }
            Self::CallTargetInvalid { token } => {
                write!(f, "call at token {token} targets no FN boundary")
            }
            Self::StackUnderflow { token } => write!(f, "stack underflow at token {token}"),
            Self::BranchStackMismatch { token, left, right } => {
                write!(f, "branch stack mismatch at token {token} ({left} vs {right})")
            }
            Self::LoopNotStackNeutral { token, net } => {
                write!(f, "loop body at token {token} has net stack effect {net}")
            }
            Self::UnauthorizedIo { token, device } => {
                write!(f, "device {device} not authorized at token {token}")
            }
            Self::Unreachable { token } => write!(f, "unreachable token {token}"),
        }
    }
}

impl core::error::Error for VerifyError {}

impl From<CfgError> for VerifyError {
    fn from(e: CfgError) -> Self {
        match e {
            CfgError::MalformedIf { token } => Self::MalformedIf { token },
            CfgError::MalformedLoop { token } => Self::MalformedLoop { token },
            CfgError::MalformedFn { token } => Self::MalformedFn { token },
            CfgError::JumpOutOfRange { token, target } => Self::JumpOutOfRange { token, target },
            CfgError::CallTargetInvalid { token } => Self::CallTargetInvalid { token },
        }
    }
}

/// Verifies `program` under `config`.
pub fn verify_program(program: &Program, config: &VerifyConfig) -> Result<(), VerifyError> {
    if config.core_only {
        for (i, t) in program.tokens().iter().enumerate() {
            if !t.opcode.is_core() {
                return Err(VerifyError::ExtensionOpcode {
                    token: i as u32,
                    opcode: t.opcode.value(),
                });
            }
        }
    }

    check_blocks(program)?;
    check_index_bounds(program)?;

    let graph = cfg::build(program)?;

    check_loop_bodies(program)?;
    check_stack_heights(program, &graph)?;
    check_capabilities(program, &graph)?;
    check_reachability(&graph)?;

    Ok(())
}

fn check_blocks(program: &Program) -> Result<(), VerifyError> {
    let mut open: Vec<u32> = Vec::new();
    for (i, t) in program.tokens().iter().enumerate() {
        match t.opcode {
            Opcode::B => open.push(i as u32),
            Opcode::E => {
                if open.pop().is_none() {
                    return Err(VerifyError::UnexpectedBlockEnd { token: i as u32 });
                }
            }
            _ => {}
        }
    }
    match open.first() {
        Some(&token) => Err(VerifyError::UnmatchedBlock { token }),
        None => Ok(()),
    }
}

fn check_index_bounds(program: &Program) -> Result<(), VerifyError> {
    for (i, t) in program.tokens().iter().enumerate() {
        let token = i as u32;
        let Operands::Index(index) = t.operands else {
            continue;
        };
        match t.opcode {
            Opcode::V | Opcode::Let if index as usize >= LOCALS_SIZE => {
                return Err(VerifyError::LocalIndexOutOfBounds { token, index });
            }
            Opcode::Set if index as usize >= GLOBALS_SIZE => {
                return Err(VerifyError::GlobalIndexOutOfBounds { token, index });
            }
            Opcode::Gtway if index as usize >= CAP_BITS => {
                return Err(VerifyError::CapabilityOutOfRange { token, cap: index });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Pop/push counts for one token; `CL` resolves through its argc operand.
fn token_effect(program: &Program, index: u32) -> (u32, u32) {
    match program.token(index) {
        Some(t) => match t.operands {
            Operands::Call { argc, .. } => (argc, 1),
            _ => t.opcode.stack_effect().unwrap_or((0, 0)),
        },
        None => (0, 0),
    }
}

fn check_stack_heights(program: &Program, graph: &FlowGraph) -> Result<(), VerifyError> {
    let count = program.token_count() as usize;
    let mut heights: Vec<Option<i64>> = vec![None; count];
    let mut worklist: Vec<u32> = Vec::new();

    let mut seed = |token: u32, h: i64, heights: &mut Vec<Option<i64>>, wl: &mut Vec<u32>| {
        if heights[token as usize].is_none() {
            heights[token as usize] = Some(h);
            wl.push(token);
        }
    };

    if count > 0 {
        seed(0, 0, &mut heights, &mut worklist);
    }
    // Function bodies are validated relative to their own frame: the data
    // stack they see starts at the caller's residue, which the body cannot
    // legally dig below. Zero is the conservative baseline.
    for &b in &graph.body_entries {
        seed(b, 0, &mut heights, &mut worklist);
    }

    while let Some(i) = worklist.pop() {
        let Some(entry) = heights[i as usize] else {
            continue;
        };
        let (pops, pushes) = token_effect(program, i);
        if entry < i64::from(pops) {
            return Err(VerifyError::StackUnderflow { token: i });
        }
        let exit = entry - i64::from(pops) + i64::from(pushes);

        for edge in &graph.succs[i as usize] {
            let out = match edge.kind {
                EdgeKind::Flow | EdgeKind::CallReturn => exit,
                // Bodies are seeded; the call edge carries no height.
                EdgeKind::CallBody => continue,
            };
            match heights[edge.to as usize] {
                None => {
                    heights[edge.to as usize] = Some(out);
                    worklist.push(edge.to);
                }
                Some(existing) if existing != out => {
                    return Err(VerifyError::BranchStackMismatch {
                        token: edge.to,
                        left: existing,
                        right: out,
                    });
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

/// Structured loop bodies must be height-neutral (lowered loops get the
/// same guarantee from the merge check at the back-edge target).
fn check_loop_bodies(program: &Program) -> Result<(), VerifyError> {
    for (i, t) in program.tokens().iter().enumerate() {
        if !t.opcode.is_structured_loop() {
            continue;
        }
        let token = i as u32;
        let body_e = program
            .matching_block_end(token + 1)
            .ok_or(VerifyError::MalformedLoop { token })?;
        let mut net = 0_i64;
        for j in token + 2..body_e {
            let (pops, pushes) = token_effect(program, j);
            net += i64::from(pushes) - i64::from(pops);
        }
        if net != 0 {
            return Err(VerifyError::LoopNotStackNeutral { token, net });
        }
    }
    Ok(())
}

fn check_capabilities(program: &Program, graph: &FlowGraph) -> Result<(), VerifyError> {
    let count = program.token_count() as usize;
    let mut caps: Vec<Option<BitSet>> = vec![None; count];
    let mut worklist: Vec<u32> = Vec::new();

    if count > 0 {
        caps[0] = Some(BitSet::new_empty(CAP_BITS));
        worklist.push(0);
    }

    while let Some(i) = worklist.pop() {
        let Some(mut exit) = caps[i as usize].clone() else {
            continue;
        };
        if let Some(t) = program.token(i)
            && t.opcode == Opcode::Gtway
            && let Operands::Index(cap) = t.operands
        {
            exit.set(cap as usize);
        }

        for edge in &graph.succs[i as usize] {
            let slot = &mut caps[edge.to as usize];
            match slot {
                None => {
                    *slot = Some(exit.clone());
                    worklist.push(edge.to);
                }
                Some(existing) => {
                    let before = existing.clone();
                    existing.intersect_with(&exit);
                    if *existing != before {
                        worklist.push(edge.to);
                    }
                }
            }
        }
    }

    for (i, t) in program.tokens().iter().enumerate() {
        if !matches!(t.opcode, Opcode::Iow | Opcode::Ior) {
            continue;
        }
        let Operands::Index(device) = t.operands else {
            continue;
        };
        let Some(entry) = &caps[i] else {
            // Unreachable I/O sites are reported by the reachability check.
            continue;
        };
        if !entry.get(device as usize) {
            return Err(VerifyError::UnauthorizedIo {
                token: i as u32,
                device,
            });
        }
    }

    Ok(())
}

fn check_reachability(graph: &FlowGraph) -> Result<(), VerifyError> {
    let reachable = cfg::compute_reachable(graph);
    match reachable.iter().position(|&r| !r) {
        Some(token) => Err(VerifyError::Unreachable {
            token: token as u32,
        }),
        None => Ok(()),
    }
}
