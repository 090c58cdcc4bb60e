// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Token-level control-flow edges for the verifier.
//!
//! Edges follow the interpreter's successor rules, with one widening: the
//! function-body markers execution hops over (the `B` a call enters past,
//! the `E` an `FN` skip lands beyond) are routed *through* so that
//! structural markers stay on the graph. Markers are stack- and
//! capability-neutral, so the analyses are unaffected.
//!
//! Structured loop markers get no back edge on purpose: a loop's condition
//! entry must then hold whatever held before the loop, which is exactly the
//! pessimistic "loops inherit the pre-loop bitmap" rule the capability
//! analysis wants.

use alloc::vec::Vec;

use crate::bytecode::Operands;
use crate::opcode::Opcode;
use crate::program::Program;

/// Edge classification, used by the per-analysis filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EdgeKind {
    /// Ordinary control transfer.
    Flow,
    /// `CL` into the callee body.
    CallBody,
    /// `CL` to its return continuation.
    CallReturn,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub(crate) to: u32,
    pub(crate) kind: EdgeKind,
}

/// The token flow graph plus the function body entries found on the way.
#[derive(Clone, Debug)]
pub(crate) struct FlowGraph {
    pub(crate) succs: Vec<Vec<Edge>>,
    /// `B` token of each `FN` body (height analysis seeds these at zero).
    pub(crate) body_entries: Vec<u32>,
}

/// A graph-construction failure (structural layout or target legality).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CfgError {
    MalformedIf { token: u32 },
    MalformedLoop { token: u32 },
    MalformedFn { token: u32 },
    JumpOutOfRange { token: u32, target: i64 },
    CallTargetInvalid { token: u32 },
}

pub(crate) fn build(program: &Program) -> Result<FlowGraph, CfgError> {
    let count = program.token_count();
    let mut succs: Vec<Vec<Edge>> = (0..count).map(|_| Vec::new()).collect();
    let mut body_entries = Vec::new();

    for i in 0..count {
        let Some(tok) = program.token(i) else {
            continue;
        };
        let mut edges: Vec<Edge> = Vec::new();
        let fall = i + 1;

        match tok.opcode {
            Opcode::Halt | Opcode::Rt => {}
            Opcode::Jmp => {
                edges.push(Edge {
                    to: jump_target(program, i)?,
                    kind: EdgeKind::Flow,
                });
            }
            Opcode::Jz | Opcode::Jnz => {
                if fall < count {
                    edges.push(Edge {
                        to: fall,
                        kind: EdgeKind::Flow,
                    });
                }
                edges.push(Edge {
                    to: jump_target(program, i)?,
                    kind: EdgeKind::Flow,
                });
            }
            Opcode::If => {
                // Truthy falls through into the then-block; E is a no-op,
                // so that path continues through the else-block as well.
                // Falsy resumes inside the else-block, past its opening B.
                let then_b = fall;
                let then_e = program
                    .matching_block_end(then_b)
                    .ok_or(CfgError::MalformedIf { token: i })?;
                let else_b = then_e + 1;
                let _else_e = program
                    .matching_block_end(else_b)
                    .ok_or(CfgError::MalformedIf { token: i })?;
                edges.push(Edge {
                    to: then_b,
                    kind: EdgeKind::Flow,
                });
                edges.push(Edge {
                    to: else_b + 1,
                    kind: EdgeKind::Flow,
                });
            }
            Opcode::Wh | Opcode::Fr => {
                let body_b = fall;
                let body_e = program
                    .matching_block_end(body_b)
                    .ok_or(CfgError::MalformedLoop { token: i })?;
                edges.push(Edge {
                    to: body_b,
                    kind: EdgeKind::Flow,
                });
                if body_e + 1 < count {
                    edges.push(Edge {
                        to: body_e + 1,
                        kind: EdgeKind::Flow,
                    });
                }
            }
            Opcode::Fn => {
                let body_b = fall;
                let body_e = program
                    .matching_block_end(body_b)
                    .ok_or(CfgError::MalformedFn { token: i })?;
                body_entries.push(body_b);
                // Route through the closing E so the skip continuation and
                // the markers stay on the graph.
                edges.push(Edge {
                    to: body_e,
                    kind: EdgeKind::Flow,
                });
            }
            Opcode::Cl => {
                let Operands::Call { target, .. } = tok.operands else {
                    return Err(CfgError::CallTargetInvalid { token: i });
                };
                let callee = program
                    .token_at_byte(target)
                    .ok_or(CfgError::CallTargetInvalid { token: i })?;
                if program.token(callee).map(|t| t.opcode) != Some(Opcode::Fn) {
                    return Err(CfgError::CallTargetInvalid { token: i });
                }
                if program.token(callee + 1).map(|t| t.opcode) != Some(Opcode::B) {
                    return Err(CfgError::MalformedFn { token: callee });
                }
                edges.push(Edge {
                    to: callee + 1,
                    kind: EdgeKind::CallBody,
                });
                if fall < count {
                    edges.push(Edge {
                        to: fall,
                        kind: EdgeKind::CallReturn,
                    });
                }
            }
            _ => {
                if fall < count {
                    edges.push(Edge {
                        to: fall,
                        kind: EdgeKind::Flow,
                    });
                }
            }
        }

        succs[i as usize] = edges;
    }

    Ok(FlowGraph {
        succs,
        body_entries,
    })
}

fn jump_target(program: &Program, token: u32) -> Result<u32, CfgError> {
    let Some(Operands::Jump(off)) = program.token(token).map(|t| t.operands) else {
        return Err(CfgError::JumpOutOfRange {
            token,
            target: i64::MIN,
        });
    };
    let target = i64::from(token) + 1 + i64::from(off);
    if target < 0 || target >= i64::from(program.token_count()) {
        return Err(CfgError::JumpOutOfRange { token, target });
    }
    Ok(target as u32)
}

/// Depth-first reachability from token 0 over every edge kind.
#[must_use]
pub(crate) fn compute_reachable(graph: &FlowGraph) -> Vec<bool> {
    let mut reachable = alloc::vec![false; graph.succs.len()];
    if graph.succs.is_empty() {
        return reachable;
    }
    let mut stack = alloc::vec![0_usize];
    reachable[0] = true;
    while let Some(i) = stack.pop() {
        for edge in &graph.succs[i] {
            let to = edge.to as usize;
            if !reachable[to] {
                reachable[to] = true;
                stack.push(to);
            }
        }
    }
    reachable
}
