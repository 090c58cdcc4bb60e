// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Load-time lowering of structured `WH`/`FR` loops into flat jumps.
//!
//! For each loop marker the pass finds the condition's producer range by a
//! linear stack-effect simulation, then re-emits the region as
//! `cond, JZ exit, body, [incr,] JMP cond`. Jump operands are measured in
//! token indices relative to the next token, so the rewrite re-resolves
//! every surviving jump through an old-index-to-new-index map. Call targets
//! are byte offsets and are re-resolved against the final encoding.
//!
//! The pass runs once per loop marker, outermost-first; nested loops are
//! picked up on subsequent passes over the rewritten stream.

use alloc::vec::Vec;
use core::fmt;

use crate::bytecode::{
    DecodedToken, EncodeError, Operands, TemplateOperands, TokenTemplate, encode_tokens,
};
use crate::opcode::Opcode;

/// A lowering failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LowerError {
    /// A `WH`/`FR` is not followed by a `B … E` body.
    MalformedLoop {
        /// Token index of the loop marker.
        token: u32,
    },
    /// The loop condition could not be attributed to a producer range.
    ConditionUnattributed {
        /// Token index of the loop marker.
        token: u32,
    },
    /// An `FR` increment range does not have net stack effect zero.
    IncrementNotNeutral {
        /// Token index of the loop marker.
        token: u32,
    },
    /// A surviving jump pointed at a token deleted by the rewrite.
    JumpTargetRemoved {
        /// Token index of the jump (pre-rewrite).
        token: u32,
    },
    /// A surviving jump pointed outside the token stream.
    JumpTargetOutOfRange {
        /// Token index of the jump (pre-rewrite).
        token: u32,
    },
    /// A call target is not a surviving token boundary.
    CallTargetInvalid {
        /// Token index of the call (post-rewrite).
        token: u32,
    },
    /// The rewrite did not converge within the pass budget.
    TooManyPasses,
    /// Re-encoding the rewritten stream failed.
    Encode(EncodeError),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLoop { token } => write!(f, "malformed loop body at token {token}"),
            Self::ConditionUnattributed { token } => {
                write!(f, "loop condition unattributed at token {token}")
            }
            Self::IncrementNotNeutral { token } => {
                write!(f, "loop increment not stack-neutral at token {token}")
            }
            Self::JumpTargetRemoved { token } => {
                write!(f, "jump at token {token} targets a deleted token")
            }
            Self::JumpTargetOutOfRange { token } => {
                write!(f, "jump at token {token} targets outside the stream")
            }
            Self::CallTargetInvalid { token } => {
                write!(f, "call at token {token} has an unresolvable target")
            }
            Self::TooManyPasses => write!(f, "loop rewrite did not converge"),
            Self::Encode(e) => write!(f, "re-encode failed: {e}"),
        }
    }
}

impl core::error::Error for LowerError {}

impl From<EncodeError> for LowerError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

/// Working operand form: jumps live in the current token domain, call
/// targets stay expressed against the original byte stream until the end.
#[derive(Copy, Clone, Debug)]
enum WorkOp {
    None,
    Literal(i64),
    Index(u32),
    Arity(u32),
    Jump(i32),
    Call { orig_target: u32, argc: u32 },
}

#[derive(Copy, Clone, Debug)]
struct WorkTok {
    opcode: Opcode,
    op: WorkOp,
}

/// One simulated stack slot: where the value's expression started and which
/// token pushed it. `None` marks a slot the linear scan could not attribute.
#[derive(Copy, Clone, Debug)]
struct Slot {
    start: Option<usize>,
    producer: usize,
}

/// Lowers every `WH`/`FR` in `tokens` and returns the rewritten byte stream.
pub fn lower(tokens: &[DecodedToken]) -> Result<Vec<u8>, LowerError> {
    let orig_offsets: Vec<u32> = tokens.iter().map(|t| t.offset).collect();

    let mut cur: Vec<WorkTok> = tokens
        .iter()
        .map(|t| WorkTok {
            opcode: t.opcode,
            op: match t.operands {
                Operands::None => WorkOp::None,
                Operands::Literal(v) => WorkOp::Literal(v),
                Operands::Index(v) => WorkOp::Index(v),
                Operands::Arity(v) => WorkOp::Arity(v),
                Operands::Jump(v) => WorkOp::Jump(v),
                Operands::Call { target, argc } => WorkOp::Call {
                    orig_target: target,
                    argc,
                },
            },
        })
        .collect();

    // orig index -> current index, composed across passes.
    let mut orig_to_cur: Vec<Option<usize>> = (0..cur.len()).map(Some).collect();

    let pass_budget = cur.len() + 1;
    for _ in 0..pass_budget {
        let Some(w) = cur.iter().position(|t| t.opcode.is_structured_loop()) else {
            return finish(cur, &orig_offsets, &orig_to_cur);
        };

        let map = rewrite_one(&mut cur, w)?;
        for slot in &mut orig_to_cur {
            *slot = slot.and_then(|i| map[i]);
        }
    }

    Err(LowerError::TooManyPasses)
}

/// Rewrites the first loop marker at `w`, returning the old-to-new map.
fn rewrite_one(cur: &mut Vec<WorkTok>, w: usize) -> Result<Vec<Option<usize>>, LowerError> {
    let marker = cur[w].opcode;
    let token = w as u32;

    let cond_slot = simulate_top_slot(&cur[..w]).ok_or(LowerError::ConditionUnattributed {
        token,
    })?;
    let cond_start = cond_slot
        .start
        .ok_or(LowerError::ConditionUnattributed { token })?;

    // Condition and (for FR) increment ranges preceding the marker.
    let (cond_end, incr) = if marker == Opcode::Fr {
        let incr = cond_slot.producer + 1..w;
        if net_effect(&cur[incr.clone()]) != Some(0) {
            return Err(LowerError::IncrementNotNeutral { token });
        }
        (cond_slot.producer, incr)
    } else {
        (w - 1, w..w)
    };

    // The body block immediately follows the marker.
    if cur.get(w + 1).map(|t| t.opcode) != Some(Opcode::B) {
        return Err(LowerError::MalformedLoop { token });
    }
    let e = matching_end(cur, w + 1).ok_or(LowerError::MalformedLoop { token })?;
    let body = w + 2..e;

    // New layout: [prefix][cond][JZ][body][incr][JMP][suffix].
    let mut map: Vec<Option<usize>> = alloc::vec![None; cur.len()];
    let mut out: Vec<WorkTok> = Vec::with_capacity(cur.len() + 2);

    for i in 0..=cond_end {
        map[i] = Some(out.len());
        out.push(cur[i]);
    }
    let jz_index = out.len();
    out.push(WorkTok {
        opcode: Opcode::Jz,
        op: WorkOp::Jump(0),
    });
    for i in body.clone() {
        map[i] = Some(out.len());
        out.push(cur[i]);
    }
    for i in incr.clone() {
        map[i] = Some(out.len());
        out.push(cur[i]);
    }
    let jmp_index = out.len();
    out.push(WorkTok {
        opcode: Opcode::Jmp,
        op: WorkOp::Jump(0),
    });
    for i in e + 1..cur.len() {
        map[i] = Some(out.len());
        out.push(cur[i]);
    }

    let exit_target = jmp_index + 1;
    out[jz_index].op = WorkOp::Jump(rel_offset(jz_index, exit_target));
    out[jmp_index].op = WorkOp::Jump(rel_offset(jmp_index, cond_start));

    // Re-resolve surviving jumps through the map.
    for (old, &new) in map.iter().enumerate() {
        let Some(new) = new else { continue };
        let WorkOp::Jump(off) = cur[old].op else {
            continue;
        };
        let old_abs = old as i64 + 1 + i64::from(off);
        if old_abs < 0 || old_abs as usize >= cur.len() {
            return Err(LowerError::JumpTargetOutOfRange { token: old as u32 });
        }
        let new_abs = map[old_abs as usize].ok_or(LowerError::JumpTargetRemoved {
            token: old as u32,
        })?;
        out[new].op = WorkOp::Jump(rel_offset(new, new_abs));
    }

    *cur = out;
    Ok(map)
}

fn rel_offset(from: usize, to: usize) -> i32 {
    (to as i64 - (from as i64 + 1)) as i32
}

/// Linear stack-effect simulation over `tokens`, returning the slot that
/// would be on top afterwards.
fn simulate_top_slot(tokens: &[WorkTok]) -> Option<Slot> {
    let mut stack: Vec<Slot> = Vec::new();

    for (i, t) in tokens.iter().enumerate() {
        let (pops, pushes) = match t.op {
            WorkOp::Call { argc, .. } => (argc, 1),
            _ => t.opcode.stack_effect()?,
        };

        let mut base = Some(i);
        let mut attributed = true;
        for _ in 0..pops {
            match stack.pop() {
                Some(s) => match s.start {
                    Some(start) => base = Some(base.map_or(start, |b| b.min(start))),
                    None => attributed = false,
                },
                None => attributed = false,
            }
        }
        for _ in 0..pushes {
            stack.push(Slot {
                start: if attributed { base } else { None },
                producer: i,
            });
        }
    }

    stack.pop()
}

/// Net stack effect of a linear token range, or `None` when unknowable.
fn net_effect(tokens: &[WorkTok]) -> Option<i64> {
    let mut net = 0_i64;
    for t in tokens {
        let (pops, pushes) = match t.op {
            WorkOp::Call { argc, .. } => (argc, 1),
            _ => t.opcode.stack_effect()?,
        };
        net += i64::from(pushes) - i64::from(pops);
    }
    Some(net)
}

fn matching_end(tokens: &[WorkTok], b_index: usize) -> Option<usize> {
    let mut depth = 0_u32;
    for (i, t) in tokens.iter().enumerate().skip(b_index) {
        match t.opcode {
            Opcode::B => depth += 1,
            Opcode::E => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Converts the final working stream into templates and encodes it.
fn finish(
    cur: Vec<WorkTok>,
    orig_offsets: &[u32],
    orig_to_cur: &[Option<usize>],
) -> Result<Vec<u8>, LowerError> {
    let mut templates = Vec::with_capacity(cur.len());
    for (i, t) in cur.iter().enumerate() {
        let operands = match t.op {
            WorkOp::None => TemplateOperands::None,
            WorkOp::Literal(v) => TemplateOperands::Literal(v),
            WorkOp::Index(v) => TemplateOperands::Index(v),
            WorkOp::Arity(v) => TemplateOperands::Arity(v),
            WorkOp::Jump(v) => TemplateOperands::Jump(v),
            WorkOp::Call { orig_target, argc } => {
                let orig_index = orig_offsets
                    .iter()
                    .position(|&o| o == orig_target)
                    .ok_or(LowerError::CallTargetInvalid { token: i as u32 })?;
                let target = orig_to_cur[orig_index]
                    .ok_or(LowerError::CallTargetInvalid { token: i as u32 })?;
                TemplateOperands::Call {
                    target_token: target as u32,
                    argc,
                }
            }
        };
        templates.push(TokenTemplate {
            opcode: t.opcode,
            operands,
        });
    }

    Ok(encode_tokens(&templates)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode_tokens;
    use crate::format::Writer;

    fn emit(tokens: &[(Opcode, Option<i64>)]) -> Vec<u8> {
        let mut w = Writer::new();
        for &(op, operand) in tokens {
            w.write_uleb128_u32(op.value());
            if let Some(v) = operand {
                match op {
                    Opcode::Lit | Opcode::Jz | Opcode::Jnz | Opcode::Jmp => w.write_zigzag_i64(v),
                    _ => w.write_uleb128_u32(v as u32),
                }
            }
        }
        w.into_vec()
    }

    fn lower_bytes(bytes: &[u8]) -> Vec<DecodedToken> {
        let tokens = decode_tokens(bytes).unwrap();
        let lowered = lower(&tokens).unwrap();
        decode_tokens(&lowered).unwrap()
    }

    #[test]
    fn while_loop_becomes_jz_body_jmp() {
        use Opcode::*;
        // sum=0; i=5; while (i > 0) { sum+=i; i-=1 } ; push sum; halt
        let bytes = emit(&[
            (Lit, Some(0)),
            (Let, Some(0)),
            (Lit, Some(5)),
            (Let, Some(1)),
            (V, Some(1)),
            (Lit, Some(0)),
            (Gt, None),
            (Wh, None),
            (B, None),
            (V, Some(0)),
            (V, Some(1)),
            (Add, None),
            (Let, Some(0)),
            (V, Some(1)),
            (Lit, Some(1)),
            (Sub, None),
            (Let, Some(1)),
            (E, None),
            (V, Some(0)),
            (Halt, None),
        ]);

        let out = lower_bytes(&bytes);
        let ops: Vec<Opcode> = out.iter().map(|t| t.opcode).collect();
        assert!(!ops.contains(&Wh));
        assert!(!ops.contains(&B));
        assert!(!ops.contains(&E));

        // Condition starts at token 4 (V 1); JZ follows the condition.
        assert_eq!(out[7].opcode, Jz);
        let jz_off = match out[7].operands {
            Operands::Jump(o) => o,
            other => panic!("expected jump operand, got {other:?}"),
        };
        // JZ exits to the token just past the back-edge JMP.
        assert_eq!(7 + 1 + jz_off, 17);
        assert_eq!(out[16].opcode, Jmp);
        let jmp_off = match out[16].operands {
            Operands::Jump(o) => o,
            other => panic!("expected jump operand, got {other:?}"),
        };
        // Back edge lands on the first condition token.
        assert_eq!(16 + 1 + jmp_off, 4);
    }

    #[test]
    fn for_loop_moves_increment_after_body() {
        use Opcode::*;
        // i=0; for (; i<3; i+=1) { } with an empty body: increment must end
        // up between body position and the back edge.
        let bytes = emit(&[
            (Lit, Some(0)),
            (Let, Some(0)),
            (V, Some(0)),  // cond start
            (Lit, Some(3)),
            (Lt, None),    // cond producer
            (V, Some(0)),  // incr start
            (Lit, Some(1)),
            (Add, None),
            (Let, Some(0)), // incr end
            (Fr, None),
            (B, None),
            (Ph, None), // body
            (E, None),
            (Lit, Some(7)),
            (Halt, None),
        ]);

        let out = lower_bytes(&bytes);
        let ops: Vec<Opcode> = out.iter().map(|t| t.opcode).collect();
        assert_eq!(
            ops,
            alloc::vec![Lit, Let, V, Lit, Lt, Jz, Ph, V, Lit, Add, Let, Jmp, Lit, Halt]
        );
        // Back edge to condition start (token 2), exit to token 12.
        match out[11].operands {
            Operands::Jump(o) => assert_eq!(11 + 1 + o, 2),
            other => panic!("expected jump operand, got {other:?}"),
        }
        match out[5].operands {
            Operands::Jump(o) => assert_eq!(5 + 1 + o, 12),
            other => panic!("expected jump operand, got {other:?}"),
        }
    }

    #[test]
    fn nested_while_loops_lower_inside_out() {
        use Opcode::*;
        // while (i) { j=2; while (j) { j-=1 } i-=1 }  (i seeded beforehand)
        let bytes = emit(&[
            (Lit, Some(2)),
            (Let, Some(0)),
            (V, Some(0)),
            (Wh, None),
            (B, None),
            (Lit, Some(2)),
            (Let, Some(1)),
            (V, Some(1)),
            (Wh, None),
            (B, None),
            (V, Some(1)),
            (Lit, Some(1)),
            (Sub, None),
            (Let, Some(1)),
            (E, None),
            (V, Some(0)),
            (Lit, Some(1)),
            (Sub, None),
            (Let, Some(0)),
            (E, None),
            (Lit, Some(0)),
            (Halt, None),
        ]);

        let out = lower_bytes(&bytes);
        let ops: Vec<Opcode> = out.iter().map(|t| t.opcode).collect();
        assert!(!ops.contains(&Wh));
        assert!(!ops.contains(&B));
        assert_eq!(ops.iter().filter(|&&o| o == Jz).count(), 2);
        assert_eq!(ops.iter().filter(|&&o| o == Jmp).count(), 2);
    }

    #[test]
    fn loop_without_body_block_is_rejected() {
        use Opcode::*;
        let bytes = emit(&[(Lit, Some(1)), (Wh, None), (Halt, None)]);
        let tokens = decode_tokens(&bytes).unwrap();
        assert_eq!(
            lower(&tokens),
            Err(LowerError::MalformedLoop { token: 1 })
        );
    }

    #[test]
    fn loop_without_condition_is_rejected() {
        use Opcode::*;
        let bytes = emit(&[(Wh, None), (B, None), (E, None), (Halt, None)]);
        let tokens = decode_tokens(&bytes).unwrap();
        assert_eq!(
            lower(&tokens),
            Err(LowerError::ConditionUnattributed { token: 0 })
        );
    }

    #[test]
    fn call_targets_survive_the_rewrite() {
        use Opcode::*;
        // A function before the loop keeps its CL target after token motion.
        let mut w = Writer::new();
        // FN 0, B, LIT 9, RT, E      (function at byte 0)
        for (op, operand) in [
            (Fn, Some(0_i64)),
            (B, None),
            (Lit, Some(9)),
            (Rt, None),
            (E, None),
        ] {
            w.write_uleb128_u32(op.value());
            match (op, operand) {
                (Fn, Some(v)) => w.write_uleb128_u32(v as u32),
                (Lit, Some(v)) => w.write_zigzag_i64(v),
                _ => {}
            }
        }
        // i=1; while (i) { i-=1 }; CL fn; HALT
        let loop_part = emit(&[
            (Lit, Some(1)),
            (Let, Some(0)),
            (V, Some(0)),
            (Wh, None),
            (B, None),
            (V, Some(0)),
            (Lit, Some(1)),
            (Sub, None),
            (Let, Some(0)),
            (E, None),
        ]);
        let mut bytes = w.into_vec();
        bytes.extend_from_slice(&loop_part);
        bytes.push(Cl.value() as u8);
        bytes.push(0); // target byte offset 0 (the FN)
        bytes.push(0); // argc
        bytes.push(Halt.value() as u8);

        let out = lower_bytes(&bytes);
        let cl = out
            .iter()
            .find(|t| t.opcode == Cl)
            .expect("call should survive");
        let fn_tok = out.iter().find(|t| t.opcode == Fn).unwrap();
        assert_eq!(
            cl.operands,
            Operands::Call {
                target: fn_tok.offset,
                argc: 0
            }
        );
    }
}
