// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Token-level decoding and encoding of M-Token byte streams.
//!
//! A token is one opcode plus its operands, the atomic unit the loader,
//! verifier and interpreter all agree on. Jump operands are measured in
//! token indices relative to the next token; call targets are byte offsets
//! into the stream.

use alloc::vec::Vec;
use core::fmt;

use crate::format::{DecodeError, Reader, Writer, uleb128_len, zigzag_encode_i64};
use crate::opcode::{Opcode, OperandKind};

/// Decoded operand payload of one token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operands {
    /// No operand.
    None,
    /// Signed literal (`LIT`).
    Literal(i64),
    /// Unsigned index/id operand.
    Index(u32),
    /// Function arity (`FN`).
    Arity(u32),
    /// Token-relative jump offset.
    Jump(i32),
    /// Call target byte offset plus argument count (`CL`).
    Call {
        /// Function-entry byte offset of the callee's `FN` token.
        target: u32,
        /// Number of stack arguments.
        argc: u32,
    },
}

/// One decoded opcode token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedToken {
    /// Byte offset of the opcode varint.
    pub offset: u32,
    /// The opcode.
    pub opcode: Opcode,
    /// Decoded operands.
    pub operands: Operands,
}

/// A tokenization error with the byte offset it occurred at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// A varint failed to decode.
    BadEncoding {
        /// Byte offset of the failing varint.
        offset: u32,
    },
    /// An opcode value has no assigned meaning.
    UnknownOp {
        /// Byte offset of the opcode.
        offset: u32,
        /// The raw opcode value.
        opcode: u32,
    },
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEncoding { offset } => write!(f, "bad encoding at byte {offset}"),
            Self::UnknownOp { offset, opcode } => {
                write!(f, "unknown opcode {opcode} at byte {offset}")
            }
        }
    }
}

impl core::error::Error for TokenError {}

/// Walks `bytes` front to back, decoding every token.
pub fn decode_tokens(bytes: &[u8]) -> Result<Vec<DecodedToken>, TokenError> {
    let mut tokens = Vec::new();
    let mut r = Reader::new(bytes);

    while !r.is_at_end() {
        let offset = u32::try_from(r.offset()).map_err(|_| TokenError::BadEncoding {
            offset: u32::MAX,
        })?;
        let raw = r.read_uleb128_u32().map_err(|_| TokenError::BadEncoding { offset })?;
        let opcode = Opcode::from_u32(raw).ok_or(TokenError::UnknownOp {
            offset,
            opcode: raw,
        })?;
        let operands = read_operands(&mut r, opcode).map_err(|_| TokenError::BadEncoding {
            offset,
        })?;
        tokens.push(DecodedToken {
            offset,
            opcode,
            operands,
        });
    }

    Ok(tokens)
}

fn read_operands(r: &mut Reader<'_>, opcode: Opcode) -> Result<Operands, DecodeError> {
    Ok(match opcode.operand_kind() {
        OperandKind::None => Operands::None,
        OperandKind::Literal => Operands::Literal(r.read_zigzag_i64()?),
        OperandKind::Index => Operands::Index(r.read_uleb128_u32()?),
        OperandKind::Arity => Operands::Arity(r.read_uleb128_u32()?),
        OperandKind::Jump => {
            let off = r.read_zigzag_i64()?;
            let off = i32::try_from(off).map_err(|_| DecodeError::InvalidVarint)?;
            Operands::Jump(off)
        }
        OperandKind::Call => {
            let target = r.read_uleb128_u32()?;
            let argc = r.read_uleb128_u32()?;
            Operands::Call { target, argc }
        }
    })
}

/// A token awaiting encoding.
///
/// Call targets are expressed as token indices here; [`encode_tokens`]
/// resolves them to byte offsets, iterating because the offset's own varint
/// width feeds back into the layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TokenTemplate {
    /// The opcode.
    pub opcode: Opcode,
    /// Operand payload with symbolic call targets.
    pub operands: TemplateOperands,
}

/// Operand payload of a [`TokenTemplate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TemplateOperands {
    /// No operand.
    None,
    /// Signed literal.
    Literal(i64),
    /// Unsigned index/id.
    Index(u32),
    /// Function arity.
    Arity(u32),
    /// Token-relative jump offset.
    Jump(i32),
    /// Call target as a token index plus argc.
    Call {
        /// Token index of the callee's `FN` token.
        target_token: u32,
        /// Number of stack arguments.
        argc: u32,
    },
}

/// An encoding error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// A call target token index was out of range.
    BadCallTarget {
        /// The offending token index.
        token: u32,
    },
    /// Byte-offset relaxation failed to converge.
    RelaxationDiverged,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadCallTarget { token } => write!(f, "call target token {token} out of range"),
            Self::RelaxationDiverged => write!(f, "call offset relaxation diverged"),
        }
    }
}

impl core::error::Error for EncodeError {}

/// Encodes a template stream into bytes, resolving call-target token indices
/// to byte offsets.
///
/// Offsets are computed by fixpoint: call operands start at width 1 and grow
/// until the layout is stable. Growth is monotone, so the loop terminates
/// within the varint width bound.
pub fn encode_tokens(tokens: &[TokenTemplate]) -> Result<Vec<u8>, EncodeError> {
    for t in tokens {
        if let TemplateOperands::Call { target_token, .. } = t.operands
            && target_token as usize >= tokens.len()
        {
            return Err(EncodeError::BadCallTarget {
                token: target_token,
            });
        }
    }

    let mut offsets: Vec<u32> = Vec::new();
    let mut call_widths: Vec<usize> = tokens
        .iter()
        .map(|t| match t.operands {
            TemplateOperands::Call { .. } => 1,
            _ => 0,
        })
        .collect();

    // One pass per possible width increase of a u32 varint.
    for _ in 0..=crate::format::MAX_ULEB128_U32_LEN {
        offsets.clear();
        let mut at: u32 = 0;
        for (i, t) in tokens.iter().enumerate() {
            offsets.push(at);
            let mut len = uleb128_len(u64::from(t.opcode.value()));
            len += match t.operands {
                TemplateOperands::None => 0,
                TemplateOperands::Literal(v) => uleb128_len(zigzag_encode_i64(v)),
                TemplateOperands::Index(v) | TemplateOperands::Arity(v) => {
                    uleb128_len(u64::from(v))
                }
                TemplateOperands::Jump(off) => uleb128_len(zigzag_encode_i64(i64::from(off))),
                TemplateOperands::Call { argc, .. } => {
                    call_widths[i] + uleb128_len(u64::from(argc))
                }
            };
            at += len as u32;
        }

        let mut stable = true;
        for (i, t) in tokens.iter().enumerate() {
            if let TemplateOperands::Call { target_token, .. } = t.operands {
                let width = uleb128_len(u64::from(offsets[target_token as usize]));
                if width != call_widths[i] {
                    call_widths[i] = width;
                    stable = false;
                }
            }
        }
        if stable {
            let mut w = Writer::new();
            for t in tokens {
                w.write_uleb128_u32(t.opcode.value());
                match t.operands {
                    TemplateOperands::None => {}
                    TemplateOperands::Literal(v) => w.write_zigzag_i64(v),
                    TemplateOperands::Index(v) | TemplateOperands::Arity(v) => {
                        w.write_uleb128_u32(v);
                    }
                    TemplateOperands::Jump(off) => w.write_zigzag_i64(i64::from(off)),
                    TemplateOperands::Call { target_token, argc } => {
                        w.write_uleb128_u32(offsets[target_token as usize]);
                        w.write_uleb128_u32(argc);
                    }
                }
            }
            return Ok(w.into_vec());
        }
    }

    Err(EncodeError::RelaxationDiverged)
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::format::Writer;

    fn tpl(opcode: Opcode, operands: TemplateOperands) -> TokenTemplate {
        TokenTemplate { opcode, operands }
    }

    #[test]
    fn decode_simple_stream() {
        let mut w = Writer::new();
        w.write_uleb128_u32(Opcode::Lit.value());
        w.write_zigzag_i64(-3);
        w.write_uleb128_u32(Opcode::Halt.value());
        let bytes = w.into_vec();

        let tokens = decode_tokens(&bytes).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].opcode, Opcode::Lit);
        assert_eq!(tokens[0].operands, Operands::Literal(-3));
        assert_eq!(tokens[1].offset, 2);
        assert_eq!(tokens[1].opcode, Opcode::Halt);
    }

    #[test]
    fn unknown_opcode_is_rejected_with_offset() {
        let mut w = Writer::new();
        w.write_uleb128_u32(Opcode::Halt.value());
        w.write_uleb128_u32(67); // legacy alias slot
        let bytes = w.into_vec();

        assert_eq!(
            decode_tokens(&bytes),
            Err(TokenError::UnknownOp {
                offset: 1,
                opcode: 67
            })
        );
    }

    #[test]
    fn truncated_operand_is_bad_encoding() {
        let bytes = [Opcode::Lit.value() as u8, 0x80];
        assert_eq!(
            decode_tokens(&bytes),
            Err(TokenError::BadEncoding { offset: 0 })
        );
    }

    #[test]
    fn encode_resolves_call_targets_to_byte_offsets() {
        // FN 1, B, RT, E, LIT 9, CL -> token 0, HALT
        let tokens = vec![
            tpl(Opcode::Fn, TemplateOperands::Arity(1)),
            tpl(Opcode::B, TemplateOperands::None),
            tpl(Opcode::Rt, TemplateOperands::None),
            tpl(Opcode::E, TemplateOperands::None),
            tpl(Opcode::Lit, TemplateOperands::Literal(9)),
            tpl(
                Opcode::Cl,
                TemplateOperands::Call {
                    target_token: 0,
                    argc: 1,
                },
            ),
            tpl(Opcode::Halt, TemplateOperands::None),
        ];

        let bytes = encode_tokens(&tokens).unwrap();
        let back = decode_tokens(&bytes).unwrap();
        assert_eq!(back.len(), tokens.len());
        assert_eq!(
            back[5].operands,
            Operands::Call {
                target: back[0].offset,
                argc: 1
            }
        );
    }

    #[test]
    fn encode_rejects_out_of_range_call_target() {
        let tokens = vec![tpl(
            Opcode::Cl,
            TemplateOperands::Call {
                target_token: 9,
                argc: 0,
            },
        )];
        assert_eq!(
            encode_tokens(&tokens),
            Err(EncodeError::BadCallTarget { token: 9 })
        );
    }
}
