// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The loaded program container.
//!
//! Loading tokenizes the raw byte stream, rewrites structured `WH`/`FR`
//! loops into flat jumps, and builds the two auxiliary tables that are the
//! sole authority for resolving jump targets afterwards:
//!
//! - `token_offsets[i]`: byte offset of the i-th opcode
//! - `byte_to_token[b]`: opcode index at byte `b`, or none inside operands
//!
//! Both tables are invariant for the lifetime of the loaded program; the
//! interpreter never mutates program bytes.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::bytecode::{DecodedToken, TokenError, decode_tokens};
use crate::lower;
use crate::opcode::Opcode;

pub use crate::lower::LowerError;

/// A load-time rejection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// Tokenization failed.
    Token(TokenError),
    /// Structured-loop lowering failed.
    Lower(LowerError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(e) => write!(f, "tokenize: {e}"),
            Self::Lower(e) => write!(f, "lower: {e}"),
        }
    }
}

impl core::error::Error for LoadError {}

impl From<TokenError> for LoadError {
    fn from(e: TokenError) -> Self {
        Self::Token(e)
    }
}

impl From<LowerError> for LoadError {
    fn from(e: LowerError) -> Self {
        Self::Lower(e)
    }
}

/// A loaded, lowered M-Token program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    bytes: Vec<u8>,
    tokens: Vec<DecodedToken>,
    byte_to_token: Vec<Option<u32>>,
}

impl Program {
    /// Loads a program from raw bytes: tokenize, lower, build tables.
    pub fn load(bytes: Vec<u8>) -> Result<Self, LoadError> {
        let tokens = decode_tokens(&bytes)?;

        let (bytes, tokens) = if tokens.iter().any(|t| t.opcode.is_structured_loop()) {
            let lowered = lower::lower(&tokens)?;
            let tokens = decode_tokens(&lowered).map_err(LoadError::Token)?;
            (lowered, tokens)
        } else {
            (bytes, tokens)
        };

        let mut byte_to_token = vec![None; bytes.len()];
        for (i, t) in tokens.iter().enumerate() {
            byte_to_token[t.offset as usize] = Some(i as u32);
        }

        Ok(Self {
            bytes,
            tokens,
            byte_to_token,
        })
    }

    /// Loads a program without running the lowering pass.
    ///
    /// Raw loading is for inspection and pre-flight validation of incoming
    /// programs; the interpreter only accepts fully lowered programs and
    /// faults on a structured loop marker.
    pub fn load_raw(bytes: Vec<u8>) -> Result<Self, LoadError> {
        let tokens = decode_tokens(&bytes)?;
        let mut byte_to_token = vec![None; bytes.len()];
        for (i, t) in tokens.iter().enumerate() {
            byte_to_token[t.offset as usize] = Some(i as u32);
        }
        Ok(Self {
            bytes,
            tokens,
            byte_to_token,
        })
    }

    /// Returns the (possibly rewritten) program bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the byte length of the program.
    #[must_use]
    pub fn byte_len(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Returns the decoded token stream.
    #[must_use]
    pub fn tokens(&self) -> &[DecodedToken] {
        &self.tokens
    }

    /// Returns the number of opcode tokens.
    #[must_use]
    pub fn token_count(&self) -> u32 {
        self.tokens.len() as u32
    }

    /// Returns the byte offset of token `index`, or the byte length for the
    /// one-past-the-end index.
    #[must_use]
    pub fn token_offset(&self, index: u32) -> Option<u32> {
        if index == self.token_count() {
            return Some(self.byte_len());
        }
        self.tokens.get(index as usize).map(|t| t.offset)
    }

    /// Returns the token index whose opcode starts at byte `offset`.
    ///
    /// Offsets inside operand bytes resolve to `None`.
    #[must_use]
    pub fn token_at_byte(&self, offset: u32) -> Option<u32> {
        self.byte_to_token.get(offset as usize).copied().flatten()
    }

    /// Returns the token at `index`.
    #[must_use]
    pub fn token(&self, index: u32) -> Option<&DecodedToken> {
        self.tokens.get(index as usize)
    }

    /// Scans forward from the block-opening token at `index` (a `B`) to its
    /// matching `E`, returning the `E`'s token index.
    #[must_use]
    pub fn matching_block_end(&self, index: u32) -> Option<u32> {
        if self.token(index)?.opcode != Opcode::B {
            return None;
        }
        let mut depth = 0_u32;
        for i in index as usize..self.tokens.len() {
            match self.tokens[i].opcode {
                Opcode::B => depth += 1,
                Opcode::E => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i as u32);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
