// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;

/// A 256-bit bitmap indexed by interrupt vector, stored as eight 32-bit
/// words the way the IRR/ISR/TMR register banks expose them to the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorBitmap([u32; 8]);

impl VectorBitmap {
    pub fn new() -> VectorBitmap {
        Default::default()
    }

    pub fn set(&mut self, vector: u8) {
        self.0[usize::from(vector) >> 5] |= 1 << (vector & 0x1f);
    }

    pub fn clear(&mut self, vector: u8) {
        self.0[usize::from(vector) >> 5] &= !(1 << (vector & 0x1f));
    }

    pub fn get(&self, vector: u8) -> bool {
        self.0[usize::from(vector) >> 5] & (1 << (vector & 0x1f)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 8]
    }

    /// Highest vector whose bit is set.
    pub fn highest_set(&self) -> Option<u8> {
        for (word_index, &word) in self.0.iter().enumerate().rev() {
            if word != 0 {
                return Some((word_index as u8) * 32 + (31 - word.leading_zeros() as u8));
            }
        }
        None
    }

    /// Lowest vector whose bit is set.
    pub fn lowest_set(&self) -> Option<u8> {
        for (word_index, &word) in self.0.iter().enumerate() {
            if word != 0 {
                return Some((word_index as u8) * 32 + word.trailing_zeros() as u8);
            }
        }
        None
    }

    /// The raw register-bank view, one word per 32 vectors.
    pub fn words(&self) -> &[u32; 8] {
        &self.0
    }

    pub fn from_words(words: [u32; 8]) -> VectorBitmap {
        VectorBitmap(words)
    }
}
