//! Outbound message chunks.
//!
//! A [`Message`] is one relayed chunk owned by exactly one connection's queue.
//! Copies are taken with fallible allocation so an out-of-memory condition
//! surfaces as an error instead of aborting the process.

use std::collections::TryReserveError;

/// Uppercase every ASCII letter in place. Other bytes are left untouched.
///
/// Idempotent: applying it twice gives the same bytes as applying it once.
pub fn uppercase_in_place(bytes: &mut [u8]) {
    bytes.make_ascii_uppercase();
}

/// One pending outbound chunk.
///
/// Tracks how many bytes have already reached the wire so a short write can be
/// resumed from the exact byte where it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
    written: usize,
    uppercased: bool,
}

impl Message {
    /// Copy `payload` into a new message.
    pub fn copy_from(payload: &[u8]) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(payload.len())?;
        buf.extend_from_slice(payload);
        Ok(Self { payload: buf, written: 0, uppercased: false })
    }

    /// Length captured at enqueue time.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Message carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Full payload, including bytes already written.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes not yet written to the wire.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.written..]
    }

    /// Number of bytes already written.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.written >= self.payload.len()
    }

    /// Payload has been uppercased for the wire.
    pub fn is_uppercased(&self) -> bool {
        self.uppercased
    }

    /// Uppercase the payload before its first write. Later calls are no-ops.
    pub(crate) fn uppercase(&mut self) {
        if !self.uppercased {
            uppercase_in_place(&mut self.payload);
            self.uppercased = true;
        }
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.payload.len());
        self.written = (self.written + n).min(self.payload.len());
    }
}
