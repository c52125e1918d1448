// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Framed 9P message I/O
//!
//! Reads and writes complete `size[4]`-prefixed 9P frames over any
//! [`std::io::Read`]/[`std::io::Write`] transport, reusing a caller-owned
//! buffer between messages.

use std::io::{Read, Write};

use crate::fcall::TaggedFcall;

/// Minimum legal message size: size[4] + type[1] + tag[2]
const MINMSGSZ: usize = 7;

/// Read one complete frame into `buf`.
///
/// `max_size` bounds the accepted frame length; a peer announcing a larger
/// message than the negotiated msize is a protocol violation.
pub(crate) fn read_frame<R: Read>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
) -> Result<(), crate::Error> {
    buf.resize(4, 0);
    r.read_exact(&mut buf[..])?;
    let sz = u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice")) as usize;
    if sz < MINMSGSZ || sz > max_size {
        return Err(crate::Error::InvalidMessage);
    }
    buf.resize(sz, 0);
    r.read_exact(&mut buf[4..])?;
    Ok(())
}

/// Read and decode one message.
pub(crate) fn read_msg<R: Read>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
    dotu: bool,
) -> Result<TaggedFcall, crate::Error> {
    read_frame(r, buf, max_size)?;
    TaggedFcall::decode(buf, dotu)
}

/// Encode and write one message.
pub(crate) fn write_msg<W: Write>(
    w: &mut W,
    buf: &mut Vec<u8>,
    msg: &TaggedFcall,
    dotu: bool,
) -> Result<(), crate::Error> {
    msg.encode_to_buf(buf, dotu);
    w.write_all(buf)?;
    Ok(())
}
