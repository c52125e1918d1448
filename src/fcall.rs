// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 9P2000 / 9P2000.u protocol message definitions and encoding/decoding
//!
//! This module implements the base 9P2000 protocol together with the
//! 9P2000.u ("dotu") Unix extension. See <https://9p.io/sys/man/5/intro>
//! and <https://ericvh.github.io/9p-rfc/rfc9p2000.u.html>
//!
//! All messages are framed as `size[4] type[1] tag[2] body` with
//! little-endian integers and `len[2]`-prefixed UTF-8 strings. Several
//! layouts are dialect-sensitive: `Rerror` carries an errno only in dotu,
//! `Tcreate` carries an extension string only in dotu, and the `Dir` stat
//! record grows a four-field tail in dotu. Encoding and decoding therefore
//! take the negotiated dialect as an argument.

use std::borrow::Cow;
use std::fmt::Display;
use std::io;

use bitflags::bitflags;

/// Base protocol version string
pub const VERSION9P: &str = "9P2000";

/// Unix-extension protocol version string
pub const VERSION9PU: &str = "9P2000.u";

/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Special uid meaning "no user id specified" in dotu numeric id fields
pub const NOUID: u32 = !0;

/// Room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Maximum elements in a single walk
pub const MAXWELEM: usize = 16;

// Open-mode byte: the low two bits select the access mode, the rest are
// modifier flags.
pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const ORCLOSE: u8 = 0x40;

bitflags! {
    /// Bits in Qid.typ
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QidType: u8 {
        /// Type bit for directories
        const DIR       = 0x80;
        /// Type bit for append only files
        const APPEND    = 0x40;
        /// Type bit for exclusive use files
        const EXCL      = 0x20;
        /// Type bit for mounted channel
        const MOUNT     = 0x10;
        /// Type bit for authentication file
        const AUTH      = 0x08;
        /// Type bit for not-backed-up file
        const TMP       = 0x04;
        /// Type bit for symbolic links (9P2000.u)
        const SYMLINK   = 0x02;
        /// Type bit for hard links (9P2000.u)
        const LINK      = 0x01;
        /// Plain file
        const FILE      = 0x00;
    }
}

bitflags! {
    /// File mode / permission bits as carried in `Dir.mode` and `Tcreate.perm`
    ///
    /// The low nine bits are the usual Unix permission bits; the high bits
    /// describe the kind of file. The `DM*` names follow the protocol.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Perm: u32 {
        const DMDIR         = 0x8000_0000;
        const DMAPPEND      = 0x4000_0000;
        const DMEXCL        = 0x2000_0000;
        const DMMOUNT       = 0x1000_0000;
        const DMAUTH        = 0x0800_0000;
        const DMTMP         = 0x0400_0000;
        /// Symbolic link (9P2000.u)
        const DMSYMLINK     = 0x0200_0000;
        /// Hard link (9P2000.u)
        const DMLINK        = 0x0100_0000;
        /// Device file (9P2000.u)
        const DMDEVICE      = 0x0080_0000;
        /// Named pipe (9P2000.u)
        const DMNAMEDPIPE   = 0x0020_0000;
        /// Socket (9P2000.u)
        const DMSOCKET      = 0x0010_0000;
        /// Setuid (9P2000.u)
        const DMSETUID      = 0x0008_0000;
        /// Setgid (9P2000.u)
        const DMSETGID      = 0x0004_0000;

        const _ = !0; // permission bits live in the low nine bits
    }
}

/// Unique server-assigned identifier for a filesystem object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

/// Wire size of an encoded Qid: typ[1] version[4] path[8]
pub const QIDSZ: usize = 13;

/// Marshalled metadata record for one filesystem object
///
/// This is the payload of `Rstat` and `Twstat` and the unit packed into
/// `Rread` replies on directories. In `Twstat` a field holding its
/// "don't touch" sentinel (all-ones for integers, the empty string for
/// names) asks the server to leave that attribute alone.
#[derive(Clone, Debug, Default)]
pub struct Dir {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,

    // 9P2000.u extension fields
    pub ext: String,
    pub uidnum: u32,
    pub gidnum: u32,
    pub muidnum: u32,
}

impl Dir {
    /// A `Dir` with every field set to its "don't touch" sentinel, the
    /// starting point for building a `Twstat` request.
    pub fn no_change() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
            ext: String::new(),
            uidnum: NOUID,
            gidnum: NOUID,
            muidnum: NOUID,
        }
    }

    /// Encoded size in bytes, including the record's own leading `size[2]`
    /// count field.
    pub fn wire_len(&self, dotu: bool) -> usize {
        let mut n = 2 + 2 + 4 + QIDSZ + 4 + 4 + 4 + 8;
        for s in [&self.name, &self.uid, &self.gid, &self.muid] {
            n += 2 + s.len();
        }
        if dotu {
            n += 2 + self.ext.len();
            n += 4 + 4 + 4;
        }
        n
    }

    /// Append this record to `buf` in wire format.
    pub fn encode(&self, buf: &mut Vec<u8>, dotu: bool) {
        encode_u16(buf, (self.wire_len(dotu) - 2) as u16);
        encode_u16(buf, self.typ);
        encode_u32(buf, self.dev);
        encode_qid(buf, &self.qid);
        encode_u32(buf, self.mode);
        encode_u32(buf, self.atime);
        encode_u32(buf, self.mtime);
        encode_u64(buf, self.length);
        encode_str(buf, &self.name);
        encode_str(buf, &self.uid);
        encode_str(buf, &self.gid);
        encode_str(buf, &self.muid);
        if dotu {
            encode_str(buf, &self.ext);
            encode_u32(buf, self.uidnum);
            encode_u32(buf, self.gidnum);
            encode_u32(buf, self.muidnum);
        }
    }
}

/// Error reply payload: a human-readable message plus, in dotu, the host
/// errno. Base 9P2000 carries only the message on the wire.
#[derive(Clone, Debug)]
pub struct Rerror {
    pub ename: Cow<'static, str>,
    pub ecode: u32,
}

impl Rerror {
    pub fn new(ename: impl Into<Cow<'static, str>>, ecode: u32) -> Rerror {
        Rerror {
            ename: ename.into(),
            ecode,
        }
    }

    /// "no authentication required" — the server refuses auth fids
    pub fn enoauth() -> Rerror {
        Rerror::new("no authentication required", libc::EINVAL as u32)
    }

    /// "file not found" — the first walk element does not exist
    pub fn enoent() -> Rerror {
        Rerror::new("file not found", libc::ENOENT as u32)
    }

    /// "unknown fid" — a message referenced a fid with no table entry
    pub fn eunknownfid() -> Rerror {
        Rerror::new("unknown fid", libc::EINVAL as u32)
    }

    /// "bad use of fid" — e.g. read on an unopened fid, walk on an open one
    pub fn ebaduse() -> Rerror {
        Rerror::new("bad use of fid", libc::EINVAL as u32)
    }

    /// "fid already in use" — attach or walk tried to reuse a live fid
    pub fn einuse() -> Rerror {
        Rerror::new("fid already in use", libc::EINVAL as u32)
    }
}

impl Display for Rerror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.ename, self.ecode)
    }
}

impl From<&io::Error> for Rerror {
    fn from(err: &io::Error) -> Rerror {
        let ecode = err.raw_os_error().unwrap_or(libc::EIO) as u32;
        Rerror::new(err.to_string(), ecode)
    }
}

impl From<io::Error> for Rerror {
    fn from(err: io::Error) -> Rerror {
        Rerror::from(&err)
    }
}

impl From<nix::errno::Errno> for Rerror {
    fn from(err: nix::errno::Errno) -> Rerror {
        Rerror::new(err.desc(), err as u32)
    }
}

/// 9P message types
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FcallType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    // 106 is Terror, which is illegal on the wire
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl FcallType {
    /// Convert a u8 to FcallType
    pub fn from_u8(v: u8) -> Option<FcallType> {
        match v {
            100 => Some(FcallType::Tversion),
            101 => Some(FcallType::Rversion),
            102 => Some(FcallType::Tauth),
            103 => Some(FcallType::Rauth),
            104 => Some(FcallType::Tattach),
            105 => Some(FcallType::Rattach),
            107 => Some(FcallType::Rerror),
            108 => Some(FcallType::Tflush),
            109 => Some(FcallType::Rflush),
            110 => Some(FcallType::Twalk),
            111 => Some(FcallType::Rwalk),
            112 => Some(FcallType::Topen),
            113 => Some(FcallType::Ropen),
            114 => Some(FcallType::Tcreate),
            115 => Some(FcallType::Rcreate),
            116 => Some(FcallType::Tread),
            117 => Some(FcallType::Rread),
            118 => Some(FcallType::Twrite),
            119 => Some(FcallType::Rwrite),
            120 => Some(FcallType::Tclunk),
            121 => Some(FcallType::Rclunk),
            122 => Some(FcallType::Tremove),
            123 => Some(FcallType::Rremove),
            124 => Some(FcallType::Tstat),
            125 => Some(FcallType::Rstat),
            126 => Some(FcallType::Twstat),
            127 => Some(FcallType::Rwstat),
            _ => None,
        }
    }
}

// ============================================================================
// Request/Response structures
// ============================================================================

/// Version request
#[derive(Clone, Debug)]
pub struct Tversion {
    pub msize: u32,
    pub version: String,
}

/// Version response
#[derive(Clone, Debug)]
pub struct Rversion {
    pub msize: u32,
    pub version: String,
}

/// Auth request
#[derive(Clone, Debug)]
pub struct Tauth {
    pub afid: u32,
    pub uname: String,
    pub aname: String,
    /// Numeric user id (dotu only; `NOUID` otherwise)
    pub nuname: u32,
}

/// Auth response
#[derive(Clone, Debug)]
pub struct Rauth {
    pub aqid: Qid,
}

/// Attach request
#[derive(Clone, Debug)]
pub struct Tattach {
    pub fid: u32,
    pub afid: u32,
    pub uname: String,
    pub aname: String,
    /// Numeric user id (dotu only; `NOUID` otherwise)
    pub nuname: u32,
}

/// Attach response
#[derive(Clone, Debug)]
pub struct Rattach {
    pub qid: Qid,
}

/// Flush request
#[derive(Clone, Debug)]
pub struct Tflush {
    pub oldtag: u16,
}

/// Flush response
#[derive(Clone, Debug)]
pub struct Rflush {}

/// Walk request
#[derive(Clone, Debug)]
pub struct Twalk {
    pub fid: u32,
    pub newfid: u32,
    pub wnames: Vec<String>,
}

/// Walk response
#[derive(Clone, Debug)]
pub struct Rwalk {
    pub wqids: Vec<Qid>,
}

/// Open request
#[derive(Clone, Debug)]
pub struct Topen {
    pub fid: u32,
    pub mode: u8,
}

/// Open response
#[derive(Clone, Debug)]
pub struct Ropen {
    pub qid: Qid,
    pub iounit: u32,
}

/// Create request
#[derive(Clone, Debug)]
pub struct Tcreate {
    pub fid: u32,
    pub name: String,
    pub perm: Perm,
    pub mode: u8,
    /// Special-file description (dotu only): symlink target, hard-link fid
    /// number, or device major/minor
    pub ext: String,
}

/// Create response
#[derive(Clone, Debug)]
pub struct Rcreate {
    pub qid: Qid,
    pub iounit: u32,
}

/// Read request
#[derive(Clone, Debug)]
pub struct Tread {
    pub fid: u32,
    pub offset: u64,
    pub count: u32,
}

/// Read response
#[derive(Clone, Debug)]
pub struct Rread {
    pub data: Vec<u8>,
}

/// Write request
#[derive(Clone, Debug)]
pub struct Twrite {
    pub fid: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Write response
#[derive(Clone, Debug)]
pub struct Rwrite {
    pub count: u32,
}

/// Clunk request
#[derive(Clone, Debug)]
pub struct Tclunk {
    pub fid: u32,
}

/// Clunk response
#[derive(Clone, Debug)]
pub struct Rclunk {}

/// Remove request
#[derive(Clone, Debug)]
pub struct Tremove {
    pub fid: u32,
}

/// Remove response
#[derive(Clone, Debug)]
pub struct Rremove {}

/// Stat request
#[derive(Clone, Debug)]
pub struct Tstat {
    pub fid: u32,
}

/// Stat response
#[derive(Clone, Debug)]
pub struct Rstat {
    pub stat: Dir,
}

/// Wstat request
#[derive(Clone, Debug)]
pub struct Twstat {
    pub fid: u32,
    pub stat: Dir,
}

/// Wstat response
#[derive(Clone, Debug)]
pub struct Rwstat {}

// ============================================================================
// Fcall enum and conversions
// ============================================================================

/// 9P protocol message
#[derive(Clone, Debug)]
pub enum Fcall {
    Tversion(Tversion),
    Rversion(Rversion),
    Tauth(Tauth),
    Rauth(Rauth),
    Tattach(Tattach),
    Rattach(Rattach),
    Rerror(Rerror),
    Tflush(Tflush),
    Rflush(Rflush),
    Twalk(Twalk),
    Rwalk(Rwalk),
    Topen(Topen),
    Ropen(Ropen),
    Tcreate(Tcreate),
    Rcreate(Rcreate),
    Tread(Tread),
    Rread(Rread),
    Twrite(Twrite),
    Rwrite(Rwrite),
    Tclunk(Tclunk),
    Rclunk(Rclunk),
    Tremove(Tremove),
    Rremove(Rremove),
    Tstat(Tstat),
    Rstat(Rstat),
    Twstat(Twstat),
    Rwstat(Rwstat),
}

macro_rules! impl_from_for_fcall {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Fcall {
                fn from(v: $variant) -> Fcall {
                    Fcall::$variant(v)
                }
            }
        )*
    };
}

impl_from_for_fcall! {
    Tversion, Rversion, Tauth, Rauth, Tattach, Rattach, Rerror,
    Tflush, Rflush, Twalk, Rwalk, Topen, Ropen, Tcreate, Rcreate,
    Tread, Rread, Twrite, Rwrite, Tclunk, Rclunk, Tremove, Rremove,
    Tstat, Rstat, Twstat, Rwstat,
}

/// Tagged 9P message
#[derive(Clone, Debug)]
pub struct TaggedFcall {
    pub tag: u16,
    pub fcall: Fcall,
}

impl TaggedFcall {
    /// Encode the message into `buf`, replacing its contents.
    pub fn encode_to_buf(&self, buf: &mut Vec<u8>, dotu: bool) {
        buf.clear();
        buf.resize(4, 0); // room for the size field
        encode_fcall(buf, self.tag, &self.fcall, dotu);
        let size = buf.len() as u32;
        buf[0..4].copy_from_slice(&size.to_le_bytes());
    }

    /// Decode a message from a buffer holding one complete frame.
    pub fn decode(buf: &[u8], dotu: bool) -> Result<TaggedFcall, crate::Error> {
        if buf.len() < 7 {
            return Err(crate::Error::InvalidMessage);
        }
        let mut decoder = FcallDecoder { buf: &buf[4..] };
        decoder.decode(dotu)
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn encode_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn encode_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_str(buf: &mut Vec<u8>, v: &str) {
    encode_u16(buf, v.len() as u16);
    buf.extend_from_slice(v.as_bytes());
}

fn encode_data_buf(buf: &mut Vec<u8>, v: &[u8]) {
    encode_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

fn encode_qid(buf: &mut Vec<u8>, v: &Qid) {
    encode_u8(buf, v.typ.bits());
    encode_u32(buf, v.version);
    encode_u64(buf, v.path);
}

fn encode_vec_qid(buf: &mut Vec<u8>, v: &[Qid]) {
    encode_u16(buf, v.len() as u16);
    for q in v {
        encode_qid(buf, q);
    }
}

fn encode_vec_str(buf: &mut Vec<u8>, v: &[String]) {
    encode_u16(buf, v.len() as u16);
    for s in v {
        encode_str(buf, s);
    }
}

/// Encode a `Dir` preceded by the extra `stat[n]` count that `Rstat` and
/// `Twstat` carry around the record.
fn encode_framed_dir(buf: &mut Vec<u8>, d: &Dir, dotu: bool) {
    encode_u16(buf, d.wire_len(dotu) as u16);
    d.encode(buf, dotu);
}

fn encode_fcall(buf: &mut Vec<u8>, tag: u16, fcall: &Fcall, dotu: bool) {
    match fcall {
        Fcall::Tversion(v) => {
            encode_u8(buf, FcallType::Tversion as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.msize);
            encode_str(buf, &v.version);
        }
        Fcall::Rversion(v) => {
            encode_u8(buf, FcallType::Rversion as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.msize);
            encode_str(buf, &v.version);
        }
        Fcall::Tauth(v) => {
            encode_u8(buf, FcallType::Tauth as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.afid);
            encode_str(buf, &v.uname);
            encode_str(buf, &v.aname);
            if dotu {
                encode_u32(buf, v.nuname);
            }
        }
        Fcall::Rauth(v) => {
            encode_u8(buf, FcallType::Rauth as u8);
            encode_u16(buf, tag);
            encode_qid(buf, &v.aqid);
        }
        Fcall::Tattach(v) => {
            encode_u8(buf, FcallType::Tattach as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_u32(buf, v.afid);
            encode_str(buf, &v.uname);
            encode_str(buf, &v.aname);
            if dotu {
                encode_u32(buf, v.nuname);
            }
        }
        Fcall::Rattach(v) => {
            encode_u8(buf, FcallType::Rattach as u8);
            encode_u16(buf, tag);
            encode_qid(buf, &v.qid);
        }
        Fcall::Rerror(v) => {
            encode_u8(buf, FcallType::Rerror as u8);
            encode_u16(buf, tag);
            encode_str(buf, &v.ename);
            if dotu {
                encode_u32(buf, v.ecode);
            }
        }
        Fcall::Tflush(v) => {
            encode_u8(buf, FcallType::Tflush as u8);
            encode_u16(buf, tag);
            encode_u16(buf, v.oldtag);
        }
        Fcall::Rflush(_) => {
            encode_u8(buf, FcallType::Rflush as u8);
            encode_u16(buf, tag);
        }
        Fcall::Twalk(v) => {
            encode_u8(buf, FcallType::Twalk as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_u32(buf, v.newfid);
            encode_vec_str(buf, &v.wnames);
        }
        Fcall::Rwalk(v) => {
            encode_u8(buf, FcallType::Rwalk as u8);
            encode_u16(buf, tag);
            encode_vec_qid(buf, &v.wqids);
        }
        Fcall::Topen(v) => {
            encode_u8(buf, FcallType::Topen as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_u8(buf, v.mode);
        }
        Fcall::Ropen(v) => {
            encode_u8(buf, FcallType::Ropen as u8);
            encode_u16(buf, tag);
            encode_qid(buf, &v.qid);
            encode_u32(buf, v.iounit);
        }
        Fcall::Tcreate(v) => {
            encode_u8(buf, FcallType::Tcreate as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_str(buf, &v.name);
            encode_u32(buf, v.perm.bits());
            encode_u8(buf, v.mode);
            if dotu {
                encode_str(buf, &v.ext);
            }
        }
        Fcall::Rcreate(v) => {
            encode_u8(buf, FcallType::Rcreate as u8);
            encode_u16(buf, tag);
            encode_qid(buf, &v.qid);
            encode_u32(buf, v.iounit);
        }
        Fcall::Tread(v) => {
            encode_u8(buf, FcallType::Tread as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_u64(buf, v.offset);
            encode_u32(buf, v.count);
        }
        Fcall::Rread(v) => {
            encode_u8(buf, FcallType::Rread as u8);
            encode_u16(buf, tag);
            encode_data_buf(buf, &v.data);
        }
        Fcall::Twrite(v) => {
            encode_u8(buf, FcallType::Twrite as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_u64(buf, v.offset);
            encode_data_buf(buf, &v.data);
        }
        Fcall::Rwrite(v) => {
            encode_u8(buf, FcallType::Rwrite as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.count);
        }
        Fcall::Tclunk(v) => {
            encode_u8(buf, FcallType::Tclunk as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
        }
        Fcall::Rclunk(_) => {
            encode_u8(buf, FcallType::Rclunk as u8);
            encode_u16(buf, tag);
        }
        Fcall::Tremove(v) => {
            encode_u8(buf, FcallType::Tremove as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
        }
        Fcall::Rremove(_) => {
            encode_u8(buf, FcallType::Rremove as u8);
            encode_u16(buf, tag);
        }
        Fcall::Tstat(v) => {
            encode_u8(buf, FcallType::Tstat as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
        }
        Fcall::Rstat(v) => {
            encode_u8(buf, FcallType::Rstat as u8);
            encode_u16(buf, tag);
            encode_framed_dir(buf, &v.stat, dotu);
        }
        Fcall::Twstat(v) => {
            encode_u8(buf, FcallType::Twstat as u8);
            encode_u16(buf, tag);
            encode_u32(buf, v.fid);
            encode_framed_dir(buf, &v.stat, dotu);
        }
        Fcall::Rwstat(_) => {
            encode_u8(buf, FcallType::Rwstat as u8);
            encode_u16(buf, tag);
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct FcallDecoder<'b> {
    buf: &'b [u8],
}

impl<'b> FcallDecoder<'b> {
    fn decode_u8(&mut self) -> Result<u8, crate::Error> {
        if let Some(v) = self.buf.first() {
            self.buf = &self.buf[1..];
            Ok(*v)
        } else {
            Err(crate::Error::InvalidMessage)
        }
    }

    fn decode_u16(&mut self) -> Result<u16, crate::Error> {
        if self.buf.len() < 2 {
            return Err(crate::Error::InvalidMessage);
        }
        let (bytes, rest) = self.buf.split_at(2);
        self.buf = rest;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn decode_u32(&mut self) -> Result<u32, crate::Error> {
        if self.buf.len() < 4 {
            return Err(crate::Error::InvalidMessage);
        }
        let (bytes, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn decode_u64(&mut self) -> Result<u64, crate::Error> {
        if self.buf.len() < 8 {
            return Err(crate::Error::InvalidMessage);
        }
        let (bytes, rest) = self.buf.split_at(8);
        self.buf = rest;
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(b))
    }

    fn decode_str(&mut self) -> Result<String, crate::Error> {
        let len = self.decode_u16()? as usize;
        if self.buf.len() < len {
            return Err(crate::Error::InvalidMessage);
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(bytes.to_vec()).map_err(|_| crate::Error::InvalidMessage)
    }

    fn decode_data_buf(&mut self) -> Result<Vec<u8>, crate::Error> {
        let len = self.decode_u32()? as usize;
        if self.buf.len() < len {
            return Err(crate::Error::InvalidMessage);
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(bytes.to_vec())
    }

    fn decode_qid(&mut self) -> Result<Qid, crate::Error> {
        Ok(Qid {
            typ: QidType::from_bits_retain(self.decode_u8()?),
            version: self.decode_u32()?,
            path: self.decode_u64()?,
        })
    }

    fn decode_vec_qid(&mut self) -> Result<Vec<Qid>, crate::Error> {
        let n = self.decode_u16()? as usize;
        let mut v = Vec::with_capacity(n.min(MAXWELEM));
        for _ in 0..n {
            v.push(self.decode_qid()?);
        }
        Ok(v)
    }

    fn decode_vec_str(&mut self) -> Result<Vec<String>, crate::Error> {
        let n = self.decode_u16()? as usize;
        let mut v = Vec::with_capacity(n.min(MAXWELEM));
        for _ in 0..n {
            v.push(self.decode_str()?);
        }
        Ok(v)
    }

    fn decode_dir(&mut self, dotu: bool) -> Result<Dir, crate::Error> {
        let _size = self.decode_u16()?;
        let mut d = Dir {
            typ: self.decode_u16()?,
            dev: self.decode_u32()?,
            qid: self.decode_qid()?,
            mode: self.decode_u32()?,
            atime: self.decode_u32()?,
            mtime: self.decode_u32()?,
            length: self.decode_u64()?,
            name: self.decode_str()?,
            uid: self.decode_str()?,
            gid: self.decode_str()?,
            muid: self.decode_str()?,
            ..Dir::no_change()
        };
        if dotu {
            d.ext = self.decode_str()?;
            d.uidnum = self.decode_u32()?;
            d.gidnum = self.decode_u32()?;
            d.muidnum = self.decode_u32()?;
        }
        Ok(d)
    }

    /// Decode a `Dir` preceded by the extra `stat[n]` count.
    fn decode_framed_dir(&mut self, dotu: bool) -> Result<Dir, crate::Error> {
        let _nstat = self.decode_u16()?;
        self.decode_dir(dotu)
    }

    fn decode(&mut self, dotu: bool) -> Result<TaggedFcall, crate::Error> {
        let typ = self.decode_u8()?;
        let tag = self.decode_u16()?;
        let Some(typ) = FcallType::from_u8(typ) else {
            return Err(crate::Error::InvalidMessage);
        };
        let fcall = match typ {
            FcallType::Tversion => Fcall::Tversion(Tversion {
                msize: self.decode_u32()?,
                version: self.decode_str()?,
            }),
            FcallType::Rversion => Fcall::Rversion(Rversion {
                msize: self.decode_u32()?,
                version: self.decode_str()?,
            }),
            FcallType::Tauth => Fcall::Tauth(Tauth {
                afid: self.decode_u32()?,
                uname: self.decode_str()?,
                aname: self.decode_str()?,
                nuname: if dotu { self.decode_u32()? } else { NOUID },
            }),
            FcallType::Rauth => Fcall::Rauth(Rauth {
                aqid: self.decode_qid()?,
            }),
            FcallType::Tattach => Fcall::Tattach(Tattach {
                fid: self.decode_u32()?,
                afid: self.decode_u32()?,
                uname: self.decode_str()?,
                aname: self.decode_str()?,
                nuname: if dotu { self.decode_u32()? } else { NOUID },
            }),
            FcallType::Rattach => Fcall::Rattach(Rattach {
                qid: self.decode_qid()?,
            }),
            FcallType::Rerror => Fcall::Rerror(Rerror {
                ename: self.decode_str()?.into(),
                ecode: if dotu {
                    self.decode_u32()?
                } else {
                    libc::EIO as u32
                },
            }),
            FcallType::Tflush => Fcall::Tflush(Tflush {
                oldtag: self.decode_u16()?,
            }),
            FcallType::Rflush => Fcall::Rflush(Rflush {}),
            FcallType::Twalk => Fcall::Twalk(Twalk {
                fid: self.decode_u32()?,
                newfid: self.decode_u32()?,
                wnames: self.decode_vec_str()?,
            }),
            FcallType::Rwalk => Fcall::Rwalk(Rwalk {
                wqids: self.decode_vec_qid()?,
            }),
            FcallType::Topen => Fcall::Topen(Topen {
                fid: self.decode_u32()?,
                mode: self.decode_u8()?,
            }),
            FcallType::Ropen => Fcall::Ropen(Ropen {
                qid: self.decode_qid()?,
                iounit: self.decode_u32()?,
            }),
            FcallType::Tcreate => Fcall::Tcreate(Tcreate {
                fid: self.decode_u32()?,
                name: self.decode_str()?,
                perm: Perm::from_bits_retain(self.decode_u32()?),
                mode: self.decode_u8()?,
                ext: if dotu {
                    self.decode_str()?
                } else {
                    String::new()
                },
            }),
            FcallType::Rcreate => Fcall::Rcreate(Rcreate {
                qid: self.decode_qid()?,
                iounit: self.decode_u32()?,
            }),
            FcallType::Tread => Fcall::Tread(Tread {
                fid: self.decode_u32()?,
                offset: self.decode_u64()?,
                count: self.decode_u32()?,
            }),
            FcallType::Rread => Fcall::Rread(Rread {
                data: self.decode_data_buf()?,
            }),
            FcallType::Twrite => Fcall::Twrite(Twrite {
                fid: self.decode_u32()?,
                offset: self.decode_u64()?,
                data: self.decode_data_buf()?,
            }),
            FcallType::Rwrite => Fcall::Rwrite(Rwrite {
                count: self.decode_u32()?,
            }),
            FcallType::Tclunk => Fcall::Tclunk(Tclunk {
                fid: self.decode_u32()?,
            }),
            FcallType::Rclunk => Fcall::Rclunk(Rclunk {}),
            FcallType::Tremove => Fcall::Tremove(Tremove {
                fid: self.decode_u32()?,
            }),
            FcallType::Rremove => Fcall::Rremove(Rremove {}),
            FcallType::Tstat => Fcall::Tstat(Tstat {
                fid: self.decode_u32()?,
            }),
            FcallType::Rstat => Fcall::Rstat(Rstat {
                stat: self.decode_framed_dir(dotu)?,
            }),
            FcallType::Twstat => Fcall::Twstat(Twstat {
                fid: self.decode_u32()?,
                stat: self.decode_framed_dir(dotu)?,
            }),
            FcallType::Rwstat => Fcall::Rwstat(Rwstat {}),
        };
        Ok(TaggedFcall { tag, fcall })
    }
}

/// Parse the concatenated `Dir` records a directory read returns.
pub fn decode_dir_entries(data: &[u8], dotu: bool) -> Result<Vec<Dir>, crate::Error> {
    let mut decoder = FcallDecoder { buf: data };
    let mut entries = Vec::new();
    while !decoder.buf.is_empty() {
        entries.push(decoder.decode_dir(dotu)?);
    }
    Ok(entries)
}
