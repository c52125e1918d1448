// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 9P client implementation
//!
//! A synchronous client for the 9P2000 and 9P2000.u protocols, speaking to
//! any server over a transport that implements [`std::io::Read`] and
//! [`std::io::Write`]. One request is in flight at a time; the integration
//! tests use this client to drive the server in this crate end-to-end.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::Error;
use crate::fcall::{
    Dir, Fcall, IOHDRSZ, NOFID, NOUID, Perm, Qid, Rerror, Tattach, Tclunk, Tcreate, Topen,
    Tread, Tremove, Tstat, Tversion, Twalk, Twrite, Twstat, TaggedFcall, VERSION9P, VERSION9PU,
    decode_dir_entries,
};
use crate::transport;

/// ID generator for fids
struct IdGenerator {
    next: u32,
    free_ids: Vec<u32>,
}

impl IdGenerator {
    const fn new() -> Self {
        IdGenerator {
            next: 0,
            free_ids: Vec::new(),
        }
    }

    fn next(&mut self) -> u32 {
        if let Some(id) = self.free_ids.pop() {
            id
        } else {
            let id = self.next;
            self.next = self.next.checked_add(1).expect("out of fids");
            id
        }
    }

    fn free(&mut self, id: u32) {
        self.free_ids.push(id);
    }
}

/// Fid generator with thread-safe access
struct FidGenerator {
    inner: Mutex<IdGenerator>,
}

impl FidGenerator {
    fn new() -> Self {
        FidGenerator {
            inner: Mutex::new(IdGenerator::new()),
        }
    }

    fn next(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).next()
    }

    fn free(&self, id: u32) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).free(id);
    }
}

/// Transport plus scratch buffers, serialized behind one lock
struct ClientState<T> {
    transport: T,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
}

/// 9P client
pub struct Client<T: Read + Write> {
    /// Maximum message size negotiated with the server
    msize: u32,
    /// Whether the connection negotiated the dotu dialect
    dotu: bool,
    state: Mutex<ClientState<T>>,
    fids: FidGenerator,
    next_tag: AtomicU32,
}

impl<T: Read + Write> Client<T> {
    /// Create a new 9P client and perform version negotiation.
    ///
    /// Offers 9P2000.u when `dotu` is set; the server may downgrade the
    /// connection to plain 9P2000.
    pub fn new(mut transport: T, max_msize: u32, dotu: bool) -> Result<Self, Error> {
        let bufsize = max_msize.max(4096 + IOHDRSZ) as usize;
        let mut wbuf = Vec::with_capacity(bufsize);
        let mut rbuf = Vec::with_capacity(bufsize);

        let offered = if dotu { VERSION9PU } else { VERSION9P };
        transport::write_msg(
            &mut transport,
            &mut wbuf,
            &TaggedFcall {
                tag: crate::fcall::NOTAG,
                fcall: Fcall::Tversion(Tversion {
                    msize: bufsize as u32,
                    version: offered.into(),
                }),
            },
            false,
        )?;
        let response = transport::read_msg(&mut transport, &mut rbuf, bufsize, false)?;

        let (msize, dotu) = match response.fcall {
            Fcall::Rversion(rv) => match rv.version.as_str() {
                VERSION9PU if dotu => (rv.msize.min(bufsize as u32), true),
                VERSION9P => (rv.msize.min(bufsize as u32), false),
                _ => return Err(Error::VersionMismatch),
            },
            Fcall::Rerror(e) => return Err(Error::Remote(e)),
            _ => return Err(Error::InvalidResponse),
        };

        Ok(Client {
            msize,
            dotu,
            state: Mutex::new(ClientState {
                transport,
                rbuf,
                wbuf,
            }),
            fids: FidGenerator::new(),
            next_tag: AtomicU32::new(1),
        })
    }

    /// The negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Whether the connection speaks the dotu dialect
    pub fn dotu(&self) -> bool {
        self.dotu
    }

    /// Send a request and wait for the matching response
    fn fcall(&self, fcall: Fcall) -> Result<Fcall, Error> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) as u16;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ClientState {
            transport,
            rbuf,
            wbuf,
        } = &mut *state;
        transport::write_msg(transport, wbuf, &TaggedFcall { tag, fcall }, self.dotu)?;

        // Skip stale responses until the tag matches.
        loop {
            let response = transport::read_msg(transport, rbuf, self.msize as usize, self.dotu)?;
            if response.tag == tag {
                return Ok(response.fcall);
            }
        }
    }

    /// Attach to the filesystem tree `aname` as user `uname`
    pub fn attach(&self, uname: &str, aname: &str) -> Result<(Qid, u32), Error> {
        let fid = self.fids.next();
        match self.fcall(Fcall::Tattach(Tattach {
            fid,
            afid: NOFID,
            uname: uname.into(),
            aname: aname.into(),
            nuname: NOUID,
        }))? {
            Fcall::Rattach(rc) => Ok((rc.qid, fid)),
            Fcall::Rerror(e) => {
                self.fids.free(fid);
                Err(Error::Remote(e))
            }
            _ => {
                self.fids.free(fid);
                Err(Error::InvalidResponse)
            }
        }
    }

    /// Walk from `fid` through `wnames`, producing a new fid on complete
    /// success. A walk that stops early returns [`Error::IncompleteWalk`]
    /// with the number of elements that resolved; the new fid is not
    /// established in that case.
    pub fn walk<S: AsRef<str>>(&self, fid: u32, wnames: &[S]) -> Result<(Vec<Qid>, u32), Error> {
        let newfid = self.fids.next();
        let rc = match self.fcall(Fcall::Twalk(Twalk {
            fid,
            newfid,
            wnames: wnames.iter().map(|w| w.as_ref().to_string()).collect(),
        }))? {
            Fcall::Rwalk(rc) => {
                if rc.wqids.len() == wnames.len() {
                    return Ok((rc.wqids, newfid));
                }
                Err(Error::IncompleteWalk(rc.wqids.len()))
            }
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        };
        self.fids.free(newfid);
        rc
    }

    /// Clone a fid (walk with no names)
    pub fn clone_fid(&self, fid: u32) -> Result<u32, Error> {
        let empty: [&str; 0] = [];
        let (_, newfid) = self.walk(fid, &empty)?;
        Ok(newfid)
    }

    /// Open a fid
    pub fn open(&self, fid: u32, mode: u8) -> Result<Qid, Error> {
        match self.fcall(Fcall::Topen(Topen { fid, mode }))? {
            Fcall::Ropen(rc) => Ok(rc.qid),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Create `name` in the directory `fid` refers to; the fid moves to the
    /// new object and is open afterwards.
    pub fn create(
        &self,
        fid: u32,
        name: &str,
        perm: Perm,
        mode: u8,
        ext: &str,
    ) -> Result<Qid, Error> {
        match self.fcall(Fcall::Tcreate(Tcreate {
            fid,
            name: name.into(),
            perm,
            mode,
            ext: ext.into(),
        }))? {
            Fcall::Rcreate(rc) => Ok(rc.qid),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Read from an open fid
    pub fn read(&self, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let count = (buf.len() as u32).min(self.msize - IOHDRSZ);
        match self.fcall(Fcall::Tread(Tread { fid, offset, count }))? {
            Fcall::Rread(rc) => {
                let n = rc.data.len().min(buf.len());
                buf[..n].copy_from_slice(&rc.data[..n]);
                Ok(n)
            }
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Write to an open fid
    pub fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<usize, Error> {
        let count = (data.len() as u32).min(self.msize - IOHDRSZ) as usize;
        match self.fcall(Fcall::Twrite(Twrite {
            fid,
            offset,
            data: data[..count].to_vec(),
        }))? {
            Fcall::Rwrite(rc) => Ok(rc.count as usize),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Read a whole directory, parsing the packed records from successive
    /// reads until the server reports end of directory.
    pub fn read_dir(&self, fid: u32) -> Result<Vec<Dir>, Error> {
        let mut entries = Vec::new();
        let mut buf = vec![0u8; (self.msize - IOHDRSZ) as usize];
        let mut offset = 0u64;
        loop {
            let n = self.read(fid, offset, &mut buf)?;
            if n == 0 {
                break;
            }
            entries.extend(decode_dir_entries(&buf[..n], self.dotu)?);
            offset += n as u64;
        }
        Ok(entries)
    }

    /// Stat the object a fid refers to
    pub fn stat(&self, fid: u32) -> Result<Dir, Error> {
        match self.fcall(Fcall::Tstat(Tstat { fid }))? {
            Fcall::Rstat(rc) => Ok(rc.stat),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Update metadata; untouched fields must hold their sentinels (start
    /// from [`Dir::no_change`]).
    pub fn wstat(&self, fid: u32, stat: &Dir) -> Result<(), Error> {
        match self.fcall(Fcall::Twstat(Twstat {
            fid,
            stat: stat.clone(),
        }))? {
            Fcall::Rwstat(_) => Ok(()),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Clunk (release) a fid
    pub fn clunk(&self, fid: u32) -> Result<(), Error> {
        let rc = match self.fcall(Fcall::Tclunk(Tclunk { fid }))? {
            Fcall::Rclunk(_) => Ok(()),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        };
        self.fids.free(fid);
        rc
    }

    /// Remove the object a fid refers to; the fid is clunked either way
    pub fn remove(&self, fid: u32) -> Result<(), Error> {
        let rc = match self.fcall(Fcall::Tremove(Tremove { fid }))? {
            Fcall::Rremove(_) => Ok(()),
            Fcall::Rerror(e) => Err(Error::Remote(e)),
            _ => Err(Error::InvalidResponse),
        };
        self.fids.free(fid);
        rc
    }

    /// The raw error reply, if this is a remote error
    pub fn remote_err(err: &Error) -> Option<&Rerror> {
        match err {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }
}
