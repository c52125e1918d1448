// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 9P server skeleton
//!
//! This module owns everything below the filesystem adapter: the listening
//! socket, per-connection framing, version negotiation, the fid table, and
//! request dispatch. Adapters implement [`FileServer`] with one method per
//! T-message; each handler returns either the matching R-message payload or
//! an [`Rerror`], and the dispatch loop sends exactly one reply per request.
//!
//! Requests on a connection are processed sequentially in arrival order,
//! which gives every fid a total order of operations. `Tflush` consequently
//! never finds an in-flight request to cancel and is acknowledged
//! immediately.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::fcall::{
    Dir, Fcall, IOHDRSZ, MAXWELEM, Rattach, Rclunk, Rcreate, Rerror, Rflush, Ropen, Rread,
    Rremove, Rstat, Rversion, Rwalk, Rwrite, Rwstat, Tattach, TaggedFcall, Tcreate,
    VERSION9P, VERSION9PU,
};
use crate::transport;
use crate::user::Users;

/// Default maximum message size offered to clients
const MSIZE: u32 = 8192 + IOHDRSZ;

/// Server configuration
///
/// The launcher mutates these fields before the server starts; they are
/// shared read-only between connections afterwards.
#[derive(Clone, Debug)]
pub struct SrvConfig {
    /// Accept the 9P2000.u dialect when a client offers it
    pub dotu: bool,
    /// Debug level; greater than 0 logs every message
    pub debug: u32,
    /// Server identity used in log messages
    pub id: String,
}

impl Default for SrvConfig {
    fn default() -> SrvConfig {
        SrvConfig {
            dotu: true,
            debug: 0,
            id: "ufs".into(),
        }
    }
}

/// A fid table slot: the client-chosen fid number, the open-mode byte once
/// the fid has been opened, and the adapter's per-fid state.
#[derive(Debug)]
pub struct SrvFid<A> {
    pub fid: u32,
    pub omode: Option<u8>,
    pub aux: A,
}

/// Connection context passed to every handler
pub struct ConnCtx<'a, A> {
    /// Negotiated dialect
    pub dotu: bool,
    /// Negotiated maximum message size
    pub msize: u32,
    /// Identity pool for stat marshalling
    pub upool: &'a Users,
    fids: &'a HashMap<u32, SrvFid<A>>,
}

impl<A> ConnCtx<'_, A> {
    /// Look up another live fid on the same connection (the fid the current
    /// request operates on is not visible here).
    pub fn fid(&self, fid: u32) -> Option<&SrvFid<A>> {
        self.fids.get(&fid)
    }
}

/// A 9P file server implementation
///
/// One method per T-message. The skeleton performs fid-table bookkeeping
/// and protocol-level validation (unknown fids, double opens, count
/// clamping) before a handler runs, so handlers only implement filesystem
/// semantics.
pub trait FileServer: Send + Sync + 'static {
    /// Per-fid adapter state, created when a fid enters the table
    type Fid: Default + Send + 'static;

    fn attach(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        tc: &Tattach,
    ) -> Result<Rattach, Rerror>;

    /// `newfid` is a fresh slot; it enters the fid table only if the walk
    /// completes for every name.
    fn walk(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        newfid: &mut SrvFid<Self::Fid>,
        wnames: &[String],
    ) -> Result<Rwalk, Rerror>;

    fn open(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        mode: u8,
    ) -> Result<Ropen, Rerror>;

    fn create(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        tc: &Tcreate,
    ) -> Result<Rcreate, Rerror>;

    fn read(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        offset: u64,
        count: u32,
    ) -> Result<Rread, Rerror>;

    fn write(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        offset: u64,
        data: &[u8],
    ) -> Result<Rwrite, Rerror>;

    /// The fid is removed from the table and destroyed after this returns,
    /// whatever the outcome.
    fn clunk(
        &self,
        _ctx: &ConnCtx<'_, Self::Fid>,
        _fid: &mut SrvFid<Self::Fid>,
    ) -> Result<(), Rerror> {
        Ok(())
    }

    /// As with clunk, the fid is gone afterwards even if the remove failed.
    fn remove(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
    ) -> Result<(), Rerror>;

    fn stat(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
    ) -> Result<Rstat, Rerror>;

    fn wstat(
        &self,
        ctx: &ConnCtx<'_, Self::Fid>,
        fid: &mut SrvFid<Self::Fid>,
        stat: &Dir,
    ) -> Result<(), Rerror>;

    /// Cancellation hint. Host filesystem calls cannot be interrupted, so
    /// the default does nothing; the skeleton acknowledges with `Rflush`.
    fn flush(&self, _ctx: &ConnCtx<'_, Self::Fid>, _oldtag: u16) {}

    /// Invoked when a fid leaves the table: clunk, remove, version reset,
    /// or connection teardown. The sole place open handles are released.
    fn fid_destroy(&self, _fid: SrvFid<Self::Fid>) {}
}

/// The server: shared adapter, configuration, and identity pool
pub struct Srv<S: FileServer> {
    ops: Arc<S>,
    config: Arc<SrvConfig>,
    upool: Arc<Users>,
}

impl<S: FileServer> Srv<S> {
    pub fn new(ops: S, config: SrvConfig) -> Srv<S> {
        Srv {
            ops: Arc::new(ops),
            config: Arc::new(config),
            upool: Arc::new(Users::new()),
        }
    }

    /// Bind a TCP listener without starting to serve. Useful when the
    /// caller needs the bound address (e.g. an ephemeral test port).
    pub fn bind(&self, addr: &str) -> io::Result<SrvListener<S>> {
        Ok(SrvListener {
            listener: TcpListener::bind(addr)?,
            ops: self.ops.clone(),
            config: self.config.clone(),
            upool: self.upool.clone(),
        })
    }

    /// Listen on `addr` and serve forever. Only the "tcp" network type is
    /// supported.
    pub fn start_net_listener(&self, proto: &str, addr: &str) -> io::Result<()> {
        if proto != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network type: {proto}"),
            ));
        }
        self.bind(addr)?.serve()
    }
}

/// A bound listener; `serve` accepts connections until an accept error
pub struct SrvListener<S: FileServer> {
    listener: TcpListener,
    ops: Arc<S>,
    config: Arc<SrvConfig>,
    upool: Arc<Users>,
}

impl<S: FileServer> SrvListener<S> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one thread per connection.
    pub fn serve(&self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = stream?;
            let conn = Conn::new(
                stream,
                self.ops.clone(),
                self.config.clone(),
                self.upool.clone(),
            );
            thread::spawn(move || conn.run());
        }
        Ok(())
    }
}

/// Per-connection state and request loop
struct Conn<S: FileServer> {
    stream: TcpStream,
    ops: Arc<S>,
    config: Arc<SrvConfig>,
    upool: Arc<Users>,
    msize: u32,
    dotu: bool,
    fids: HashMap<u32, SrvFid<S::Fid>>,
}

impl<S: FileServer> Conn<S> {
    fn new(stream: TcpStream, ops: Arc<S>, config: Arc<SrvConfig>, upool: Arc<Users>) -> Conn<S> {
        Conn {
            stream,
            ops,
            config,
            upool,
            msize: MSIZE,
            dotu: false,
            fids: HashMap::new(),
        }
    }

    fn run(mut self) {
        if self.config.debug > 0 {
            debug!(id = %self.config.id, "connected");
        }

        let mut rbuf = Vec::with_capacity(MSIZE as usize);
        let mut wbuf = Vec::with_capacity(MSIZE as usize);
        loop {
            let msg = match transport::read_msg(
                &mut self.stream,
                &mut rbuf,
                self.msize as usize,
                self.dotu,
            ) {
                Ok(msg) => msg,
                Err(_) => break,
            };
            if self.config.debug > 0 {
                debug!(id = %self.config.id, tag = msg.tag, fcall = ?msg.fcall, "request");
            }

            let reply = self.process(msg);
            if self.config.debug > 0 {
                debug!(id = %self.config.id, tag = reply.tag, fcall = ?reply.fcall, "reply");
            }
            if transport::write_msg(&mut self.stream, &mut wbuf, &reply, self.dotu).is_err() {
                break;
            }
        }

        for (_, fid) in self.fids.drain() {
            self.ops.fid_destroy(fid);
        }
        if self.config.debug > 0 {
            debug!(id = %self.config.id, "disconnected");
        }
    }

    fn process(&mut self, msg: TaggedFcall) -> TaggedFcall {
        let tag = msg.tag;
        let fcall = match self.dispatch(msg.fcall) {
            Ok(fcall) => fcall,
            Err(err) => Fcall::Rerror(err),
        };
        TaggedFcall { tag, fcall }
    }

    fn dispatch(&mut self, fcall: Fcall) -> Result<Fcall, Rerror> {
        match fcall {
            Fcall::Tversion(tc) => {
                // A version request resets the connection.
                for (_, fid) in self.fids.drain() {
                    self.ops.fid_destroy(fid);
                }
                self.msize = tc.msize.min(MSIZE);
                let version = if self.config.dotu && tc.version == VERSION9PU {
                    self.dotu = true;
                    VERSION9PU
                } else if tc.version.starts_with(VERSION9P) {
                    self.dotu = false;
                    VERSION9P
                } else {
                    "unknown"
                };
                Ok(Fcall::Rversion(Rversion {
                    msize: self.msize,
                    version: version.into(),
                }))
            }

            Fcall::Tauth(_) => Err(Rerror::enoauth()),

            Fcall::Tattach(tc) => {
                if self.fids.contains_key(&tc.fid) {
                    return Err(Rerror::einuse());
                }
                let mut fid = SrvFid {
                    fid: tc.fid,
                    omode: None,
                    aux: S::Fid::default(),
                };
                let rc = self.ops.attach(&self.ctx(), &mut fid, &tc)?;
                self.fids.insert(tc.fid, fid);
                Ok(Fcall::Rattach(rc))
            }

            Fcall::Tflush(tc) => {
                self.ops.flush(&self.ctx(), tc.oldtag);
                Ok(Fcall::Rflush(Rflush {}))
            }

            Fcall::Twalk(tc) => {
                if tc.wnames.len() > MAXWELEM {
                    return Err(Rerror::new("too many walk elements", libc::EINVAL as u32));
                }
                let mut fid = self.fids.remove(&tc.fid).ok_or_else(Rerror::eunknownfid)?;
                if fid.omode.is_some() {
                    self.fids.insert(tc.fid, fid);
                    return Err(Rerror::ebaduse());
                }
                if tc.newfid != tc.fid && self.fids.contains_key(&tc.newfid) {
                    self.fids.insert(tc.fid, fid);
                    return Err(Rerror::einuse());
                }
                let mut newfid = SrvFid {
                    fid: tc.newfid,
                    omode: None,
                    aux: S::Fid::default(),
                };
                let rc = {
                    let ctx = self.ctx();
                    self.ops.walk(&ctx, &mut fid, &mut newfid, &tc.wnames)
                };
                match rc {
                    Ok(rc) => {
                        // Only a walk that consumed every name establishes
                        // newfid; on a partial walk it never existed.
                        if rc.wqids.len() == tc.wnames.len() {
                            if tc.newfid != tc.fid {
                                self.fids.insert(tc.fid, fid);
                            }
                            self.fids.insert(tc.newfid, newfid);
                        } else {
                            self.fids.insert(tc.fid, fid);
                        }
                        Ok(Fcall::Rwalk(rc))
                    }
                    Err(err) => {
                        self.fids.insert(tc.fid, fid);
                        Err(err)
                    }
                }
            }

            Fcall::Topen(tc) => self.with_fid(tc.fid, |ops, ctx, fid| {
                if fid.omode.is_some() {
                    return Err(Rerror::ebaduse());
                }
                let rc = ops.open(ctx, fid, tc.mode)?;
                fid.omode = Some(tc.mode);
                Ok(Fcall::Ropen(rc))
            }),

            Fcall::Tcreate(tc) => self.with_fid(tc.fid, |ops, ctx, fid| {
                if fid.omode.is_some() {
                    return Err(Rerror::ebaduse());
                }
                let rc = ops.create(ctx, fid, &tc)?;
                fid.omode = Some(tc.mode);
                Ok(Fcall::Rcreate(rc))
            }),

            Fcall::Tread(tc) => {
                let count = tc.count.min(self.msize - IOHDRSZ);
                self.with_fid(tc.fid, |ops, ctx, fid| {
                    if fid.omode.is_none() {
                        return Err(Rerror::ebaduse());
                    }
                    Ok(Fcall::Rread(ops.read(ctx, fid, tc.offset, count)?))
                })
            }

            Fcall::Twrite(tc) => {
                let count = (tc.data.len() as u32).min(self.msize - IOHDRSZ) as usize;
                self.with_fid(tc.fid, |ops, ctx, fid| {
                    if fid.omode.is_none() {
                        return Err(Rerror::ebaduse());
                    }
                    let rc = ops.write(ctx, fid, tc.offset, &tc.data[..count])?;
                    Ok(Fcall::Rwrite(rc))
                })
            }

            Fcall::Tclunk(tc) => {
                let mut fid = self.fids.remove(&tc.fid).ok_or_else(Rerror::eunknownfid)?;
                let rc = {
                    let ctx = self.ctx();
                    self.ops.clunk(&ctx, &mut fid)
                };
                self.ops.fid_destroy(fid);
                rc.map(|()| Fcall::Rclunk(Rclunk {}))
            }

            Fcall::Tremove(tc) => {
                // Remove always clunks, success or not.
                let mut fid = self.fids.remove(&tc.fid).ok_or_else(Rerror::eunknownfid)?;
                let rc = {
                    let ctx = self.ctx();
                    self.ops.remove(&ctx, &mut fid)
                };
                self.ops.fid_destroy(fid);
                rc.map(|()| Fcall::Rremove(Rremove {}))
            }

            Fcall::Tstat(tc) => {
                self.with_fid(tc.fid, |ops, ctx, fid| Ok(Fcall::Rstat(ops.stat(ctx, fid)?)))
            }

            Fcall::Twstat(tc) => self.with_fid(tc.fid, |ops, ctx, fid| {
                ops.wstat(ctx, fid, &tc.stat)?;
                Ok(Fcall::Rwstat(Rwstat {}))
            }),

            // R-messages from a client are a protocol violation.
            _ => Err(Rerror::new("invalid message", libc::EINVAL as u32)),
        }
    }

    fn ctx(&self) -> ConnCtx<'_, S::Fid> {
        ConnCtx {
            dotu: self.dotu,
            msize: self.msize,
            upool: &self.upool,
            fids: &self.fids,
        }
    }

    /// Run a handler against one fid, taking it out of the table for the
    /// duration so the context only exposes the other fids.
    fn with_fid<F>(&mut self, n: u32, f: F) -> Result<Fcall, Rerror>
    where
        F: FnOnce(&S, &ConnCtx<'_, S::Fid>, &mut SrvFid<S::Fid>) -> Result<Fcall, Rerror>,
    {
        let mut fid = self.fids.remove(&n).ok_or_else(Rerror::eunknownfid)?;
        let rc = {
            let ctx = ConnCtx {
                dotu: self.dotu,
                msize: self.msize,
                upool: &self.upool,
                fids: &self.fids,
            };
            f(&self.ops, &ctx, &mut fid)
        };
        self.fids.insert(n, fid);
        rc
    }
}
