// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host-filesystem adapter
//!
//! [`Ufs`] implements [`FileServer`] by translating each 9P request into
//! the corresponding host syscall. It keeps no cache and takes no locks:
//! every handler begins by re-statting the fid's path, because other
//! clients (or the kernel) may have changed the file since the previous
//! request, and the host's own semantics are allowed to show through.
//!
//! Walk names are spliced onto the fid's path without canonicalization;
//! this is a bridge to the host tree, not a chroot.

use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{
    DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt, symlink,
};
use std::path::Path;

use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use nix::unistd::{Gid, Uid, chown, truncate};

use crate::fcall::{
    Dir, NOFID, NOUID, OREAD, ORDWR, OTRUNC, OWRITE, Perm, Qid, QidType, Rattach, Rcreate,
    Rerror, Ropen, Rread, Rstat, Rwalk, Rwrite, Tattach, Tcreate,
};
use crate::srv::{ConnCtx, FileServer, SrvFid};
use crate::user::{self, Users};

/// How many directory entries to pull from the host per batch
const DIR_BATCH: usize = 16;

/// The host-filesystem file server
pub struct Ufs {
    root: String,
}

impl Ufs {
    /// Serve the tree rooted at `root`.
    pub fn new(root: impl Into<String>) -> Ufs {
        Ufs { root: root.into() }
    }
}

/// Per-fid state: the resolved host path, the open handle if the fid has
/// been opened, and the directory-read cursor.
#[derive(Debug, Default)]
pub struct UfsFid {
    path: String,
    file: Option<File>,
    dirs: Option<DirReader>,
}

impl UfsFid {
    /// Every handler starts here: metadata cached from an earlier request
    /// is never trusted, other clients may have changed the file.
    fn restat(&self) -> Result<Metadata, Rerror> {
        fs::symlink_metadata(&self.path).map_err(Rerror::from)
    }
}

/// Directory stream state: the host read position plus a batch of entries
/// not yet packed into a reply.
#[derive(Debug)]
struct DirReader {
    stream: fs::ReadDir,
    batch: Vec<(String, Metadata)>,
    next: usize,
}

impl DirReader {
    fn open(path: &str) -> Result<DirReader, Rerror> {
        Ok(DirReader {
            stream: fs::read_dir(path).map_err(Rerror::from)?,
            batch: Vec::new(),
            next: 0,
        })
    }

    /// Refill the batch with up to [`DIR_BATCH`] entries; an empty batch
    /// afterwards means the directory is exhausted.
    fn fill(&mut self) -> Result<(), Rerror> {
        self.batch.clear();
        self.next = 0;
        for _ in 0..DIR_BATCH {
            match self.stream.next() {
                Some(Ok(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let md = entry.metadata().map_err(Rerror::from)?;
                    self.batch.push((name, md));
                }
                Some(Err(err)) => return Err(Rerror::from(err)),
                None => break,
            }
        }
        Ok(())
    }
}

/// Translate a 9P open-mode byte into host open options. The low two bits
/// select the access mode; the execute hint has no host analog and is
/// treated as read.
fn omode_to_options(mode: u8) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match mode & 3 {
        OREAD => opts.read(true),
        OWRITE => opts.write(true),
        ORDWR => opts.read(true).write(true),
        _ => opts.read(true), // OEXEC
    };
    if mode & OTRUNC != 0 {
        opts.truncate(true);
    }
    opts
}

fn qid_type(md: &Metadata) -> QidType {
    let mut typ = QidType::FILE;
    if md.is_dir() {
        typ |= QidType::DIR;
    }
    if md.file_type().is_symlink() {
        typ |= QidType::SYMLINK;
    }
    typ
}

/// Qid for a host object: path is the inode number, version the
/// modification time in milliseconds.
pub(crate) fn metadata_to_qid(md: &Metadata) -> Qid {
    let mtime_nanos = md.mtime() * 1_000_000_000 + md.mtime_nsec();
    Qid {
        typ: qid_type(md),
        version: (mtime_nanos / 1_000_000) as u32,
        path: md.ino(),
    }
}

/// 9P mode bits for a host object. The base dialect carries only the
/// permission bits and `DMDIR`; dotu adds the special-file and set-id bits.
pub(crate) fn metadata_to_mode(md: &Metadata, dotu: bool) -> u32 {
    let mut ret = md.mode() & 0o777;
    if md.is_dir() {
        ret |= Perm::DMDIR.bits();
    }
    if dotu {
        let ft = md.file_type();
        if ft.is_symlink() {
            ret |= Perm::DMSYMLINK.bits();
        }
        if ft.is_socket() {
            ret |= Perm::DMSOCKET.bits();
        }
        if ft.is_fifo() {
            ret |= Perm::DMNAMEDPIPE.bits();
        }
        if ft.is_block_device() || ft.is_char_device() {
            ret |= Perm::DMDEVICE.bits();
        }
        if md.mode() & libc::S_ISUID as u32 != 0 {
            ret |= Perm::DMSETUID.bits();
        }
        if md.mode() & libc::S_ISGID as u32 != 0 {
            ret |= Perm::DMSETGID.bits();
        }
    }
    ret
}

/// Extension string for special files (dotu): the symlink target, or
/// `"b MAJOR MINOR"` / `"c MAJOR MINOR"` for devices.
fn special_ext(path: &str, md: &Metadata) -> String {
    let ft = md.file_type();
    if ft.is_symlink() {
        fs::read_link(path)
            .map(|t| t.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else if ft.is_block_device() {
        format!("b {} {}", md.rdev() >> 24, md.rdev() & 0xFF_FFFF)
    } else if ft.is_char_device() {
        format!("c {} {}", md.rdev() >> 24, md.rdev() & 0xFF_FFFF)
    } else {
        String::new()
    }
}

/// Marshal host metadata into a `Dir` record.
///
/// The modifier is unknown on host filesystems, so `muid` is always
/// `"none"`. In the base dialect owner and group fall back to the decimal
/// id when the account database has no name for them; in dotu the name
/// falls back to `"none"` and the raw ids ride along in the numeric fields.
pub(crate) fn metadata_to_dir(path: &str, md: &Metadata, dotu: bool, upool: &Users) -> Dir {
    let name = match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    };
    let u = upool.uid2user(md.uid());
    let g = upool.gid2group(md.gid());

    let mut dir = Dir {
        qid: metadata_to_qid(md),
        mode: metadata_to_mode(md, dotu),
        atime: md.atime() as u32,
        mtime: md.mtime() as u32,
        length: md.len(),
        name: name.to_string(),
        muid: "none".into(),
        ..Dir::default()
    };
    if dotu {
        dir.uid = if u.name.is_empty() { "none".into() } else { u.name };
        dir.gid = if g.name.is_empty() { "none".into() } else { g.name };
        dir.uidnum = md.uid();
        dir.gidnum = md.gid();
        dir.muidnum = NOUID;
        dir.ext = special_ext(path, md);
    } else {
        dir.uid = if u.name.is_empty() {
            md.uid().to_string()
        } else {
            u.name
        };
        dir.gid = if g.name.is_empty() {
            md.gid().to_string()
        } else {
            g.name
        };
    }
    dir
}

impl FileServer for Ufs {
    type Fid = UfsFid;

    fn attach(
        &self,
        _ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        tc: &Tattach,
    ) -> Result<Rattach, Rerror> {
        if tc.afid != NOFID {
            return Err(Rerror::enoauth());
        }
        fid.aux.path = if tc.aname.is_empty() {
            self.root.clone()
        } else {
            tc.aname.clone()
        };
        let st = fid.aux.restat()?;
        Ok(Rattach {
            qid: metadata_to_qid(&st),
        })
    }

    fn walk(
        &self,
        _ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        newfid: &mut SrvFid<UfsFid>,
        wnames: &[String],
    ) -> Result<Rwalk, Rerror> {
        fid.aux.restat()?;

        let mut path = fid.aux.path.clone();
        let mut wqids = Vec::with_capacity(wnames.len());
        for (i, w) in wnames.iter().enumerate() {
            let p = format!("{path}/{w}");
            match fs::symlink_metadata(&p) {
                Ok(st) => {
                    wqids.push(metadata_to_qid(&st));
                    path = p;
                }
                // A missing first element is an error; a later one ends the
                // walk early with the qids gathered so far.
                Err(_) if i == 0 => return Err(Rerror::enoent()),
                Err(_) => break,
            }
        }
        newfid.aux.path = path;
        Ok(Rwalk { wqids })
    }

    fn open(
        &self,
        _ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        mode: u8,
    ) -> Result<Ropen, Rerror> {
        let st = fid.aux.restat()?;
        let file = omode_to_options(mode)
            .open(&fid.aux.path)
            .map_err(Rerror::from)?;
        fid.aux.file = Some(file);
        Ok(Ropen {
            qid: metadata_to_qid(&st),
            iounit: 0,
        })
    }

    fn create(
        &self,
        ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        tc: &Tcreate,
    ) -> Result<Rcreate, Rerror> {
        fid.aux.restat()?;

        let path = format!("{}/{}", fid.aux.path, tc.name);
        let mut file = None;
        if tc.perm.contains(Perm::DMDIR) {
            fs::DirBuilder::new()
                .mode(tc.perm.bits() & 0o777)
                .create(&path)
                .map_err(Rerror::from)?;
        } else if tc.perm.contains(Perm::DMSYMLINK) {
            symlink(&tc.ext, &path).map_err(Rerror::from)?;
        } else if tc.perm.contains(Perm::DMLINK) {
            // ext names the fid of the link target, in decimal.
            let n: u32 = tc.ext.parse().map_err(|_| Rerror::eunknownfid())?;
            let ofid = ctx.fid(n).ok_or_else(Rerror::eunknownfid)?;
            fs::hard_link(&ofid.aux.path, &path).map_err(Rerror::from)?;
        } else if tc.perm.intersects(Perm::DMNAMEDPIPE | Perm::DMDEVICE) {
            return Err(Rerror::new("not implemented", libc::EIO as u32));
        } else {
            let mut mode = tc.perm.bits() & 0o777;
            if ctx.dotu {
                if tc.perm.contains(Perm::DMSETUID) {
                    mode |= libc::S_ISUID as u32;
                }
                if tc.perm.contains(Perm::DMSETGID) {
                    mode |= libc::S_ISGID as u32;
                }
            }
            let mut opts = omode_to_options(tc.mode);
            opts.create(true).mode(mode);
            file = Some(opts.open(&path).map_err(Rerror::from)?);
        }

        // Directories, symlinks and hard links were created without a
        // handle; the fid still has to end up open.
        if file.is_none() {
            file = Some(
                omode_to_options(tc.mode)
                    .open(&path)
                    .map_err(Rerror::from)?,
            );
        }

        fid.aux.file = file;
        fid.aux.path = path;
        let st = fid.aux.restat()?;
        Ok(Rcreate {
            qid: metadata_to_qid(&st),
            iounit: 0,
        })
    }

    fn read(
        &self,
        ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        offset: u64,
        count: u32,
    ) -> Result<Rread, Rerror> {
        let st = fid.aux.restat()?;

        if !st.is_dir() {
            let file = fid.aux.file.as_ref().ok_or_else(Rerror::ebaduse)?;
            let mut data = vec![0u8; count as usize];
            let n = file.read_at(&mut data, offset).map_err(Rerror::from)?;
            data.truncate(n);
            return Ok(Rread { data });
        }

        // Directory read. Offset zero means the client is starting over:
        // reopen the directory and discard any cursor state. Otherwise
        // continue where the previous read stopped.
        let mut cursor = match fid.aux.dirs.take() {
            Some(cursor) if offset != 0 => cursor,
            _ => DirReader::open(&fid.aux.path)?,
        };

        let max = count as usize;
        let mut data = Vec::with_capacity(max);
        'outer: loop {
            if cursor.next >= cursor.batch.len() {
                cursor.fill()?;
                if cursor.batch.is_empty() {
                    break; // end of directory
                }
            }
            while cursor.next < cursor.batch.len() {
                let (name, md) = &cursor.batch[cursor.next];
                let path = format!("{}/{}", fid.aux.path, name);
                let d = metadata_to_dir(&path, md, ctx.dotu, ctx.upool);
                if data.len() + d.wire_len(ctx.dotu) > max {
                    // Never split an entry; keep it for the next read.
                    break 'outer;
                }
                d.encode(&mut data, ctx.dotu);
                cursor.next += 1;
            }
        }
        fid.aux.dirs = Some(cursor);
        Ok(Rread { data })
    }

    fn write(
        &self,
        _ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        offset: u64,
        data: &[u8],
    ) -> Result<Rwrite, Rerror> {
        fid.aux.restat()?;
        let file = fid.aux.file.as_ref().ok_or_else(Rerror::ebaduse)?;
        let n = file.write_at(data, offset).map_err(Rerror::from)?;
        Ok(Rwrite { count: n as u32 })
    }

    fn remove(
        &self,
        _ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
    ) -> Result<(), Rerror> {
        let st = fid.aux.restat()?;
        let rc = if st.is_dir() {
            fs::remove_dir(&fid.aux.path)
        } else {
            fs::remove_file(&fid.aux.path)
        };
        rc.map_err(Rerror::from)
    }

    fn stat(
        &self,
        ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
    ) -> Result<Rstat, Rerror> {
        let st = fid.aux.restat()?;
        Ok(Rstat {
            stat: metadata_to_dir(&fid.aux.path, &st, ctx.dotu, ctx.upool),
        })
    }

    fn wstat(
        &self,
        ctx: &ConnCtx<'_, UfsFid>,
        fid: &mut SrvFid<UfsFid>,
        dir: &Dir,
    ) -> Result<(), Rerror> {
        fid.aux.restat()?;

        // Every field uses a "don't touch" sentinel. The steps below are
        // applied in order and are not rolled back on a later failure; the
        // client sees whatever partial effects happened.
        if dir.mode != !0 {
            let mut mode = dir.mode & 0o777;
            if ctx.dotu {
                if dir.mode & Perm::DMSETUID.bits() != 0 {
                    mode |= libc::S_ISUID as u32;
                }
                if dir.mode & Perm::DMSETGID.bits() != 0 {
                    mode |= libc::S_ISGID as u32;
                }
            }
            fs::set_permissions(&fid.aux.path, fs::Permissions::from_mode(mode))
                .map_err(Rerror::from)?;
        }

        let mut uid = NOUID;
        let mut gid = NOUID;
        if ctx.dotu {
            uid = dir.uidnum;
            gid = dir.gidnum;
        } else {
            if !dir.uid.is_empty() {
                uid = user::uname2uid(&dir.uid)
                    .ok_or_else(|| Rerror::new("unknown user", libc::EINVAL as u32))?;
            }
            if !dir.gid.is_empty() {
                gid = user::gname2gid(&dir.gid)
                    .ok_or_else(|| Rerror::new("unknown group", libc::EINVAL as u32))?;
            }
        }
        if uid != NOUID || gid != NOUID {
            chown(
                Path::new(&fid.aux.path),
                (uid != NOUID).then(|| Uid::from_raw(uid)),
                (gid != NOUID).then(|| Gid::from_raw(gid)),
            )
            .map_err(Rerror::from)?;
        }

        if !dir.name.is_empty() {
            let parent = match fid.aux.path.rfind('/') {
                Some(i) => &fid.aux.path[..i],
                None => "",
            };
            let newpath = format!("{parent}/{}", dir.name);
            fs::rename(&fid.aux.path, &newpath).map_err(Rerror::from)?;
            fid.aux.path = newpath;
        }

        if dir.length != !0 {
            truncate(Path::new(&fid.aux.path), dir.length as i64).map_err(Rerror::from)?;
        }

        // The host sets both timestamps at once, so an untouched one is
        // filled in from the current stat.
        if dir.mtime != !0 || dir.atime != !0 {
            let mut atime = i64::from(dir.atime);
            let mut mtime = i64::from(dir.mtime);
            if dir.mtime == !0 || dir.atime == !0 {
                let st = fs::symlink_metadata(&fid.aux.path).map_err(Rerror::from)?;
                if dir.mtime == !0 {
                    mtime = st.mtime();
                }
                if dir.atime == !0 {
                    atime = st.atime();
                }
            }
            utimes(
                Path::new(&fid.aux.path),
                &TimeVal::new(atime, 0),
                &TimeVal::new(mtime, 0),
            )
            .map_err(Rerror::from)?;
        }

        Ok(())
    }

    fn fid_destroy(&self, mut fid: SrvFid<UfsFid>) {
        // Dropping the handles closes them; close errors are invisible to
        // a client that has already clunked.
        fid.aux.file.take();
        fid.aux.dirs.take();
    }
}
