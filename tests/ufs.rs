// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end tests: a real server on a loopback socket, exercised through
//! the crate's own client and verified against the host view of the tree.

use std::fs;
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
use std::path::Path;
use std::thread;

use ninefs::Error;
use ninefs::client::Client;
use ninefs::fcall::{
    Dir, Fcall, NOTAG, OREAD, ORDWR, OWRITE, Perm, QidType, Rerror, Tattach, Tauth, Tread,
    Tversion, TaggedFcall, VERSION9PU,
};
use ninefs::srv::{Srv, SrvConfig};
use ninefs::ufs::Ufs;

/// A server bound to an ephemeral loopback port, exporting a temp dir.
struct TestServer {
    export_dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
}

impl TestServer {
    fn start() -> TestServer {
        let export_dir = tempfile::tempdir().expect("failed to create temp dir");
        let srv = Srv::new(
            Ufs::new(export_dir.path().to_str().unwrap()),
            SrvConfig {
                dotu: true,
                debug: 0,
                id: "ufs-test".into(),
            },
        );
        let listener = srv.bind("127.0.0.1:0").expect("failed to bind");
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = listener.serve();
        });
        TestServer { export_dir, addr }
    }

    fn export_path(&self) -> &Path {
        self.export_dir.path()
    }

    fn connect(&self, dotu: bool) -> Client<TcpStream> {
        let stream = TcpStream::connect(self.addr).expect("failed to connect");
        Client::new(stream, 65536, dotu).expect("version negotiation failed")
    }
}

fn attach_root(client: &Client<TcpStream>) -> u32 {
    let (qid, fid) = client.attach("nobody", "").expect("attach failed");
    assert!(qid.typ.contains(QidType::DIR), "root qid should be a dir");
    fid
}

#[test]
fn test_attach_walk_open_read_clunk() {
    let server = TestServer::start();
    fs::create_dir(server.export_path().join("etc")).unwrap();
    fs::write(server.export_path().join("etc/hostname"), "ninep-host\n").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);

    let (wqids, fid) = client.walk(root, &["etc", "hostname"]).expect("walk failed");
    assert_eq!(wqids.len(), 2);
    assert!(wqids[0].typ.contains(QidType::DIR));
    assert_eq!(wqids[1].typ, QidType::FILE);

    let qid = client.open(fid, OREAD).expect("open failed");
    assert_eq!(qid.typ, QidType::FILE);

    let mut buf = vec![0u8; 4096];
    let n = client.read(fid, 0, &mut buf).expect("read failed");
    assert_eq!(&buf[..n], b"ninep-host\n");

    client.clunk(fid).expect("clunk failed");
    client.clunk(root).expect("clunk of root failed");
}

#[test]
fn test_read_large_file_across_messages() {
    let server = TestServer::start();
    let content: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
    fs::write(server.export_path().join("big"), &content).unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["big"]).unwrap();
    client.open(fid, OREAD).unwrap();

    // The negotiated msize is smaller than the file, so this takes several
    // positional reads.
    let mut got = Vec::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = client.read(fid, got.len() as u64, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert!(n <= (client.msize() as usize), "reply exceeds msize");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, content);
    client.clunk(fid).unwrap();
}

#[test]
fn test_write_through_to_host() {
    let server = TestServer::start();
    let client = server.connect(true);
    let root = attach_root(&client);

    let fid = client.clone_fid(root).unwrap();
    client
        .create(fid, "hello.txt", Perm::from_bits_retain(0o644), ORDWR, "")
        .expect("create failed");
    let n = client.write(fid, 0, b"Hello from 9P!").unwrap();
    assert_eq!(n, 14);
    client.clunk(fid).unwrap();

    let host_path = server.export_path().join("hello.txt");
    assert_eq!(fs::read_to_string(&host_path).unwrap(), "Hello from 9P!");
    assert_eq!(
        fs::metadata(&host_path).unwrap().permissions().mode() & 0o777,
        0o644
    );

    // Read it back through a fresh fid.
    let (_, fid) = client.walk(root, &["hello.txt"]).unwrap();
    client.open(fid, OREAD).unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(fid, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"Hello from 9P!");
    client.clunk(fid).unwrap();
}

#[test]
fn test_directory_streaming_yields_every_entry() {
    let server = TestServer::start();
    // Enough entries that the listing cannot fit in one reply.
    let mut names: Vec<String> = (0..200).map(|i| format!("entry_{i:04}_padding")).collect();
    for name in &names {
        fs::write(server.export_path().join(name), b"x").unwrap();
    }

    let client = server.connect(true);
    let root = attach_root(&client);
    let fid = client.clone_fid(root).unwrap();
    client.open(fid, OREAD).unwrap();

    let entries = client.read_dir(fid).expect("readdir failed");
    let mut got: Vec<String> = entries.iter().map(|d| d.name.clone()).collect();
    got.sort();
    names.sort();
    assert_eq!(got, names, "every entry exactly once, none split");

    // Offset zero starts the listing over.
    let again = client.read_dir(fid).expect("second readdir failed");
    assert_eq!(again.len(), names.len());

    client.clunk(fid).unwrap();
}

#[test]
fn test_dir_entries_are_well_formed() {
    let server = TestServer::start();
    fs::write(server.export_path().join("file"), b"0123456789").unwrap();
    fs::create_dir(server.export_path().join("subdir")).unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let fid = client.clone_fid(root).unwrap();
    client.open(fid, OREAD).unwrap();
    let entries = client.read_dir(fid).unwrap();
    client.clunk(fid).unwrap();

    let file = entries.iter().find(|d| d.name == "file").expect("missing file");
    assert_eq!(file.length, 10);
    assert_eq!(file.qid.typ, QidType::FILE);
    assert_eq!(file.muid, "none");

    let sub = entries.iter().find(|d| d.name == "subdir").expect("missing subdir");
    assert!(sub.qid.typ.contains(QidType::DIR));
    assert_ne!(sub.mode & Perm::DMDIR.bits(), 0);
}

#[test]
fn test_walk_to_missing_first_component() {
    let server = TestServer::start();
    let client = server.connect(true);
    let root = attach_root(&client);

    let err = client.walk(root, &["no_such_file"]).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "file not found");
    assert_eq!(e.ecode, libc::ENOENT as u32);
}

#[test]
fn test_partial_walk_stops_at_missing_component() {
    let server = TestServer::start();
    fs::create_dir(server.export_path().join("a")).unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);

    let err = client.walk(root, &["a", "missing", "c"]).unwrap_err();
    assert!(
        matches!(err, Error::IncompleteWalk(1)),
        "expected a one-element partial walk, got {err:?}"
    );
}

#[test]
fn test_create_directory_with_dmdir() {
    let server = TestServer::start();
    let client = server.connect(true);
    let root = attach_root(&client);

    let fid = client.clone_fid(root).unwrap();
    let qid = client
        .create(
            fid,
            "newdir",
            Perm::DMDIR | Perm::from_bits_retain(0o755),
            OREAD,
            "",
        )
        .expect("mkdir failed");
    assert!(qid.typ.contains(QidType::DIR));
    client.clunk(fid).unwrap();

    let md = fs::metadata(server.export_path().join("newdir")).unwrap();
    assert!(md.is_dir());
    assert_eq!(md.permissions().mode() & 0o777, 0o755);

    // Stat through the protocol agrees.
    let (_, fid) = client.walk(root, &["newdir"]).unwrap();
    let stat = client.stat(fid).unwrap();
    assert_ne!(stat.mode & Perm::DMDIR.bits(), 0);
    assert_eq!(stat.mode & 0o777, 0o755);
    assert_eq!(stat.name, "newdir");
    client.clunk(fid).unwrap();
}

#[test]
fn test_create_symlink_with_ext() {
    let server = TestServer::start();
    fs::write(server.export_path().join("target"), b"pointed at").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let fid = client.clone_fid(root).unwrap();
    client
        .create(fid, "link", Perm::DMSYMLINK, OREAD, "target")
        .expect("symlink create failed");
    client.clunk(fid).unwrap();

    let host_link = server.export_path().join("link");
    assert!(fs::symlink_metadata(&host_link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&host_link).unwrap(), Path::new("target"));

    // The stat reply carries the symlink bit and the target in ext.
    let (_, fid) = client.walk(root, &["link"]).unwrap();
    let stat = client.stat(fid).unwrap();
    assert!(stat.qid.typ.contains(QidType::SYMLINK));
    assert_ne!(stat.mode & Perm::DMSYMLINK.bits(), 0);
    assert_eq!(stat.ext, "target");
    client.clunk(fid).unwrap();
}

#[test]
fn test_create_named_pipe_is_not_implemented() {
    let server = TestServer::start();
    let client = server.connect(true);
    let root = attach_root(&client);

    let fid = client.clone_fid(root).unwrap();
    let err = client
        .create(
            fid,
            "fifo",
            Perm::DMNAMEDPIPE | Perm::from_bits_retain(0o644),
            OREAD,
            "",
        )
        .unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "not implemented");
    assert_eq!(e.ecode, libc::EIO as u32);
    client.clunk(fid).unwrap();
}

#[test]
fn test_wstat_rename_only() {
    let server = TestServer::start();
    fs::write(server.export_path().join("oldname"), b"contents").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["oldname"]).unwrap();

    let before = fs::metadata(server.export_path().join("oldname")).unwrap();

    let mut stat = Dir::no_change();
    stat.name = "newname".into();
    client.wstat(fid, &stat).expect("rename failed");

    assert!(!server.export_path().join("oldname").exists());
    let after_path = server.export_path().join("newname");
    assert_eq!(fs::read_to_string(&after_path).unwrap(), "contents");

    // Everything but the name is untouched.
    let after = fs::metadata(&after_path).unwrap();
    assert_eq!(after.permissions().mode(), before.permissions().mode());
    assert_eq!(after.mtime(), before.mtime());

    // The fid followed the rename.
    let stat = client.stat(fid).unwrap();
    assert_eq!(stat.name, "newname");
    client.clunk(fid).unwrap();
}

#[test]
fn test_wstat_all_sentinels_is_a_noop() {
    let server = TestServer::start();
    let path = server.export_path().join("keep");
    fs::write(&path, b"unchanged").unwrap();
    let before = fs::metadata(&path).unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["keep"]).unwrap();
    client.wstat(fid, &Dir::no_change()).expect("wstat failed");
    client.clunk(fid).unwrap();

    let after = fs::metadata(&path).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"unchanged");
    assert_eq!(after.len(), before.len());
    assert_eq!(after.mtime(), before.mtime());
    assert_eq!(after.permissions().mode(), before.permissions().mode());
}

#[test]
fn test_wstat_truncate() {
    let server = TestServer::start();
    let path = server.export_path().join("trunc");
    fs::write(&path, b"0123456789").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["trunc"]).unwrap();

    let mut stat = Dir::no_change();
    stat.length = 4;
    client.wstat(fid, &stat).expect("truncate failed");
    client.clunk(fid).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"0123");
}

#[test]
fn test_wstat_mode() {
    let server = TestServer::start();
    let path = server.export_path().join("chmod_me");
    fs::write(&path, b"x").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["chmod_me"]).unwrap();

    let mut stat = Dir::no_change();
    stat.mode = 0o600;
    client.wstat(fid, &stat).expect("chmod failed");
    client.clunk(fid).unwrap();

    assert_eq!(
        fs::metadata(&path).unwrap().permissions().mode() & 0o777,
        0o600
    );
}

#[test]
fn test_remove_file_and_clunked_fid() {
    let server = TestServer::start();
    fs::write(server.export_path().join("doomed"), b"x").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["doomed"]).unwrap();
    client.remove(fid).expect("remove failed");
    assert!(!server.export_path().join("doomed").exists());

    // Remove clunked the fid even though it succeeded; reusing it is an
    // unknown-fid error.
    let err = client.open(fid, OREAD).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "unknown fid");
}

#[test]
fn test_remove_failure_still_clunks() {
    let server = TestServer::start();
    let dir = server.export_path().join("occupied");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("tenant"), b"x").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["occupied"]).unwrap();

    // Removing a non-empty directory fails on the host...
    let err = client.remove(fid).unwrap_err();
    assert!(matches!(err, Error::Remote(_)), "got {err:?}");
    assert!(dir.exists());

    // ...but 9P semantics clunk the fid regardless.
    let err = client.open(fid, OREAD).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "unknown fid");
}

#[test]
fn test_double_open_is_rejected() {
    let server = TestServer::start();
    fs::write(server.export_path().join("f"), b"x").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["f"]).unwrap();
    client.open(fid, OREAD).unwrap();

    let err = client.open(fid, OREAD).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "bad use of fid");

    // So is walking an open fid.
    let err = client.walk(fid, &["anywhere"]).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "bad use of fid");
    client.clunk(fid).unwrap();
}

#[test]
fn test_attach_to_subtree() {
    let server = TestServer::start();
    let sub = server.export_path().join("deep");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("inner"), b"deep content").unwrap();

    let client = server.connect(true);
    let (qid, root) = client
        .attach("nobody", sub.to_str().unwrap())
        .expect("attach with aname failed");
    assert!(qid.typ.contains(QidType::DIR));

    let (_, fid) = client.walk(root, &["inner"]).unwrap();
    client.open(fid, OREAD).unwrap();
    let mut buf = [0u8; 32];
    let n = client.read(fid, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"deep content");
    client.clunk(fid).unwrap();
}

#[test]
fn test_base_dialect_stat_and_errors() {
    let server = TestServer::start();
    fs::write(server.export_path().join("plain"), b"abc").unwrap();
    symlink("plain", server.export_path().join("ln")).unwrap();

    let client = server.connect(false);
    assert!(!client.dotu());
    let root = attach_root(&client);

    let (_, fid) = client.walk(root, &["plain"]).unwrap();
    let stat = client.stat(fid).unwrap();
    assert_eq!(stat.name, "plain");
    assert_eq!(stat.length, 3);
    assert_eq!(stat.muid, "none");
    // Owner is a name when the account database knows the uid, otherwise
    // the decimal id; either way it is never empty.
    assert!(!stat.uid.is_empty());
    client.clunk(fid).unwrap();

    // Outside dotu the special-file mode bits are not reported.
    let (_, fid) = client.walk(root, &["ln"]).unwrap();
    let stat = client.stat(fid).unwrap();
    assert_eq!(stat.mode & Perm::DMSYMLINK.bits(), 0);
    assert!(stat.ext.is_empty());
    client.clunk(fid).unwrap();

    // Base-dialect error replies carry no errno on the wire; the client
    // fills in EIO.
    let err = client.walk(root, &["nope"]).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ename, "file not found");
    assert_eq!(e.ecode, libc::EIO as u32);
}

#[test]
fn test_qid_version_tracks_mtime_millis() {
    let server = TestServer::start();
    let path = server.export_path().join("stamped");
    fs::write(&path, b"v1").unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (wqids, fid) = client.walk(root, &["stamped"]).unwrap();

    let md = fs::metadata(&path).unwrap();
    let expect = (md.mtime() * 1_000_000_000 + md.mtime_nsec()) / 1_000_000;
    assert_eq!(wqids[0].version, expect as u32);
    assert_eq!(wqids[0].path, md.ino());
    client.clunk(fid).unwrap();
}

// ---------------------------------------------------------------------------
// Raw-protocol checks below bypass the client to exercise skeleton rules the
// client never violates on its own.
// ---------------------------------------------------------------------------

fn raw_rpc(stream: &mut TcpStream, msg: &TaggedFcall, dotu: bool) -> TaggedFcall {
    let mut buf = Vec::new();
    msg.encode_to_buf(&mut buf, dotu);
    stream.write_all(&buf).unwrap();

    let mut size = [0u8; 4];
    stream.read_exact(&mut size).unwrap();
    let mut frame = size.to_vec();
    frame.resize(u32::from_le_bytes(size) as usize, 0);
    stream.read_exact(&mut frame[4..]).unwrap();
    TaggedFcall::decode(&frame, dotu).unwrap()
}

fn raw_handshake(stream: &mut TcpStream) {
    let reply = raw_rpc(
        stream,
        &TaggedFcall {
            tag: NOTAG,
            fcall: Fcall::Tversion(Tversion {
                msize: 65536,
                version: VERSION9PU.into(),
            }),
        },
        true,
    );
    let Fcall::Rversion(rv) = reply.fcall else {
        panic!("expected Rversion, got {:?}", reply.fcall);
    };
    assert_eq!(rv.version, VERSION9PU);
}

fn expect_rerror(reply: TaggedFcall) -> Rerror {
    match reply.fcall {
        Fcall::Rerror(e) => e,
        other => panic!("expected Rerror, got {other:?}"),
    }
}

#[test]
fn test_version_negotiation() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();

    // An unrecognized version string earns "unknown".
    let reply = raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: NOTAG,
            fcall: Fcall::Tversion(Tversion {
                msize: 65536,
                version: "9P1999".into(),
            }),
        },
        false,
    );
    let Fcall::Rversion(rv) = reply.fcall else {
        panic!("expected Rversion");
    };
    assert_eq!(rv.version, "unknown");

    // A proper offer works on the same connection, clamped to the server's
    // maximum message size.
    raw_handshake(&mut stream);
}

#[test]
fn test_auth_is_refused() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    raw_handshake(&mut stream);

    let e = expect_rerror(raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: 1,
            fcall: Fcall::Tauth(Tauth {
                afid: 0,
                uname: "nobody".into(),
                aname: "".into(),
                nuname: ninefs::fcall::NOUID,
            }),
        },
        true,
    ));
    assert_eq!(e.ename, "no authentication required");
}

#[test]
fn test_attach_with_afid_is_refused() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    raw_handshake(&mut stream);

    let e = expect_rerror(raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: 1,
            fcall: Fcall::Tattach(Tattach {
                fid: 0,
                afid: 5, // an auth fid we never obtained
                uname: "nobody".into(),
                aname: "".into(),
                nuname: ninefs::fcall::NOUID,
            }),
        },
        true,
    ));
    assert_eq!(e.ename, "no authentication required");
}

#[test]
fn test_unknown_fid_and_unopened_read() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    raw_handshake(&mut stream);

    // Read on a fid that was never attached.
    let e = expect_rerror(raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: 1,
            fcall: Fcall::Tread(Tread {
                fid: 99,
                offset: 0,
                count: 128,
            }),
        },
        true,
    ));
    assert_eq!(e.ename, "unknown fid");

    // Attach, then read without opening.
    let reply = raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: 2,
            fcall: Fcall::Tattach(Tattach {
                fid: 0,
                afid: ninefs::fcall::NOFID,
                uname: "nobody".into(),
                aname: "".into(),
                nuname: ninefs::fcall::NOUID,
            }),
        },
        true,
    );
    assert!(matches!(reply.fcall, Fcall::Rattach(_)));

    let e = expect_rerror(raw_rpc(
        &mut stream,
        &TaggedFcall {
            tag: 3,
            fcall: Fcall::Tread(Tread {
                fid: 0,
                offset: 0,
                count: 128,
            }),
        },
        true,
    ));
    assert_eq!(e.ename, "bad use of fid");
}

#[test]
fn test_fid_in_use_on_attach() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    raw_handshake(&mut stream);

    let attach = |tag| TaggedFcall {
        tag,
        fcall: Fcall::Tattach(Tattach {
            fid: 7,
            afid: ninefs::fcall::NOFID,
            uname: "nobody".into(),
            aname: "".into(),
            nuname: ninefs::fcall::NOUID,
        }),
    };
    assert!(matches!(
        raw_rpc(&mut stream, &attach(1), true).fcall,
        Fcall::Rattach(_)
    ));
    let e = expect_rerror(raw_rpc(&mut stream, &attach(2), true));
    assert_eq!(e.ename, "fid already in use");
}

#[test]
fn test_open_write_on_readonly_mode_flows_host_error() {
    let server = TestServer::start();
    fs::write(server.export_path().join("ro"), b"x").unwrap();
    let mut perms = fs::metadata(server.export_path().join("ro"))
        .unwrap()
        .permissions();
    perms.set_mode(0o400);
    fs::set_permissions(server.export_path().join("ro"), perms).unwrap();

    let client = server.connect(true);
    let root = attach_root(&client);
    let (_, fid) = client.walk(root, &["ro"]).unwrap();

    // Skip when running as root, which bypasses permission checks.
    if nix::unistd::Uid::effective().is_root() {
        return;
    }
    let err = client.open(fid, OWRITE).unwrap_err();
    let Error::Remote(e) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(e.ecode, libc::EACCES as u32);
}
