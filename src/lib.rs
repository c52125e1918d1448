// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A 9P file server for the host filesystem
//!
//! This crate implements a server for the 9P2000 protocol and its
//! 9P2000.u ("dotu") Unix extension, exposing a subtree of the host
//! filesystem to 9P clients. The server is a thin, faithful bridge: every
//! request is translated into the corresponding host syscall and the host's
//! semantics (permissions, errors, concurrent modification) show through.
//!
//! # Submodules
//!
//! - [`fcall`] - Protocol message definitions and encoding/decoding
//! - [`srv`] - Connection handling, fid bookkeeping, and request dispatch
//! - [`ufs`] - The host-filesystem adapter served by [`srv`]
//! - [`user`] - Host user/group identity pool
//! - [`client`] - A matching synchronous 9P client
//!
//! # Example
//!
//! ```no_run
//! use ninefs::srv::{Srv, SrvConfig};
//! use ninefs::ufs::Ufs;
//!
//! let config = SrvConfig {
//!     dotu: true,
//!     debug: 0,
//!     id: "ufs".into(),
//! };
//! let srv = Srv::new(Ufs::new("/srv/export"), config);
//! srv.start_net_listener("tcp", "127.0.0.1:5640").unwrap();
//! ```

use thiserror::Error as ThisError;

pub mod client;
pub mod fcall;
pub mod srv;
pub mod ufs;
pub mod user;

mod transport;

/// Error type for 9P transport and client operations
#[derive(Debug, ThisError)]
pub enum Error {
    /// I/O error on the underlying transport
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Malformed protocol message
    #[error("invalid message")]
    InvalidMessage,

    /// Syntactically valid but unexpected response
    #[error("invalid response from server")]
    InvalidResponse,

    /// The peer does not speak a protocol version we support
    #[error("unsupported protocol version")]
    VersionMismatch,

    /// A walk stopped before resolving every name; the payload is the
    /// number of elements that did resolve
    #[error("walk stopped after {0} elements")]
    IncompleteWalk(usize),

    /// Error reply from the remote server
    #[error("remote error: {0}")]
    Remote(fcall::Rerror),
}
