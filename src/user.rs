// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host user/group identity pool
//!
//! Stat marshalling needs owner and group names for every directory entry,
//! so lookups against the host passwd/group databases are memoized. The
//! pool never fails: an id with no database entry resolves to an empty name
//! and callers substitute their own placeholder.

use std::collections::HashMap;
use std::sync::Mutex;

use nix::unistd;

/// A host user as seen by the 9P layer
#[derive(Clone, Debug)]
pub struct User {
    pub id: u32,
    pub name: String,
}

/// A host group as seen by the 9P layer
#[derive(Clone, Debug)]
pub struct Group {
    pub id: u32,
    pub name: String,
}

/// Memoized uid/gid resolution against the host account databases
#[derive(Debug, Default)]
pub struct Users {
    users: Mutex<HashMap<u32, User>>,
    groups: Mutex<HashMap<u32, Group>>,
}

impl Users {
    pub fn new() -> Users {
        Users::default()
    }

    /// Resolve a uid. Unknown ids yield an empty name.
    pub fn uid2user(&self, uid: u32) -> User {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users
            .entry(uid)
            .or_insert_with(|| {
                let name = unistd::User::from_uid(unistd::Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|u| u.name)
                    .unwrap_or_default();
                User { id: uid, name }
            })
            .clone()
    }

    /// Resolve a gid. Unknown ids yield an empty name.
    pub fn gid2group(&self, gid: u32) -> Group {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(gid)
            .or_insert_with(|| {
                let name = unistd::Group::from_gid(unistd::Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|g| g.name)
                    .unwrap_or_default();
                Group { id: gid, name }
            })
            .clone()
    }
}

/// Resolve a user name to its uid via the passwd database.
pub fn uname2uid(name: &str) -> Option<u32> {
    unistd::User::from_name(name)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw())
}

/// Resolve a group name to its gid via the group database.
pub fn gname2gid(name: &str) -> Option<u32> {
    unistd::Group::from_name(name)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
}
