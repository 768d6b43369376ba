//! User and group resolution for spawned processes.
//!
//! Services, exec checks, and interactive execs all share the same
//! normalization rules: names are resolved through the user database, a
//! name and a numeric ID given together must agree, and a user without a
//! resolvable group (or the converse) is refused.

use std::{collections::HashMap, io, path::PathBuf};

use nix::unistd::{Gid, Group, Uid, User};

/// Fully resolved identity applied to a child process before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Numeric user ID.
    pub uid: libc::uid_t,
    /// Numeric group ID.
    pub gid: libc::gid_t,
}

/// Normalizes the four optional user/group fields into a concrete identity.
///
/// Returns `Ok(None)` when nothing was specified, meaning the child inherits
/// the daemon's identity. A user name fills in the primary group when no
/// group was given; a bare numeric UID (or a bare group) is an error.
pub fn normalize_ids(
    user_id: Option<u32>,
    user: &str,
    group_id: Option<u32>,
    group: &str,
) -> io::Result<Option<Identity>> {
    if user_id.is_none() && user.is_empty() && group_id.is_none() && group.is_empty() {
        return Ok(None);
    }

    let mut uid = user_id;
    let mut gid = group_id;

    if !user.is_empty() {
        let entry = User::from_name(user)
            .map_err(|err| io::Error::other(err.to_string()))?
            .ok_or_else(|| io::Error::other(format!("user \"{user}\" not found")))?;
        let looked_up = entry.uid.as_raw();
        if let Some(requested) = user_id
            && requested != looked_up
        {
            return Err(io::Error::other(format!(
                "user \"{user}\" UID ({looked_up}) conflicts with user-id ({requested})"
            )));
        }
        uid = Some(looked_up);
        if gid.is_none() && group.is_empty() {
            gid = Some(entry.gid.as_raw());
        }
    }

    if !group.is_empty() {
        let entry = Group::from_name(group)
            .map_err(|err| io::Error::other(err.to_string()))?
            .ok_or_else(|| io::Error::other(format!("group \"{group}\" not found")))?;
        let looked_up = entry.gid.as_raw();
        if let Some(requested) = group_id
            && requested != looked_up
        {
            return Err(io::Error::other(format!(
                "group \"{group}\" GID ({looked_up}) conflicts with group-id ({requested})"
            )));
        }
        gid = Some(looked_up);
    }

    match (uid, gid) {
        (Some(uid), Some(gid)) => Ok(Some(Identity { uid, gid })),
        (Some(_), None) => Err(io::Error::other("must specify group, not just user")),
        (None, Some(_)) => Err(io::Error::other("must specify user, not just group")),
        (None, None) => unreachable!("at least one field was set"),
    }
}

/// Validates that the user/group fields normalize consistently, without
/// keeping the result. Used by plan validation.
pub fn validate_user_group(
    user_id: Option<u32>,
    user: &str,
    group_id: Option<u32>,
    group: &str,
) -> io::Result<()> {
    normalize_ids(user_id, user, group_id, group).map(|_| ())
}

/// Environment overrides derived from the target account (`HOME`, `USER`).
/// An unknown UID yields no overrides.
pub fn user_environment(uid: libc::uid_t) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Ok(Some(entry)) = User::from_uid(Uid::from_raw(uid)) {
        env.insert("HOME".to_string(), entry.dir.display().to_string());
        env.insert("USER".to_string(), entry.name);
    }
    env
}

/// Home directory of the given UID, if the user database knows it.
pub fn user_home(uid: libc::uid_t) -> Option<PathBuf> {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|entry| entry.dir)
}

/// The identity the daemon itself runs as.
pub fn current_identity() -> Identity {
    Identity {
        uid: Uid::effective().as_raw(),
        gid: Gid::effective().as_raw(),
    }
}

/// Switches the calling process to `identity`.
///
/// # Safety
/// Call this only between fork and exec in the child process. Invoking it
/// in the daemon would drop the daemon's own privileges.
pub unsafe fn apply_identity(identity: Identity) -> io::Result<()> {
    let gid = identity.gid;
    if unsafe { libc::setgroups(1, &gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setuid(identity.uid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
