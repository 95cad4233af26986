//! User/group database lookups, by name or by numeric id, plus the full
//! supplementary-group listing a target identity's child process needs.

use std::ffi::CString;

use crate::PlatformError;
use privleap_core::{GroupRef, UserRef};

/// A resolved POSIX user record: the pieces the execution engine needs
/// to build a target identity (uid, primary gid, home, shell source).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub primary_gid: u32,
    pub home: String,
}

/// A resolved POSIX group record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

/// Looks up a user by name or numeric id.
///
/// # Errors
///
/// [`PlatformError::NoSuchUser`] if the host's user database has no
/// matching entry.
pub fn lookup_user(reference: &UserRef) -> Result<User, PlatformError> {
    let passwd = match reference {
        UserRef::Name(name) => lookup_passwd_by_name(name)?,
        UserRef::Id(uid) => lookup_passwd_by_uid(*uid)?,
    };
    Ok(passwd)
}

/// Looks up a group by name or numeric id.
///
/// # Errors
///
/// [`PlatformError::NoSuchGroup`] if the host's group database has no
/// matching entry.
pub fn lookup_group(reference: &GroupRef) -> Result<Group, PlatformError> {
    match reference {
        GroupRef::Name(name) => lookup_group_by_name(name),
        GroupRef::Id(gid) => lookup_group_by_gid(*gid),
    }
}

/// Returns every group id `user` belongs to: primary group first, then
/// supplementary groups in the order `getgrouplist` reports them.
///
/// # Errors
///
/// [`PlatformError::Io`] if the underlying syscall fails for a reason
/// other than the initial buffer being undersized (which is retried
/// internally).
pub fn supplementary_groups(user: &User) -> Result<Vec<u32>, PlatformError> {
    let name = CString::new(user.name.as_str())
        .map_err(|_| PlatformError::NoSuchUser(user.name.clone()))?;

    let mut ngroups: libc::c_int = 16;
    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; ngroups as usize];
        let mut count = ngroups;
        // SAFETY: `name` is a valid NUL-terminated C string for the
        // duration of the call; `groups` has `count` writable elements
        // and `count` is updated in place by the kernel on both success
        // and the `ENOMEM`-style "buffer too small" retry path.
        let rc = unsafe {
            libc::getgrouplist(
                name.as_ptr(),
                user.primary_gid,
                groups.as_mut_ptr(),
                &mut count,
            )
        };
        if rc >= 0 {
            groups.truncate(count as usize);
            return Ok(groups.into_iter().map(|g| g as u32).collect());
        }
        if count <= ngroups {
            return Err(PlatformError::Io(std::io::Error::last_os_error()));
        }
        ngroups = count;
    }
}

fn lookup_passwd_by_name(name: &str) -> Result<User, PlatformError> {
    use nix::unistd::User as NixUser;
    let user = NixUser::from_name(name)
        .map_err(|err| PlatformError::Io(err.into()))?
        .ok_or_else(|| PlatformError::NoSuchUser(name.to_string()))?;
    Ok(User {
        name: user.name,
        uid: user.uid.as_raw(),
        primary_gid: user.gid.as_raw(),
        home: user.dir.to_string_lossy().into_owned(),
    })
}

fn lookup_passwd_by_uid(uid: u32) -> Result<User, PlatformError> {
    use nix::unistd::{Uid, User as NixUser};
    let user = NixUser::from_uid(Uid::from_raw(uid))
        .map_err(|err| PlatformError::Io(err.into()))?
        .ok_or_else(|| PlatformError::NoSuchUser(uid.to_string()))?;
    Ok(User {
        name: user.name,
        uid: user.uid.as_raw(),
        primary_gid: user.gid.as_raw(),
        home: user.dir.to_string_lossy().into_owned(),
    })
}

fn lookup_group_by_name(name: &str) -> Result<Group, PlatformError> {
    use nix::unistd::Group as NixGroup;
    let group = NixGroup::from_name(name)
        .map_err(|err| PlatformError::Io(err.into()))?
        .ok_or_else(|| PlatformError::NoSuchGroup(name.to_string()))?;
    Ok(Group {
        name: group.name,
        gid: group.gid.as_raw(),
    })
}

fn lookup_group_by_gid(gid: u32) -> Result<Group, PlatformError> {
    use nix::unistd::{Gid, Group as NixGroup};
    let group = NixGroup::from_gid(Gid::from_raw(gid))
        .map_err(|err| PlatformError::Io(err.into()))?
        .ok_or_else(|| PlatformError::NoSuchGroup(gid.to_string()))?;
    Ok(Group {
        name: group.name,
        gid: group.gid.as_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_by_name_and_by_id() {
        let by_name = lookup_user(&UserRef::Name("root".to_string())).unwrap();
        let by_id = lookup_user(&UserRef::Id(0)).unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_name.uid, 0);
    }

    #[test]
    fn unknown_user_is_reported_by_name() {
        let err = lookup_user(&UserRef::Name("privleap-test-no-such-user".to_string())).unwrap_err();
        assert!(matches!(err, PlatformError::NoSuchUser(_)));
    }

    #[test]
    fn root_has_at_least_its_primary_group() {
        let root = lookup_user(&UserRef::Id(0)).unwrap();
        let groups = supplementary_groups(&root).unwrap();
        assert!(groups.contains(&root.primary_gid));
    }
}
