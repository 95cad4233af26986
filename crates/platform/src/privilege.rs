//! Privilege-dropping `Command` setup for the execution engine.
//!
//! De-escalating from root to a target identity needs three things
//! `std::process::Command` does not expose together: the real/effective
//! uid, the real/effective gid, and the *supplementary* group list. The
//! first two are `Command::uid`/`Command::gid`; the third needs a
//! `setgroups(2)` call made while the child is still root, which only
//! `pre_exec` can do.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// The resolved (uid, gid, supplementary gids) a child should run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    pub uid: u32,
    pub gid: u32,
    pub supplementary_groups: Vec<u32>,
}

/// Configures `command` to drop to `identity` immediately before exec.
///
/// `setgroups` runs first (while still privileged), then
/// `Command::uid`/`Command::gid` apply the final uid/gid as part of the
/// exec sequence. Order matters: setting uid first would make the
/// subsequent `setgroups` call fail with `EPERM`.
pub fn apply_identity(command: &mut Command, identity: &TargetIdentity) {
    let groups = identity.supplementary_groups.clone();
    // SAFETY: `pre_exec` runs in the forked child before the new program
    // image is loaded; the closure only calls async-signal-safe libc
    // functions (`setgroups`) and allocates nothing.
    unsafe {
        command.pre_exec(move || {
            if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.uid(identity.uid);
    command.gid(identity.gid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_identity_does_not_panic_building_the_command() {
        let mut command = Command::new("/bin/true");
        let identity = TargetIdentity {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            supplementary_groups: vec![nix::unistd::getgid().as_raw()],
        };
        apply_identity(&mut command, &identity);
    }
}
