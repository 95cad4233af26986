//! Execution engine: spawns one action's command as its target identity
//! in a sanitized environment, then streams stdout/stderr back to the
//! caller without reordering either stream.

use std::io::Read;
use std::os::fd::{AsFd, AsRawFd};
use std::process::{Child, Command, Stdio};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use privleap_platform::identity::{self, User};
use privleap_platform::privilege::{apply_identity, TargetIdentity};
use privleap_platform::PlatformError;
use privleap_protocol::{CommReply, STREAM_CHUNK_LEN};

use crate::action::Action;
use crate::session::CommSession;

/// The shell used to interpret an action's `Command` string. Fixed as a
/// single constant so the choice (spec §4.7 says `/bin/bash`) is made in
/// exactly one place.
const ACTION_SHELL: &str = "/bin/bash";

/// Every way spawning an action's child can fail.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to resolve target identity: {0}")]
    Identity(#[from] PlatformError),
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Spawns `action`'s command as its configured target identity.
///
/// # Errors
///
/// [`ExecError::Identity`] if the target user/group cannot be resolved
/// (should not happen for a config that passed [`crate::config::load`],
/// but the host's user database can change between load and trigger);
/// [`ExecError::Spawn`] if the underlying `fork`/`exec` fails.
pub fn spawn(action: &Action) -> Result<Child, ExecError> {
    let target_user: User = identity::lookup_user(&action.target_user)?;
    let target_gid = match &action.target_group {
        Some(group_ref) => identity::lookup_group(group_ref)?.gid,
        None => target_user.primary_gid,
    };
    let supplementary_groups = identity::supplementary_groups(&target_user)?;

    let identity = TargetIdentity {
        uid: target_user.uid,
        gid: target_gid,
        supplementary_groups,
    };

    let mut command = Command::new(ACTION_SHELL);
    command
        .arg("-c")
        .arg(&action.command)
        .current_dir(&target_user.home)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, value) in sanitized_environment(&target_user) {
        command.env(key, value);
    }

    apply_identity(&mut command, &identity);

    command.spawn().map_err(ExecError::Spawn)
}

/// Builds the child's environment: the daemon's own environment, then
/// `HOME`/`LOGNAME`/`USER`/`PWD` overridden from the target user's passwd
/// record and `SHELL` pinned to [`ACTION_SHELL`].
fn sanitized_environment(target_user: &User) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    let overrides = [
        ("HOME", target_user.home.clone()),
        ("LOGNAME", target_user.name.clone()),
        ("USER", target_user.name.clone()),
        ("PWD", target_user.home.clone()),
        ("SHELL", ACTION_SHELL.to_string()),
    ];
    for (key, value) in overrides {
        env.retain(|(existing_key, _)| existing_key != key);
        env.push((key.to_string(), value));
    }
    env
}

/// Streams `child`'s stdout/stderr to `session` until both reach EOF,
/// interleaving `RESULT_STDOUT`/`RESULT_STDERR` frames in the order their
/// source stream becomes readable, then waits for the child and returns
/// its exit code.
///
/// If a send to `session` fails partway through (the client is gone),
/// the interleaved loop stops immediately and whatever remains of stdout
/// and stderr is handed to [`privleap_logging_sink::drain_to_null`]
/// instead, so the child can still finish and no descriptor or zombie is
/// left behind — see the comm handler's disconnect policy.
pub fn stream_results(child: &mut Child, session: &mut CommSession) -> i32 {
    let mut stdout = child.stdout.take().expect("spawn() requests a piped stdout");
    let mut stderr = child.stderr.take().expect("spawn() requests a piped stderr");

    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut client_gone = false;
    let mut buf = [0u8; STREAM_CHUNK_LEN];

    while (!stdout_done || !stderr_done) && !client_gone {
        let mut fds = Vec::with_capacity(2);
        if !stdout_done {
            fds.push(PollFd::new(stdout.as_fd(), PollFlags::POLLIN));
        }
        if !stderr_done {
            fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
        }

        if poll(&mut fds, PollTimeout::NONE).is_err() {
            break;
        }

        let mut index = 0;
        if !stdout_done {
            if fds[index].revents().is_some_and(|r| !r.is_empty()) {
                match stdout.read(&mut buf) {
                    Ok(0) => stdout_done = true,
                    Ok(count) => {
                        if !session.reply(&CommReply::ResultStdout {
                            bytes: buf[..count].to_vec(),
                        }) {
                            client_gone = true;
                        }
                    }
                    Err(_) => stdout_done = true,
                }
            }
            index += 1;
        }
        if !client_gone && !stderr_done {
            if fds[index].revents().is_some_and(|r| !r.is_empty()) {
                match stderr.read(&mut buf) {
                    Ok(0) => stderr_done = true,
                    Ok(count) => {
                        if !session.reply(&CommReply::ResultStderr {
                            bytes: buf[..count].to_vec(),
                        }) {
                            client_gone = true;
                        }
                    }
                    Err(_) => stderr_done = true,
                }
            }
        }
    }

    if client_gone {
        if !stdout_done {
            privleap_logging_sink::drain_to_null(&mut stdout);
        }
        if !stderr_done {
            privleap_logging_sink::drain_to_null(&mut stderr);
        }
    }

    let status = child.wait();
    exit_code_of(status)
}

fn exit_code_of(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Ok(status) => status.code().or_else(|| status.signal().map(|sig| 128 + sig)).unwrap_or(-1),
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use privleap_core::UserRef;

    fn free_action(command: &str) -> Action {
        Action {
            name: "test".to_string(),
            command: command.to_string(),
            authorized_users: None,
            authorized_groups: None,
            target_user: UserRef::Id(nix::unistd::getuid().as_raw()),
            target_group: None,
        }
    }

    #[test]
    fn sanitized_environment_overrides_the_five_keys() {
        let user = identity::lookup_user(&UserRef::Id(nix::unistd::getuid().as_raw())).unwrap();
        let env = sanitized_environment(&user);
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        assert_eq!(get("HOME"), Some(user.home.clone()));
        assert_eq!(get("LOGNAME"), Some(user.name.clone()));
        assert_eq!(get("USER"), Some(user.name.clone()));
        assert_eq!(get("PWD"), Some(user.home.clone()));
        assert_eq!(get("SHELL"), Some(ACTION_SHELL.to_string()));
    }

    #[test]
    #[ignore = "requires spawning a real child process; run under an integration harness"]
    fn spawning_exit_240_eventually_reports_that_code() {
        let action = free_action("exit 240");
        let mut child = spawn(&action).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(240));
    }
}
