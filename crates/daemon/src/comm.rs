//! Comm handler: one worker thread per accepted comm connection.
//!
//! Implements spec §4.6 steps 1–7. `UNAUTHORIZED` is used for both "no
//! such action" and "policy denial" so the set of configured action names
//! is never leaked to an unauthorized caller.

use std::sync::Arc;

use privleap_core::UserRef;
use privleap_platform::identity;
use privleap_protocol::{CommReply, CommRequest, ProtocolError};

use crate::action::Action;
use crate::exec;
use crate::fanout::FanoutLimiter;
use crate::session::CommSession;

/// Runs one comm session to completion. Never panics across the session
/// boundary — all error paths log and return.
pub fn handle(mut session: CommSession, actions: &Arc<Vec<Action>>, limiter: &Arc<FanoutLimiter>) {
    let Some(_guard) = limiter.try_acquire(&session.user_name) else {
        tracing::warn!(
            target: "comm",
            user = %session.user_name,
            "per-user session cap reached, refusing new connection"
        );
        session.reply(&CommReply::TriggerError);
        return;
    };

    let action_name = match session.read_request() {
        Ok(CommRequest::Signal { action }) => action,
        Err(ProtocolError::Closed) => return,
        Err(err) => {
            tracing::error!(target: "comm", error = %err, "malformed comm request, closing session");
            return;
        }
    };

    let Some(action) = actions.iter().find(|candidate| candidate.name == action_name) else {
        tracing::warn!(target: "comm", action = %action_name, "no such action, replying UNAUTHORIZED");
        session.reply(&CommReply::Unauthorized);
        return;
    };

    let Ok(peer_groups) = peer_group_memberships(&session.user_name) else {
        tracing::error!(target: "comm", user = %session.user_name, "could not resolve peer's group memberships");
        session.reply(&CommReply::Unauthorized);
        return;
    };

    if !action.authorizes(&session.user_name, session.peer_uid, &peer_groups) {
        tracing::warn!(
            target: "comm",
            user = %session.user_name,
            action = %action.name,
            "user is not authorized to run this action"
        );
        session.reply(&CommReply::Unauthorized);
        return;
    }

    let mut child = match exec::spawn(action) {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(target: "comm", action = %action.name, error = %err, "action authorized, but trigger failed");
            session.reply(&CommReply::TriggerError);
            return;
        }
    };

    tracing::info!(target: "comm", action = %action.name, user = %session.user_name, "triggered action");

    if !session.reply(&CommReply::Trigger) {
        // Client already gone; there is no one to stream results to, but
        // the action is running, so still drain and wait on it so no
        // zombie or leaked descriptor survives.
        let code = exec::stream_results(&mut child, &mut session);
        tracing::info!(target: "comm", action = %action.name, exit_code = code, "action completed (client had already disconnected)");
        return;
    }

    let code = exec::stream_results(&mut child, &mut session);
    tracing::info!(target: "comm", action = %action.name, exit_code = code, "action completed");
    session.reply(&CommReply::ResultExitCode { code });
}

fn peer_group_memberships(user_name: &str) -> Result<Vec<(String, u32)>, privleap_platform::PlatformError> {
    let user = identity::lookup_user(&UserRef::Name(user_name.to_string()))?;
    let gids = identity::supplementary_groups(&user)?;
    let mut groups = Vec::with_capacity(gids.len());
    for gid in gids {
        match identity::lookup_group(&privleap_core::GroupRef::Id(gid)) {
            Ok(group) => groups.push((group.name, group.gid)),
            Err(_) => groups.push((String::new(), gid)),
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use privleap_protocol::{read_frame, write_frame};

    /// Actually triggering an action requires `setgroups()`, which needs
    /// `CAP_SETGID` regardless of the target identity.
    fn skip_unless_root() -> bool {
        if nix::unistd::getuid().is_root() {
            true
        } else {
            eprintln!("skipping: triggering an action needs root to drop/reassert privileges");
            false
        }
    }

    /// Reads one frame without applying the strict ASCII grammar, so it
    /// can read `RESULT_STDOUT`/`RESULT_STDERR`'s raw-byte trailing
    /// argument the same way it reads a plain token frame like `TRIGGER`.
    fn read_any_frame(stream: &mut UnixStream) -> (String, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        match payload.iter().position(|&b| b == 0x1F) {
            Some(pos) => (
                String::from_utf8(payload[..pos].to_vec()).unwrap(),
                payload[pos + 1..].to_vec(),
            ),
            None => (String::from_utf8(payload).unwrap(), Vec::new()),
        }
    }

    #[test]
    fn triggers_an_authorized_action_end_to_end() {
        if !skip_unless_root() {
            return;
        }
        let actions = Arc::new(vec![Action {
            name: "test-act-free".to_string(),
            command: "echo hello-from-privleap".to_string(),
            authorized_users: None,
            authorized_groups: None,
            target_user: UserRef::Id(0),
            target_group: None,
        }]);
        let limiter = Arc::new(FanoutLimiter::new(4));

        let (mut client, server) = UnixStream::pair().unwrap();
        let client_thread = thread::spawn(move || {
            write_frame(&mut client, &["SIGNAL", "test-act-free"]).unwrap();

            let (kind, _) = read_any_frame(&mut client);
            assert_eq!(kind, "TRIGGER");

            let mut stdout = Vec::new();
            loop {
                let (kind, bytes) = read_any_frame(&mut client);
                if kind == "RESULT_EXITCODE" {
                    assert_eq!(bytes, b"0");
                    break;
                }
                assert_eq!(kind, "RESULT_STDOUT");
                stdout.extend_from_slice(&bytes);
            }
            assert_eq!(stdout, b"hello-from-privleap\n");
        });

        let session = CommSession::accept(server, "root", true).unwrap();
        handle(session, &actions, &limiter);
        client_thread.join().unwrap();
    }

    #[test]
    fn unknown_action_is_reported_as_unauthorized() {
        // No exec involved on this path, so unlike the trigger test above
        // this does not need root.
        let actions = Arc::new(Vec::new());
        let limiter = Arc::new(FanoutLimiter::new(4));

        let self_name = identity::lookup_user(&UserRef::Id(nix::unistd::getuid().as_raw()))
            .unwrap()
            .name;

        let (mut client, server) = UnixStream::pair().unwrap();
        let client_thread = thread::spawn(move || {
            write_frame(&mut client, &["SIGNAL", "no-such-action"]).unwrap();
            let reply = read_frame(&mut client).unwrap();
            assert_eq!(reply, vec!["UNAUTHORIZED".to_string()]);
        });

        let session = CommSession::accept(server, &self_name, true).unwrap();
        handle(session, &actions, &limiter);
        client_thread.join().unwrap();
    }
}
