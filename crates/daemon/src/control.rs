//! Control handler: processes `CREATE`/`DESTROY` requests from privileged
//! clients. Runs inline on the supervisor's accept-loop thread — control
//! requests mutate the socket registry and are serialized deliberately
//! (spec §5: "control clients are privileged and few").

use privleap_core::UserRef;
use privleap_platform::{identity, PlatformError};
use privleap_protocol::{ControlReply, ControlRequest, ProtocolError};

use crate::registry::{CreateCommOutcome, DestroyCommOutcome, SocketRegistry};
use crate::session::ControlSession;

/// Runs one control session to completion, mutating `registry` as
/// needed.
pub fn handle(mut session: ControlSession, registry: &mut SocketRegistry) {
    let request = match session.read_request() {
        Ok(request) => request,
        Err(ProtocolError::Closed) => return,
        Err(err) => {
            tracing::error!(target: "control", error = %err, "protocol violation on control socket, closing session");
            return;
        }
    };

    match request {
        ControlRequest::Create { user } => handle_create(&mut session, registry, &user),
        ControlRequest::Destroy { user } => handle_destroy(&mut session, registry, &user),
    }
}

fn handle_create(session: &mut ControlSession, registry: &mut SocketRegistry, user: &str) {
    let resolved_name = match resolve_user_name(user) {
        Ok(name) => name,
        Err(_) => {
            tracing::warn!(target: "control", user, "CREATE requested for unknown user");
            session.reply(ControlReply::ControlError);
            return;
        }
    };

    match registry.create_comm(&resolved_name) {
        CreateCommOutcome::Ok => {
            tracing::info!(target: "control", user = %resolved_name, "handled CREATE, comm endpoint created");
            session.reply(ControlReply::Ok);
        }
        CreateCommOutcome::Exists => {
            tracing::info!(target: "control", user = %resolved_name, "handled CREATE, comm endpoint already exists");
            session.reply(ControlReply::Exists);
        }
        CreateCommOutcome::NoSuchUser => {
            tracing::warn!(target: "control", user = %resolved_name, "CREATE requested for unknown user");
            session.reply(ControlReply::ControlError);
        }
        CreateCommOutcome::CreateFailed(err) => {
            tracing::error!(target: "control", user = %resolved_name, error = %err, "failed to create comm endpoint");
            session.reply(ControlReply::ControlError);
        }
    }
}

fn handle_destroy(session: &mut ControlSession, registry: &mut SocketRegistry, user: &str) {
    let resolved_name = resolve_user_name(user).unwrap_or_else(|_| user.to_string());

    let (outcome, unlink_error) = registry.destroy_comm(&resolved_name);
    if let Some(err) = unlink_error {
        tracing::error!(
            target: "control",
            user = %resolved_name,
            error = %err,
            "failed to unlink comm socket during DESTROY, removing registry entry anyway"
        );
    }
    match outcome {
        DestroyCommOutcome::Ok => {
            tracing::info!(target: "control", user = %resolved_name, "handled DESTROY, comm endpoint destroyed");
            session.reply(ControlReply::Ok);
        }
        DestroyCommOutcome::NoUser => {
            tracing::info!(target: "control", user = %resolved_name, "handled DESTROY, no comm endpoint existed");
            session.reply(ControlReply::NoUser);
        }
    }
}

/// Resolves `user` (a name or a numeric uid) to the canonical account
/// name the registry keys comm endpoints by.
fn resolve_user_name(user: &str) -> Result<String, PlatformError> {
    identity::lookup_user(&UserRef::parse(user)).map(|resolved| resolved.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use privleap_protocol::{read_frame, write_frame};
    use tempfile::tempdir;

    /// `create_comm`/`destroy_comm` `chown()` the comm socket node, which
    /// requires `CAP_CHOWN` even when the target is the caller's own uid.
    fn skip_unless_root() -> bool {
        if nix::unistd::getuid().is_root() {
            true
        } else {
            eprintln!("skipping: control handler CREATE/DESTROY needs root to chown a socket");
            false
        }
    }

    /// One session handles exactly one request/reply, so each round trip
    /// below gets its own socket pair (mirroring how the supervisor's
    /// accept loop hands every accepted connection its own session).
    fn round_trip(registry: &mut SocketRegistry, request: &[&str]) -> Vec<String> {
        let (mut client, server) = UnixStream::pair().unwrap();
        let request: Vec<String> = request.iter().map(|s| s.to_string()).collect();
        let client_thread = thread::spawn(move || {
            let request: Vec<&str> = request.iter().map(String::as_str).collect();
            write_frame(&mut client, &request).unwrap();
            read_frame(&mut client).unwrap()
        });
        let session = ControlSession::accept(server, true);
        handle(session, registry);
        client_thread.join().unwrap()
    }

    #[test]
    fn create_then_destroy_over_a_real_control_session() {
        if !skip_unless_root() {
            return;
        }
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());

        assert_eq!(round_trip(&mut registry, &["CREATE", "root"]), vec!["OK"]);
        assert_eq!(round_trip(&mut registry, &["DESTROY", "root"]), vec!["OK"]);
        assert_eq!(
            round_trip(&mut registry, &["DESTROY", "root"]),
            vec!["NOUSER"]
        );
    }

    #[test]
    fn create_for_unknown_user_replies_control_error() {
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());

        assert_eq!(
            round_trip(&mut registry, &["CREATE", "privleap-test-no-such-user"]),
            vec!["CONTROL_ERROR"]
        );
    }
}
