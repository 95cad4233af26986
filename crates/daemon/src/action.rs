//! The action table: immutable, pre-declared commands-with-policy.
//!
//! Built once by [`crate::config::load`] and shared read-only across every
//! comm worker thread for the lifetime of the daemon process.

use privleap_core::{GroupRef, UserRef};

/// A named, pre-declared command an authorized caller may trigger.
///
/// `target_user` always has a concrete default (`root`); `target_group`
/// stays `None` when the configuration does not set one, in which case
/// the execution engine resolves it to the target user's primary group at
/// spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub command: String,
    pub authorized_users: Option<Vec<UserRef>>,
    pub authorized_groups: Option<Vec<GroupRef>>,
    pub target_user: UserRef,
    pub target_group: Option<GroupRef>,
}

impl Action {
    /// Decides whether `peer_name`/`peer_uid`/`peer_groups` may trigger
    /// this action, per spec §4.6 step 3: open if neither restriction is
    /// set, otherwise a disjunction across the user list and the group
    /// list.
    #[must_use]
    pub fn authorizes(&self, peer_name: &str, peer_uid: u32, peer_groups: &[(String, u32)]) -> bool {
        if self.authorized_users.is_none() && self.authorized_groups.is_none() {
            return true;
        }
        if let Some(users) = &self.authorized_users {
            if users
                .iter()
                .any(|user_ref| user_matches(user_ref, peer_name, peer_uid))
            {
                return true;
            }
        }
        if let Some(groups) = &self.authorized_groups {
            if groups.iter().any(|group_ref| {
                peer_groups
                    .iter()
                    .any(|(name, gid)| group_matches(group_ref, name, *gid))
            }) {
                return true;
            }
        }
        false
    }
}

fn user_matches(user_ref: &UserRef, peer_name: &str, peer_uid: u32) -> bool {
    match user_ref {
        UserRef::Name(name) => name == peer_name,
        UserRef::Id(id) => *id == peer_uid,
    }
}

fn group_matches(group_ref: &GroupRef, name: &str, gid: u32) -> bool {
    match group_ref {
        GroupRef::Name(group_name) => group_name == name,
        GroupRef::Id(id) => *id == gid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(users: Option<Vec<UserRef>>, groups: Option<Vec<GroupRef>>) -> Action {
        Action {
            name: "test-act".to_string(),
            command: "true".to_string(),
            authorized_users: users,
            authorized_groups: groups,
            target_user: UserRef::Name("root".to_string()),
            target_group: None,
        }
    }

    #[test]
    fn open_action_authorizes_anyone() {
        let act = action(None, None);
        assert!(act.authorizes("alice", 1000, &[]));
    }

    #[test]
    fn user_restricted_action_matches_by_name_or_id() {
        let act = action(Some(vec![UserRef::Name("alice".to_string())]), None);
        assert!(act.authorizes("alice", 1000, &[]));
        assert!(!act.authorizes("bob", 1001, &[]));

        let act_by_id = action(Some(vec![UserRef::Id(1000)]), None);
        assert!(act_by_id.authorizes("alice", 1000, &[]));
        assert!(!act_by_id.authorizes("alice", 1001, &[]));
    }

    #[test]
    fn group_restricted_action_matches_by_name_or_id() {
        let act = action(None, Some(vec![GroupRef::Name("sudo".to_string())]));
        assert!(act.authorizes("alice", 1000, &[("sudo".to_string(), 27)]));
        assert!(!act.authorizes("alice", 1000, &[("users".to_string(), 100)]));

        let act_by_id = action(None, Some(vec![GroupRef::Id(27)]));
        assert!(act_by_id.authorizes("alice", 1000, &[("sudo".to_string(), 27)]));
    }

    #[test]
    fn disjunction_across_user_and_group_lists() {
        let act = action(
            Some(vec![UserRef::Name("sys".to_string())]),
            Some(vec![GroupRef::Name("sudo".to_string())]),
        );
        // Neither list matches alice directly, but she's in the sudo group.
        assert!(act.authorizes("alice", 1000, &[("sudo".to_string(), 27)]));
        assert!(!act.authorizes("alice", 1000, &[("users".to_string(), 100)]));
    }

    #[test]
    fn unresolvable_numeric_entry_is_simply_never_matched() {
        let act = action(Some(vec![UserRef::Id(99_999)]), None);
        assert!(!act.authorizes("alice", 1000, &[]));
    }
}
