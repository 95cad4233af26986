//! Configuration loader: `/etc/privleap/conf.d/*.conf` → an in-memory
//! action table.
//!
//! # Design
//!
//! Each file is a sequence of `[name]`-headed sections; each non-header,
//! non-blank, non-comment line is `Key=Value`. Two section names are
//! reserved (`persistent-users`, `allowed-users`); every other name is an
//! action declaration. Reserved sections may repeat, within one file or
//! across files, and their `User=` entries merge into one set per kind.
//!
//! Numeric `AuthorizedUsers`/`AuthorizedGroups` entries that do not
//! resolve against the host's user/group database are kept verbatim
//! (they can simply never match a real peer) and logged at INFO;
//! `TargetUser`/`TargetGroup` must resolve or the whole load aborts,
//! since the execution target has to actually exist.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use privleap_core::{GroupRef, Identifier, UserRef};
use privleap_platform::identity;

use crate::action::Action;

const RESERVED_PERSISTENT_USERS: &str = "persistent-users";
const RESERVED_ALLOWED_USERS: &str = "allowed-users";

/// Every way loading the configuration directory can fail. Each variant
/// is a CRITICAL, fatal-at-startup condition per spec §7.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration directory {dir}: {source}")]
    ReadDir { dir: PathBuf, #[source] source: io::Error },
    #[error("cannot read configuration file {path}: {source}")]
    ReadFile { path: PathBuf, #[source] source: io::Error },
    #[error("{path}: invalid section name '{name}': {source}")]
    InvalidSectionName {
        path: PathBuf,
        name: String,
        #[source]
        source: privleap_core::IdentifierError,
    },
    #[error("{path}:{line}: expected '[section]' header or 'Key=Value', found {content:?}")]
    MalformedLine { path: PathBuf, line: usize, content: String },
    #[error("{path}:{line}: key '{key}' is not valid in a [{section}] section")]
    UnknownKey { path: PathBuf, line: usize, section: String, key: String },
    #[error("{path}: action '{name}' has no Command")]
    MissingCommand { path: PathBuf, name: String },
    #[error("action '{name}' is defined twice (first in {first}, again in {second})")]
    DuplicateAction { name: String, first: PathBuf, second: PathBuf },
    #[error("{path}: action '{name}' target user '{target_user}' does not exist: {source}")]
    UnresolvedTargetUser {
        path: PathBuf,
        name: String,
        target_user: String,
        #[source]
        source: privleap_platform::PlatformError,
    },
    #[error("{path}: action '{name}' target group '{target_group}' does not exist: {source}")]
    UnresolvedTargetGroup {
        path: PathBuf,
        name: String,
        target_group: String,
        #[source]
        source: privleap_platform::PlatformError,
    },
}

/// The fully loaded, validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub actions: Vec<Action>,
    pub persistent_users: BTreeSet<String>,
    pub allowed_users: BTreeSet<String>,
}

enum Section {
    Action(ActionBuilder),
    PersistentUsers,
    AllowedUsers,
}

struct ActionBuilder {
    name: String,
    command: Option<String>,
    authorized_users: Option<Vec<UserRef>>,
    authorized_groups: Option<Vec<GroupRef>>,
    target_user: Option<UserRef>,
    target_group: Option<GroupRef>,
}

impl ActionBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            command: None,
            authorized_users: None,
            authorized_groups: None,
            target_user: None,
            target_group: None,
        }
    }

    fn set(&mut self, key: &str, value: &str, path: &Path, line: usize) -> Result<(), ConfigError> {
        match key {
            "Command" => self.command = Some(value.to_string()),
            "AuthorizedUsers" => {
                self.authorized_users = Some(value.split(',').map(|s| UserRef::parse(s.trim())).collect());
            }
            "AuthorizedGroups" => {
                self.authorized_groups =
                    Some(value.split(',').map(|s| GroupRef::parse(s.trim())).collect());
            }
            "TargetUser" => self.target_user = Some(UserRef::parse(value)),
            "TargetGroup" => self.target_group = Some(GroupRef::parse(value)),
            other => {
                return Err(ConfigError::UnknownKey {
                    path: path.to_path_buf(),
                    line,
                    section: self.name.clone(),
                    key: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn finish(self, path: &Path) -> Result<Action, ConfigError> {
        let Some(command) = self.command else {
            return Err(ConfigError::MissingCommand {
                path: path.to_path_buf(),
                name: self.name,
            });
        };
        Ok(Action {
            name: self.name,
            command,
            authorized_users: self.authorized_users,
            authorized_groups: self.authorized_groups,
            target_user: self.target_user.unwrap_or_else(|| UserRef::Name("root".to_string())),
            target_group: self.target_group,
        })
    }
}

/// Loads and validates every `*.conf` file in `config_dir`.
///
/// # Errors
///
/// [`ConfigError`] on any syntax error, unknown key, duplicate action
/// name, or unresolvable `TargetUser`/`TargetGroup`. Unresolvable numeric
/// entries in an authorization list are not an error (see module docs).
pub fn load(config_dir: &Path) -> Result<Config, ConfigError> {
    let mut actions: HashMap<String, (Action, PathBuf)> = HashMap::new();
    let mut persistent_users = BTreeSet::new();
    let mut allowed_users = BTreeSet::new();

    let entries = fs::read_dir(config_dir).map_err(|source| ConfigError::ReadDir {
        dir: config_dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_candidate_config_file(path))
        .collect();
    paths.sort();

    for path in paths {
        parse_file(&path, &mut actions, &mut persistent_users, &mut allowed_users)?;
    }

    for (action, path) in actions.values() {
        validate_target(action, path)?;
        log_dead_authorization_entries(action);
    }

    let mut actions: Vec<Action> = actions.into_values().map(|(action, _)| action).collect();
    actions.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Config {
        actions,
        persistent_users,
        allowed_users,
    })
}

fn is_candidate_config_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(stem) = file_name.strip_suffix(".conf") else {
        return false;
    };
    Identifier::parse(stem).is_ok()
}

fn parse_file(
    path: &Path,
    actions: &mut HashMap<String, (Action, PathBuf)>,
    persistent_users: &mut BTreeSet<String>,
    allowed_users: &mut BTreeSet<String>,
) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut section: Option<Section> = None;

    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            flush_section(section.take(), path, actions)?;
            section = Some(open_section(name, path)?);
            continue;
        }

        let Some(current) = section.as_mut() else {
            return Err(ConfigError::MalformedLine {
                path: path.to_path_buf(),
                line: line_number,
                content: line.to_string(),
            });
        };

        let Some(eq_pos) = line.find('=') else {
            return Err(ConfigError::MalformedLine {
                path: path.to_path_buf(),
                line: line_number,
                content: line.to_string(),
            });
        };
        let key = line[..eq_pos].trim();
        let value = line[eq_pos + 1..].trim();

        match current {
            Section::Action(builder) => builder.set(key, value, path, line_number)?,
            Section::PersistentUsers => {
                if key == "User" {
                    persistent_users.insert(value.to_string());
                } else {
                    return Err(ConfigError::UnknownKey {
                        path: path.to_path_buf(),
                        line: line_number,
                        section: RESERVED_PERSISTENT_USERS.to_string(),
                        key: key.to_string(),
                    });
                }
            }
            Section::AllowedUsers => {
                if key == "User" {
                    allowed_users.insert(value.to_string());
                } else {
                    return Err(ConfigError::UnknownKey {
                        path: path.to_path_buf(),
                        line: line_number,
                        section: RESERVED_ALLOWED_USERS.to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }
    }

    flush_section(section, path, actions)
}

fn open_section(name: &str, path: &Path) -> Result<Section, ConfigError> {
    match name {
        RESERVED_PERSISTENT_USERS => Ok(Section::PersistentUsers),
        RESERVED_ALLOWED_USERS => Ok(Section::AllowedUsers),
        other => {
            Identifier::parse(other).map_err(|source| ConfigError::InvalidSectionName {
                path: path.to_path_buf(),
                name: other.to_string(),
                source,
            })?;
            Ok(Section::Action(ActionBuilder::new(other.to_string())))
        }
    }
}

fn flush_section(
    section: Option<Section>,
    path: &Path,
    actions: &mut HashMap<String, (Action, PathBuf)>,
) -> Result<(), ConfigError> {
    let Some(Section::Action(builder)) = section else {
        return Ok(());
    };
    let name = builder.name.clone();
    let action = builder.finish(path)?;
    if let Some((_, first_path)) = actions.get(&name) {
        return Err(ConfigError::DuplicateAction {
            name,
            first: first_path.clone(),
            second: path.to_path_buf(),
        });
    }
    actions.insert(name, (action, path.to_path_buf()));
    Ok(())
}

fn validate_target(action: &Action, path: &Path) -> Result<(), ConfigError> {
    identity::lookup_user(&action.target_user).map_err(|source| ConfigError::UnresolvedTargetUser {
        path: path.to_path_buf(),
        name: action.name.clone(),
        target_user: action.target_user.to_string(),
        source,
    })?;
    if let Some(group) = &action.target_group {
        identity::lookup_group(group).map_err(|source| ConfigError::UnresolvedTargetGroup {
            path: path.to_path_buf(),
            name: action.name.clone(),
            target_group: group.to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Logs (INFO, not fatal) any numeric authorization entry that does not
/// resolve to a real account — it is dead weight, never able to match a
/// real peer, but not a configuration error.
fn log_dead_authorization_entries(action: &Action) {
    if let Some(users) = &action.authorized_users {
        for user_ref in users {
            if let UserRef::Id(id) = user_ref {
                if identity::lookup_user(&UserRef::Id(*id)).is_err() {
                    tracing::info!(
                        target: "config",
                        action = %action.name,
                        uid = id,
                        "AuthorizedUsers entry does not resolve to any account; it can never match"
                    );
                }
            }
        }
    }
    if let Some(groups) = &action.authorized_groups {
        for group_ref in groups {
            if let GroupRef::Id(id) = group_ref {
                if identity::lookup_group(&GroupRef::Id(*id)).is_err() {
                    tracing::info!(
                        target: "config",
                        action = %action.name,
                        gid = id,
                        "AuthorizedGroups entry does not resolve to any group; it can never match"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_conf(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn parses_a_free_action() {
        let dir = tempdir().unwrap();
        write_conf(
            dir.path(),
            "free.conf",
            "[test-act-free]\nCommand=echo 'test-act-free'\n",
        );
        let config = load(dir.path()).unwrap();
        assert_eq!(config.actions.len(), 1);
        assert_eq!(config.actions[0].name, "test-act-free");
        assert_eq!(config.actions[0].target_user, UserRef::Name("root".to_string()));
        assert!(config.actions[0].authorized_users.is_none());
    }

    #[test]
    fn merges_persistent_users_across_repeated_sections() {
        let dir = tempdir().unwrap();
        write_conf(
            dir.path(),
            "users.conf",
            "[persistent-users]\nUser=alice\n\n[persistent-users]\nUser=bob\n",
        );
        let config = load(dir.path()).unwrap();
        assert_eq!(
            config.persistent_users,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn duplicate_action_across_files_is_fatal() {
        let dir = tempdir().unwrap();
        write_conf(dir.path(), "a.conf", "[dup]\nCommand=true\n");
        write_conf(dir.path(), "b.conf", "[dup]\nCommand=false\n");
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAction { .. }));
    }

    #[test]
    fn missing_command_is_fatal() {
        let dir = tempdir().unwrap();
        write_conf(dir.path(), "bad.conf", "[no-command]\nAuthorizedUsers=alice\n");
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand { .. }));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let dir = tempdir().unwrap();
        write_conf(dir.path(), "bad.conf", "[act]\nCommand=true\nBogusKey=1\n");
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn command_value_preserves_embedded_equals_signs() {
        let dir = tempdir().unwrap();
        write_conf(dir.path(), "eq.conf", "[act]\nCommand=FOO=bar echo hi\n");
        let config = load(dir.path()).unwrap();
        assert_eq!(config.actions[0].command, "FOO=bar echo hi");
    }

    #[test]
    fn non_matching_filenames_are_skipped_not_rejected() {
        let dir = tempdir().unwrap();
        write_conf(dir.path(), "notes.txt", "this is not a config file");
        write_conf(dir.path(), "free.conf", "[test-act-free]\nCommand=true\n");
        let config = load(dir.path()).unwrap();
        assert_eq!(config.actions.len(), 1);
    }

    #[test]
    fn unresolvable_target_user_is_fatal() {
        let dir = tempdir().unwrap();
        write_conf(
            dir.path(),
            "bad.conf",
            "[act]\nCommand=true\nTargetUser=privleap-test-no-such-user\n",
        );
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedTargetUser { .. }));
    }

    #[test]
    fn unresolvable_authorized_user_is_not_fatal() {
        let dir = tempdir().unwrap();
        write_conf(
            dir.path(),
            "act.conf",
            "[act]\nCommand=true\nAuthorizedUsers=999999\n",
        );
        let config = load(dir.path()).unwrap();
        assert_eq!(
            config.actions[0].authorized_users,
            Some(vec![UserRef::Id(999_999)])
        );
    }
}
