//! Process environment construction.
//!
//! Order matters to callers: container entries come first, a process entry
//! with an existing name replaces it in place, new names are appended, and
//! defaults only fill names nobody set.

use paddock_common::constants::DEFAULT_PATH;
use paddock_common::error::{PaddockError, Result};
use paddock_common::types::split_env_entry;
use paddock_core::user::UserEntry;

/// Rejects entries that are not `NAME=VALUE`.
///
/// # Errors
///
/// Returns the error built by `invalid` for the first malformed entry.
pub fn validate(entries: &[String], invalid: impl Fn(String) -> PaddockError) -> Result<()> {
    match entries.iter().find(|e| split_env_entry(e).is_none()) {
        Some(bad) => Err(invalid(format!("malformed environment entry {bad:?}"))),
        None => Ok(()),
    }
}

/// Value of `name` in an ordered entry list.
#[must_use]
pub fn lookup<'a>(entries: &'a [String], name: &str) -> Option<&'a str> {
    entries
        .iter()
        .filter_map(|e| split_env_entry(e))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Overlays `process` entries onto `container` entries.
#[must_use]
pub fn merge(container: &[String], process: &[String]) -> Vec<String> {
    let mut merged = container.to_vec();
    for entry in process {
        let Some((name, _)) = split_env_entry(entry) else {
            continue;
        };
        let existing = merged
            .iter_mut()
            .find(|e| split_env_entry(e).is_some_and(|(key, _)| key == name));
        match existing {
            Some(slot) => slot.clone_from(entry),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Appends `PATH`, `HOME` and `USER` when absent.
#[must_use]
pub fn with_defaults(mut entries: Vec<String>, user: &UserEntry) -> Vec<String> {
    if lookup(&entries, "PATH").is_none() {
        entries.push(format!("PATH={DEFAULT_PATH}"));
    }
    if lookup(&entries, "HOME").is_none() {
        entries.push(format!("HOME={}", user.home));
    }
    if lookup(&entries, "USER").is_none() {
        entries.push(format!("USER={}", user.name));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| (*e).to_owned()).collect()
    }

    #[test]
    fn process_entries_override_in_place_and_append() {
        let merged = merge(
            &owned(&["CONTAINER_ENV=1", "TEST=hi"]),
            &owned(&["TEST=hello", "FRUIT=banana"]),
        );
        assert_eq!(merged, owned(&["CONTAINER_ENV=1", "TEST=hello", "FRUIT=banana"]));
    }

    #[test]
    fn defaults_fill_only_missing_names() {
        let user = UserEntry {
            name: "alice".into(),
            uid: 1000,
            gid: 1000,
            home: "/home/alice".into(),
        };
        let env = with_defaults(owned(&["PATH=/opt/bin"]), &user);
        assert_eq!(env, owned(&["PATH=/opt/bin", "HOME=/home/alice", "USER=alice"]));
    }

    #[test]
    fn values_may_contain_equals() {
        let env = owned(&["OPTS=a=b"]);
        assert_eq!(lookup(&env, "OPTS"), Some("a=b"));
        assert_eq!(lookup(&env, "MISSING"), None);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let err = validate(&owned(&["GOOD=1", "BAD"]), |message| PaddockError::Creation { message })
            .unwrap_err();
        assert!(err.to_string().contains("BAD"));
        assert!(validate(&owned(&["EMPTY="]), |message| PaddockError::Spawn { message }).is_ok());
    }
}
