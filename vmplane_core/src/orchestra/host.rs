use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

// Error Handling
use log::trace;

/// The passwd database iterator is not reentrant.
static PASSWD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Lowest uid of a regular account.
const FIRST_UID: u32 = 1000;

/// Identities vm access lists may refer to.
pub trait Directory: Send + Sync + fmt::Debug {
    fn users(&self) -> Vec<String>;
    fn groups(&self) -> Vec<String>;
    fn has_user(&self, name: &str) -> bool {
        self.users().iter().any(|e| e == name)
    }
    fn has_group(&self, name: &str) -> bool {
        self.groups().iter().any(|e| e == name)
    }
}

/// Users and groups of the local host.
#[derive(Debug, Default, Clone)]
pub struct HostDirectory;

impl HostDirectory {
    fn accounts() -> Vec<users::User> {
        let _guard = PASSWD.lock().unwrap_or_else(PoisonError::into_inner);
        // Safety: iteration is serialized by the guard above.
        let all = unsafe { users::all_users() };
        all.filter(|e| e.uid() >= FIRST_UID).collect()
    }
}

impl Directory for HostDirectory {
    fn users(&self) -> Vec<String> {
        let res: Vec<String> = Self::accounts()
            .iter()
            .map(|e| e.name().to_string_lossy().into_owned())
            .collect();
        trace!("found {} host users", res.len());
        res
    }
    /*
     * Groups regular accounts belong to.
     */
    fn groups(&self) -> Vec<String> {
        let mut res: BTreeSet<String> = BTreeSet::new();
        for user in Self::accounts() {
            if let Some(groups) = user.groups() {
                for group in groups {
                    res.insert(group.name().to_string_lossy().into_owned());
                }
            }
        }
        res.into_iter().collect()
    }
    fn has_user(&self, name: &str) -> bool {
        users::get_user_by_name(name).is_some()
    }
    fn has_group(&self, name: &str) -> bool {
        users::get_group_by_name(name).is_some()
    }
}

/// A fixed directory.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    users: Vec<String>,
    groups: Vec<String>,
}

impl StaticDirectory {
    pub fn new(users: &[&str], groups: &[&str]) -> Self {
        Self {
            users: users.iter().map(|e| e.to_string()).collect(),
            groups: groups.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl Directory for StaticDirectory {
    fn users(&self) -> Vec<String> {
        self.users.clone()
    }
    fn groups(&self) -> Vec<String> {
        self.groups.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    // Error Handling
    use miette::Result;

    #[test]
    fn static_lookups() -> Result<()> {
        let directory = StaticDirectory::new(&["alice", "bob"], &["wheel"]);
        assert!(directory.has_user("alice"));
        assert!(!directory.has_user("mallory"));
        assert!(directory.has_group("wheel"));
        assert_eq!(directory.groups(), vec!["wheel".to_owned()]);
        Ok(())
    }

    #[test]
    fn host_has_root() -> Result<()> {
        let directory = HostDirectory;
        assert!(directory.has_user("root"));
        assert!(directory.has_group("root"));
        assert!(!directory.has_user("vmplane-nonexistent-user"));
        Ok(())
    }
}
