//! User credentials accepted by a server.
//!
//! A [`Credential`] is identified by its username alone: equality, ordering
//! and hashing ignore the password, so a [`CredentialSet`] holds at most one
//! entry per user. Password checks are explicit ([`Credential::verify`],
//! [`CredentialSet::authenticate`]).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Username and password pair
#[derive(Clone)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    /// New credential
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// User name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// True when `password` matches
    pub fn verify(&self, password: &str) -> bool {
        self.password == password
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
    }
}

impl Eq for Credential {}

impl PartialOrd for Credential {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Credential {
    fn cmp(&self, other: &Self) -> Ordering {
        self.username.cmp(&other.username)
    }
}

impl Hash for Credential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.username.hash(state);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Ordered set of credentials, unique by username
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: BTreeSet<Credential>,
}

impl CredentialSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential. An existing entry for the same user is kept and
    /// `false` is returned.
    pub fn add(&mut self, credential: Credential) -> bool {
        self.entries.insert(credential)
    }

    /// Remove the entry for `username` if `password` matches it
    pub fn remove(&mut self, username: &str, password: &str) -> bool {
        let key = Credential::new(username, "");
        match self.entries.get(&key) {
            Some(existing) if existing.verify(password) => self.entries.remove(&key),
            _ => false,
        }
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True when `username` exists and `password` matches
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.entries
            .get(&Credential::new(username, ""))
            .is_some_and(|credential| credential.verify(password))
    }

    /// True when an entry for `username` exists
    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains(&Credential::new(username, ""))
    }

    /// Number of users
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no user is configured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// User names in order
    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(Credential::username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_credential_per_user_wins() {
        let mut set = CredentialSet::new();
        assert!(set.add(Credential::new("alice", "p1")));
        assert!(!set.add(Credential::new("alice", "p2")));

        assert_eq!(set.len(), 1);
        assert!(set.authenticate("alice", "p1"));
        assert!(!set.authenticate("alice", "p2"));
    }

    #[test]
    fn test_equality_ignores_password() {
        assert_eq!(Credential::new("bob", "x"), Credential::new("bob", "y"));
        assert!(Credential::new("alice", "z") < Credential::new("bob", "a"));
    }

    #[test]
    fn test_remove_requires_password() {
        let mut set = CredentialSet::new();
        set.add(Credential::new("bob", "secret"));

        assert!(!set.remove("bob", "wrong"));
        assert!(set.contains("bob"));
        assert!(set.remove("bob", "secret"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_usernames_are_ordered() {
        let mut set = CredentialSet::new();
        set.add(Credential::new("carol", "3"));
        set.add(Credential::new("alice", "1"));
        set.add(Credential::new("bob", "2"));

        assert_eq!(set.usernames().collect::<Vec<_>>(), vec!["alice", "bob", "carol"]);
        set.clear();
        assert!(!set.authenticate("alice", "1"));
    }

    #[test]
    fn test_debug_hides_password() {
        let debug = format!("{:?}", Credential::new("bob", "secret"));
        assert!(!debug.contains("secret"));
    }
}
