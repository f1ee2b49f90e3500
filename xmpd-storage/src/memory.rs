//! In-process storage backend.

use hashbrown::HashMap;
use xmpd_common::error::XmpdResult;

use crate::{Row, Storage, StorageQuery, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Contact {
    contact_id: i64,
    jid: String,
    name: Option<String>,
    subscription: String,
    groups: Vec<String>,
}

/// Hash-map backed storage, seeded before it is shared.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    passwords: HashMap<String, String>,
    rosters: HashMap<String, Vec<Contact>>,
    next_contact_id: i64,
}

impl MemoryStorage {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with the demo accounts `tro` and `dv` (password `test`), each on the
    /// other's roster.
    #[must_use]
    pub fn with_demo_users(hostname: &str) -> Self {
        let tro = format!("tro@{hostname}");
        let dv = format!("dv@{hostname}");
        let mut storage = Self::new();
        storage.add_user("tro", "test");
        storage.add_user("dv", "test");
        storage.add_contact(&tro, &dv, None, "both", &["friends"]);
        storage.add_contact(&dv, &tro, None, "both", &[]);
        storage
    }

    /// Adds or replaces a user.
    pub fn add_user(&mut self, username: &str, password: &str) {
        let _ = self
            .passwords
            .insert(username.to_owned(), password.to_owned());
    }

    /// Adds `contact` to `owner`'s roster.
    pub fn add_contact(
        &mut self,
        owner: &str,
        contact: &str,
        name: Option<&str>,
        subscription: &str,
        groups: &[&str],
    ) {
        self.next_contact_id += 1;
        self.rosters
            .entry(owner.to_owned())
            .or_default()
            .push(Contact {
                contact_id: self.next_contact_id,
                jid: contact.to_owned(),
                name: name.map(str::to_owned),
                subscription: subscription.to_owned(),
                groups: groups.iter().map(|group| (*group).to_owned()).collect(),
            });
    }

    fn contacts(&self, jid: &str) -> &[Contact] {
        self.rosters.get(jid).map(Vec::as_slice).unwrap_or_default()
    }
}

impl Storage for MemoryStorage {
    fn query(&self, query: &StorageQuery) -> XmpdResult<Vec<Row>> {
        let rows = match query {
            StorageQuery::UserByCredentials { username, password } => self
                .passwords
                .get(username)
                .filter(|stored| *stored == password)
                .map(|_| Row::new().with("username", Value::Text(username.clone())))
                .into_iter()
                .collect(),
            StorageQuery::PasswordForUser { username } => self
                .passwords
                .get(username)
                .map(|password| Row::new().with("password", Value::Text(password.clone())))
                .into_iter()
                .collect(),
            StorageQuery::RosterItems { jid } => self
                .contacts(jid)
                .iter()
                .map(|contact| {
                    Row::new()
                        .with("contact_id", Value::Integer(contact.contact_id))
                        .with("jid", Value::Text(contact.jid.clone()))
                        .with("name", Value::from(contact.name.clone()))
                        .with("subscription", Value::Text(contact.subscription.clone()))
                })
                .collect(),
            StorageQuery::RosterGroups { jid } => self
                .contacts(jid)
                .iter()
                .flat_map(|contact| {
                    contact.groups.iter().map(|group| {
                        Row::new()
                            .with("contact_id", Value::Integer(contact.contact_id))
                            .with("name", Value::Text(group.clone()))
                    })
                })
                .collect(),
        };
        Ok(rows)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStorage;
    use crate::{Storage, StorageQuery};
    use googletest::prelude::*;
    use rstest::rstest;

    fn count(storage: &MemoryStorage, query: StorageQuery) -> usize {
        storage.query(&query).expect("memory queries succeed").len()
    }

    #[rstest]
    #[case("tro", "test", 1)]
    #[case("tro", "wrong", 0)]
    #[case("nobody", "test", 0)]
    fn credentials_must_match(#[case] username: &str, #[case] password: &str, #[case] rows: usize) {
        let storage = MemoryStorage::with_demo_users("localhost");
        let query = StorageQuery::UserByCredentials {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        assert_that!(count(&storage, query), eq(rows));
    }

    #[rstest]
    fn roster_rows_follow_insertion_order() {
        let mut storage = MemoryStorage::new();
        storage.add_contact("a@h", "b@h", Some("Bee"), "to", &["work", "pals"]);
        storage.add_contact("a@h", "c@h", None, "none", &[]);

        let items = storage
            .query(&StorageQuery::RosterItems {
                jid: "a@h".to_owned(),
            })
            .expect("memory queries succeed");
        let groups = storage
            .query(&StorageQuery::RosterGroups {
                jid: "a@h".to_owned(),
            })
            .expect("memory queries succeed");

        assert_that!(items.len(), eq(2_usize));
        assert_that!(items[0].get_str("name"), eq(Some("Bee")));
        assert_that!(items[1].get_str("name"), eq(None::<&str>));
        assert_that!(items[1].get_str("jid"), eq(Some("c@h")));
        assert_that!(groups.len(), eq(2_usize));
        assert_that!(groups[1].get_str("name"), eq(Some("pals")));
        assert_that!(
            count(&storage, StorageQuery::RosterItems { jid: "x@h".to_owned() }),
            eq(0_usize)
        );
    }
}
