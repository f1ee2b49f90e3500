//! Roster assembly from item and group rows.

use xmpd_common::error::XmpdResult;

use crate::{Storage, StorageQuery};

/// One contact on a user's roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    /// Contact's bare jid.
    pub jid: String,
    /// Display name chosen by the roster owner.
    pub name: Option<String>,
    /// Subscription state name (`none`, `to`, `from`, `both`).
    pub subscription: String,
    /// Groups the contact is filed under.
    pub groups: Vec<String>,
}

/// Loads `jid`'s roster. Runs two queries; call it from a worker thread.
///
/// # Errors
///
/// Returns the backend's error, or `XmpdError::Storage` when a row lacks a required column.
pub fn load_roster(storage: &dyn Storage, jid: &str) -> XmpdResult<Vec<RosterItem>> {
    let item_rows = storage.query(&StorageQuery::RosterItems {
        jid: jid.to_owned(),
    })?;
    let group_rows = storage.query(&StorageQuery::RosterGroups {
        jid: jid.to_owned(),
    })?;

    let mut items = Vec::with_capacity(item_rows.len());
    let mut ids = Vec::with_capacity(item_rows.len());
    for row in &item_rows {
        ids.push(row.require_i64("contact_id")?);
        items.push(RosterItem {
            jid: row.require_str("jid")?.to_owned(),
            name: row.get_str("name").map(str::to_owned),
            subscription: row.require_str("subscription")?.to_owned(),
            groups: Vec::new(),
        });
    }

    for row in &group_rows {
        let contact_id = row.require_i64("contact_id")?;
        let group = row.require_str("name")?;
        if let Some(index) = ids.iter().position(|id| *id == contact_id) {
            items[index].groups.push(group.to_owned());
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::{RosterItem, load_roster};
    use crate::{MemoryStorage, Row, Storage, StorageQuery, Value};
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::{XmpdError, XmpdResult};

    #[derive(Debug)]
    struct BrokenRows;

    impl Storage for BrokenRows {
        fn query(&self, _query: &StorageQuery) -> XmpdResult<Vec<Row>> {
            Ok(vec![Row::new().with("jid", Value::Text("x@h".to_owned()))])
        }

        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[rstest]
    fn demo_roster_has_grouped_contact() {
        let storage = MemoryStorage::with_demo_users("localhost");
        let roster = load_roster(&storage, "tro@localhost").expect("roster loads");
        assert_that!(
            &roster,
            elements_are![eq(&RosterItem {
                jid: "dv@localhost".to_owned(),
                name: None,
                subscription: "both".to_owned(),
                groups: vec!["friends".to_owned()],
            })]
        );
    }

    #[rstest]
    fn unknown_owner_has_empty_roster() {
        let storage = MemoryStorage::with_demo_users("localhost");
        let roster = load_roster(&storage, "nobody@localhost").expect("roster loads");
        assert_that!(roster.is_empty(), eq(true));
    }

    #[rstest]
    fn row_without_contact_id_is_a_storage_error() {
        assert_that!(
            &load_roster(&BrokenRows, "x@h"),
            eq(&Err(XmpdError::Storage(
                "row has no integer column 'contact_id'".to_owned()
            )))
        );
    }
}
