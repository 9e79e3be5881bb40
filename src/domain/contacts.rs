//! Contact directory and entity name resolution.

use std::collections::HashMap;

/// A single contact card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    /// Given name from the structured name field.
    pub given_name: String,
    /// Preferred formatted (display) name.
    pub formatted_name: String,
}

/// Contacts indexed by phone number and email address.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    contacts: Vec<Contact>,
    by_address: HashMap<String, usize>,
}

impl ContactDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact reachable at the given addresses. An address already
    /// claimed by another contact is reassigned to this one; the displaced
    /// contact's name is returned for each such address.
    pub fn insert(
        &mut self,
        contact: Contact,
        addresses: impl IntoIterator<Item = String>,
    ) -> Vec<(String, String)> {
        let idx = self.contacts.len();
        self.contacts.push(contact);
        let mut displaced = Vec::new();
        for address in addresses {
            if let Some(old) = self.by_address.insert(address.clone(), idx) {
                if old != idx {
                    displaced.push((address, self.contacts[old].formatted_name.clone()));
                }
            }
        }
        displaced
    }

    /// Look up the contact for a phone number or email address, returning a
    /// stable identity for the card along with it.
    #[must_use]
    pub fn lookup(&self, address: &str) -> Option<(usize, &Contact)> {
        let idx = *self.by_address.get(address)?;
        Some((idx, &self.contacts[idx]))
    }

    /// Number of contact cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the directory holds no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// Identity used to group chats into entities. Contacts and raw addresses
/// live in separate key spaces so two addresses that happen to share a
/// display name are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Contact(usize),
    Address(String),
}

/// Decide which entity a chat belongs to and what it should be called.
///
/// Name priority: contact formatted name, then the chat's display name, then
/// its raw identifier.
#[must_use]
pub fn resolve_entity(
    identifier: &str,
    display_name: &str,
    contacts: Option<&ContactDirectory>,
) -> (EntityKey, String) {
    let store_name = if display_name.is_empty() {
        identifier
    } else {
        display_name
    };
    match contacts.and_then(|c| c.lookup(identifier)) {
        Some((idx, contact)) => {
            let name = if contact.formatted_name.is_empty() {
                store_name
            } else {
                &contact.formatted_name
            };
            (EntityKey::Contact(idx), name.to_string())
        }
        None => (
            EntityKey::Address(identifier.to_string()),
            store_name.to_string(),
        ),
    }
}

/// Name to show for a handle: the contact's given name when known.
#[must_use]
pub fn resolve_handle(address: &str, contacts: Option<&ContactDirectory>) -> String {
    contacts
        .and_then(|c| c.lookup(address))
        .map(|(_, contact)| contact.given_name.as_str())
        .filter(|given| !given.is_empty())
        .unwrap_or(address)
        .to_string()
}
