//! Contact directory: remote identifiers and the local aliases bound to them.
//!
//! The alias index is derived from the contact list and rebuilt inside every
//! mutation, so a reader holding the directory never sees an index that
//! disagrees with its contacts. Aliases are not checked for collisions across
//! identifiers; when two contacts share an alias, the one added last owns it
//! for [`ContactDirectory::resolve`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("contact {0} already exists")]
    DuplicateIdentifier(String),

    #[error("unknown contact {0}")]
    UnknownIdentifier(String),

    #[error("unknown alias {0}")]
    UnknownAlias(String),

    #[error("contact {0} needs at least one alias")]
    NoAliases(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    /// Display order, duplicates removed.
    pub aliases: Vec<String>,
}

pub type SharedDirectory = Arc<RwLock<ContactDirectory>>;

#[derive(Debug, Default, Clone)]
pub struct ContactDirectory {
    contacts: Vec<Contact>,
    /// alias -> identifier
    index: HashMap<String, String>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from `(identifier, aliases)` pairs in order.
    pub fn from_entries<I, A>(entries: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = (String, A)>,
        A: IntoIterator<Item = String>,
    {
        let mut directory = Self::new();
        for (id, aliases) in entries {
            directory.add_contact(id, aliases)?;
        }
        Ok(directory)
    }

    pub fn into_shared(self) -> SharedDirectory {
        Arc::new(RwLock::new(self))
    }

    pub fn add_contact(
        &mut self,
        id: impl Into<String>,
        aliases: impl IntoIterator<Item = String>,
    ) -> Result<(), DirectoryError> {
        let id = id.into();
        if self.contacts.iter().any(|contact| contact.id == id) {
            return Err(DirectoryError::DuplicateIdentifier(id));
        }

        let mut aliases_seen = BTreeSet::new();
        let aliases: Vec<String> = aliases
            .into_iter()
            .filter(|alias| aliases_seen.insert(alias.clone()))
            .collect();
        if aliases.is_empty() {
            return Err(DirectoryError::NoAliases(id));
        }

        debug!(id = %id, ?aliases, "contact added");
        self.contacts.push(Contact { id, aliases });
        self.rebuild_index();
        Ok(())
    }

    pub fn remove_contact(&mut self, id: &str) -> Result<Contact, DirectoryError> {
        let position = self
            .contacts
            .iter()
            .position(|contact| contact.id == id)
            .ok_or_else(|| DirectoryError::UnknownIdentifier(id.to_string()))?;

        let removed = self.contacts.remove(position);
        debug!(id = %id, "contact removed");
        self.rebuild_index();
        Ok(removed)
    }

    /// Swap in a whole new contact set.
    pub fn replace_all(&mut self, other: ContactDirectory) {
        *self = other;
    }

    pub fn resolve(&self, alias: &str) -> Result<&str, DirectoryError> {
        self.index
            .get(alias)
            .map(String::as_str)
            .ok_or_else(|| DirectoryError::UnknownAlias(alias.to_string()))
    }

    /// Every identifier bound to `alias`, in directory order.
    pub fn targets_of(&self, alias: &str) -> Result<Vec<String>, DirectoryError> {
        let targets: Vec<String> = self
            .contacts
            .iter()
            .filter(|contact| contact.aliases.iter().any(|a| a == alias))
            .map(|contact| contact.id.clone())
            .collect();

        if targets.is_empty() {
            return Err(DirectoryError::UnknownAlias(alias.to_string()));
        }
        Ok(targets)
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|contact| contact.id == id)
    }

    pub fn all(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn desired_ids(&self) -> BTreeSet<String> {
        self.contacts
            .iter()
            .map(|contact| contact.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for contact in &self.contacts {
            for alias in &contact.aliases {
                self.index.insert(alias.clone(), contact.id.clone());
            }
        }
    }
}
