// ProfileStore: in-memory profile table with snapshot reads
//
// Writers build a new map and swap it in; readers clone the current Arc
// and iterate it without holding any lock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::{log_profile_error, ProfileError};
use crate::managers::{CoreEvent, EventBus};
use crate::profile::Profile;

type ProfileTable = BTreeMap<String, Profile>;

/// Profiles keyed by name, ordered by name.
pub struct ProfileStore {
    table: RwLock<Arc<ProfileTable>>,
    events: Option<EventBus>,
}

impl ProfileStore {
    /// Store that publishes nothing
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(BTreeMap::new())),
            events: None,
        }
    }

    /// Store that publishes `ProfileListChanged` after every mutation
    pub fn with_events(events: EventBus) -> Self {
        Self {
            table: RwLock::new(Arc::new(BTreeMap::new())),
            events: Some(events),
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.snapshot()?.get(name).cloned())
    }

    /// Like `get`, but a missing profile is an error
    pub fn require(&self, name: &str) -> Result<Profile, ProfileError> {
        self.get(name)?.ok_or_else(|| ProfileError::NotFound {
            name: name.to_string(),
        })
    }

    /// Insert or replace a profile after validating it.
    pub fn upsert(&self, profile: Profile) -> Result<(), ProfileError> {
        profile.validate().inspect_err(|err| {
            log_profile_error(err, "upsert");
        })?;

        let name = profile.name.clone();
        self.mutate(|table| {
            table.insert(profile.name.clone(), profile);
        })?;
        log::info!("[ProfileStore] Upserted profile '{}'", name);
        Ok(())
    }

    /// Remove a profile; removing a missing name is not an error.
    pub fn delete(&self, name: &str) -> Result<(), ProfileError> {
        if !self.snapshot()?.contains_key(name) {
            return Ok(());
        }
        self.mutate(|table| {
            table.remove(name);
        })?;
        log::info!("[ProfileStore] Deleted profile '{}'", name);
        Ok(())
    }

    /// Name-ordered copy of every profile
    pub fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        Ok(self.snapshot()?.values().cloned().collect())
    }

    pub fn names(&self) -> Result<Vec<String>, ProfileError> {
        Ok(self.snapshot()?.keys().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, ProfileError> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ProfileError> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Immutable view of the table at this instant.
    pub fn snapshot(&self) -> Result<Arc<ProfileTable>, ProfileError> {
        self.table
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| ProfileError::StatePoisoned)
    }

    /// Every profile, for an external serializer
    pub fn export_all(&self) -> Result<Vec<Profile>, ProfileError> {
        self.list()
    }

    /// Merge profiles from an external serializer.
    ///
    /// All profiles are validated before any is inserted; one invalid
    /// entry rejects the whole batch. Later entries win on duplicate names.
    pub fn import_all<I>(&self, profiles: I) -> Result<usize, ProfileError>
    where
        I: IntoIterator<Item = Profile>,
    {
        let incoming: Vec<Profile> = profiles.into_iter().collect();
        for profile in &incoming {
            profile.validate().inspect_err(|err| {
                log_profile_error(err, "import_all");
            })?;
        }

        let count = incoming.len();
        if count == 0 {
            return Ok(0);
        }
        self.mutate(|table| {
            for profile in incoming {
                table.insert(profile.name.clone(), profile);
            }
        })?;
        log::info!("[ProfileStore] Imported {} profiles", count);
        Ok(count)
    }

    fn mutate<F>(&self, apply: F) -> Result<(), ProfileError>
    where
        F: FnOnce(&mut ProfileTable),
    {
        let names = {
            let mut guard = self
                .table
                .write()
                .map_err(|_| ProfileError::StatePoisoned)?;
            let mut next = ProfileTable::clone(&guard);
            apply(&mut next);
            let names: Vec<String> = next.keys().cloned().collect();
            *guard = Arc::new(next);
            names
        };

        if let Some(events) = &self.events {
            events.publish(CoreEvent::ProfileListChanged(names));
        }
        Ok(())
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}
