//! Read and read-write sessions over the catalogue.
//!
//! A writable session owns the `.locked` marker from [`Session::open`] until
//! [`Session::close`]. Everything it changes stays in memory until
//! [`Session::commit`] replaces `db.json` in one atomic write; a session that
//! never commits leaves the previous catalogue untouched.

use std::collections::btree_map;
use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::catalogue::{Catalogue, GroupId};
use crate::config::DEFAULT_PACKAGE_SIZE_KB;
use crate::error::{Error, Result};
use crate::packer::{chunk_limit, Entry, Packer};
use crate::storage::{Storage, StorageError};

pub const CATALOGUE_KEY: &str = "db.json";
pub const LOCK_KEY: &str = ".locked";

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    writable: bool,
    force: bool,
    package_size_kb: usize,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            writable: false,
            force: false,
            package_size_kb: DEFAULT_PACKAGE_SIZE_KB,
        }
    }

    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::read_only()
        }
    }

    /// Take the lock even if another writer appears to hold it.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Target compressed chunk size.
    pub fn package_size_kb(mut self, package_size_kb: usize) -> Self {
        self.package_size_kb = package_size_kb;
        self
    }
}

pub struct Session<'s, S: Storage> {
    storage: &'s S,
    catalogue: Catalogue,
    options: OpenOptions,
    locked: bool,
    packers: BTreeMap<GroupId, Packer>,
}

impl<'s, S: Storage> Session<'s, S> {
    pub async fn open(storage: &'s S, options: OpenOptions) -> Result<Self> {
        if options.writable {
            storage.ensure_container().await?;
            match storage.put(LOCK_KEY, &[], options.force).await {
                Ok(()) => debug!("Acquired catalogue lock"),
                Err(StorageError::AlreadyExists(_)) => return Err(Error::Locked),
                Err(e) => return Err(e.into()),
            }
        }

        let mut session = Self {
            storage,
            catalogue: Catalogue::default(),
            options,
            locked: options.writable,
            packers: BTreeMap::new(),
        };

        match session.load().await {
            Ok(catalogue) => {
                session.catalogue = catalogue;
                Ok(session)
            }
            Err(e) => {
                if let Err(unlock) = session.release().await {
                    warn!("Failed to release catalogue lock: {}", unlock);
                }
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<Catalogue> {
        match self.storage.get(CATALOGUE_KEY, true).await? {
            Some(data) => Catalogue::from_json(&data),
            None => {
                info!("No catalogue found, starting a new one");
                Ok(Catalogue::default())
            }
        }
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn catalogue_mut(&mut self) -> &mut Catalogue {
        &mut self.catalogue
    }

    pub fn storage(&self) -> &'s S {
        self.storage
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable
    }

    /// Append entries to a group's open chunk, writing every chunk that
    /// fills up on the way. Entries must belong to subscriptions of `group`.
    pub async fn pack(&mut self, group: GroupId, entries: Vec<Entry>) -> Result<usize> {
        if !self.options.writable {
            return Err(Error::ReadOnly);
        }

        let (pack_ids, latest) = match self.catalogue.group(group) {
            Some(g) => (g.pack_ids, g.latest),
            None => return Err(group_not_found(group)),
        };

        let storage = self.storage;
        let limit = chunk_limit(self.options.package_size_kb);
        let packer = match self.packers.entry(group) {
            btree_map::Entry::Occupied(slot) => slot.into_mut(),
            btree_map::Entry::Vacant(slot) => {
                let packer = match storage.get(&group.latest_key(latest), true).await? {
                    Some(data) => Packer::hydrate(pack_ids, limit, &data)?,
                    None => Packer::new(pack_ids, limit),
                };
                slot.insert(packer)
            }
        };

        let target = self
            .catalogue
            .group_mut(group)
            .ok_or_else(|| group_not_found(group))?;

        let mut sealed_count = 0;
        for entry in entries {
            let sub_id = entry.sub_id;
            let sub = target
                .subscriptions
                .get_mut(&sub_id)
                .ok_or(Error::NotFound {
                    kind: "subscription",
                    id: sub_id,
                })?;

            if let Some(sealed) = packer.append(entry, &mut sub.last_chunk)? {
                storage
                    .put(&group.chunk_key(sealed.id), &sealed.data, true)
                    .await?;
                info!(
                    "Wrote chunk {} ({} bytes)",
                    group.chunk_key(sealed.id),
                    sealed.data.len()
                );
                sealed_count += 1;
            }
        }
        *target.pack_ids = packer.sequence();

        Ok(sealed_count)
    }

    /// Write the open chunks and replace `db.json`.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.options.writable {
            return Err(Error::ReadOnly);
        }

        let storage = self.storage;
        let mut superseded = Vec::new();
        for (group, mut packer) in std::mem::take(&mut self.packers) {
            if !packer.is_dirty() {
                continue;
            }
            let target = self
                .catalogue
                .group_mut(group)
                .ok_or_else(|| group_not_found(group))?;

            // The new open chunk goes to the slot nobody reads yet.
            let old_key = group.latest_key(*target.latest);
            *target.latest = !*target.latest;
            let new_key = group.latest_key(*target.latest);

            let data = packer.seal()?;
            storage.put(&new_key, &data, true).await?;
            debug!("Wrote open chunk {} as {}", packer.sequence(), new_key);
            superseded.push(old_key);
        }

        let data = self.catalogue.to_json()?;
        storage.atomic_put(CATALOGUE_KEY, &data).await?;
        info!("Committed catalogue ({} bytes)", data.len());

        for key in superseded {
            match storage.remove(&key).await {
                Ok(()) => debug!("Removed superseded slot {}", key),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!("Failed to remove superseded slot {}: {}", key, e),
            }
        }

        Ok(())
    }

    /// Release the lock, if held.
    pub async fn close(mut self) -> Result<()> {
        self.release().await
    }

    /// Commit on success, then close either way. The first error wins.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let result = match result {
            Ok(value) => self.commit().await.map(|_| value),
            Err(e) => Err(e),
        };

        match (result, self.close().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock)) => {
                warn!("Failed to release catalogue lock: {}", unlock);
                Err(e)
            }
        }
    }

    async fn release(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;

        match self.storage.remove(LOCK_KEY).await {
            Ok(()) => {
                debug!("Released catalogue lock");
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                warn!("Catalogue lock was already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: Storage> Drop for Session<'_, S> {
    fn drop(&mut self) {
        if self.locked {
            warn!("Session dropped while holding the catalogue lock; the next writer needs --force");
        }
    }
}

fn group_not_found(group: GroupId) -> Error {
    match group {
        GroupId::Tag(id) => Error::NotFound { kind: "tag", id },
        GroupId::Root => Error::NotFound {
            kind: "group",
            id: 0,
        },
    }
}
