//! The catalogue: the single root document (`db.json`) holding every
//! subscription, tag group, external catalogue record and pack counter.
//!
//! Maps are keyed by id and the id is not repeated inside the record, so
//! [`Catalogue::from_json`] writes each key back into its record after
//! parsing. Counters only ever grow; an id is never handed out twice.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn first_id() -> u64 {
    1
}

/// A pack sequence: the implicit root group or one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupId {
    Root,
    Tag(u64),
}

impl GroupId {
    /// Key prefix of the group's chunks.
    pub fn prefix(&self) -> String {
        match self {
            GroupId::Root => String::new(),
            GroupId::Tag(id) => format!("{id}/"),
        }
    }

    /// Key of a sealed chunk.
    pub fn chunk_key(&self, chunk: u64) -> String {
        format!("{}{}.gz", self.prefix(), chunk)
    }

    /// Key of one of the two physical slots of the open chunk.
    pub fn latest_key(&self, latest: bool) -> String {
        format!("{}{}.gz", self.prefix(), latest)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(skip)]
    pub id: u64,
    pub title: String,
    pub url: String,
    /// Transform programs, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub programs: Vec<String>,
    /// Fingerprint of the newest entry already stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u32>,
    /// Chunk the newest stored entry was written to.
    #[serde(rename = "packid", default, skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<u64>,
    /// `Last-Modified` of the previous successful download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(skip)]
    pub id: u64,
    pub name: String,
    #[serde(rename = "packids", default = "first_id")]
    pub pack_ids: u64,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub subscriptions: BTreeMap<u64, Subscription>,
}

/// Another catalogue a reader may pull articles from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extern {
    #[serde(skip)]
    pub id: u64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch: Option<i64>,
    #[serde(rename = "subids", default = "first_id")]
    pub sub_ids: u64,
    #[serde(rename = "tagids", default = "first_id")]
    pub tag_ids: u64,
    #[serde(rename = "extids", default = "first_id")]
    pub ext_ids: u64,
    #[serde(rename = "packids", default = "first_id")]
    pub pack_ids: u64,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub subscriptions: BTreeMap<u64, Subscription>,
    #[serde(default)]
    pub tags: BTreeMap<u64, Tag>,
    #[serde(default)]
    pub externs: BTreeMap<u64, Extern>,
}

impl Default for Catalogue {
    fn default() -> Self {
        Self {
            last_fetch: None,
            sub_ids: 1,
            tag_ids: 1,
            ext_ids: 1,
            pack_ids: 1,
            latest: false,
            subscriptions: BTreeMap::new(),
            tags: BTreeMap::new(),
            externs: BTreeMap::new(),
        }
    }
}

/// Read-only view of one pack group.
#[derive(Debug, Clone, Copy)]
pub struct GroupRef<'a> {
    pub id: GroupId,
    pub name: Option<&'a str>,
    pub pack_ids: u64,
    pub latest: bool,
    pub subscriptions: &'a BTreeMap<u64, Subscription>,
}

/// Mutable view of one pack group.
#[derive(Debug)]
pub struct GroupMut<'a> {
    pub id: GroupId,
    pub pack_ids: &'a mut u64,
    pub latest: &'a mut bool,
    pub subscriptions: &'a mut BTreeMap<u64, Subscription>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub title: String,
    pub url: String,
    pub programs: Vec<String>,
    pub tag: Option<String>,
}

/// Fields left as `None` keep their current value. `tag: Some(None)` moves
/// the subscription out of any tag.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub title: Option<String>,
    pub url: Option<String>,
    pub programs: Option<Vec<String>>,
    pub tag: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionListing {
    pub id: u64,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub programs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::Invalid("title cannot be empty".to_string()));
    }
    Ok(title.to_string())
}

fn validate_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| Error::Invalid(format!("invalid url \"{raw}\": {e}")))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::Invalid(format!("url \"{raw}\" has no host")));
    }
    Ok(parsed.to_string())
}

fn clean_programs(programs: Vec<String>) -> Vec<String> {
    programs
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn validate_id(kind: &'static str, id: u64) -> Result<()> {
    if id == 0 {
        return Err(Error::Invalid(format!("{kind} id must be greater than 0")));
    }
    Ok(())
}

impl Catalogue {
    /// Parse `db.json`. An empty document is a fresh catalogue.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let mut catalogue: Catalogue =
            serde_json::from_slice(data).map_err(|e| Error::Corrupt(e.to_string()))?;
        catalogue.reconcile()?;
        Ok(catalogue)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Corrupt(e.to_string()))
    }

    /// Copy map keys into the records and check the id invariants.
    fn reconcile(&mut self) -> Result<()> {
        let mut seen = HashSet::new();

        for (id, sub) in self.subscriptions.iter_mut() {
            sub.id = *id;
            seen.insert(*id);
        }
        for (tag_id, tag) in self.tags.iter_mut() {
            tag.id = *tag_id;
            if tag.pack_ids == 0 {
                return Err(Error::Corrupt(format!("tag {tag_id} has pack counter 0")));
            }
            for (id, sub) in tag.subscriptions.iter_mut() {
                sub.id = *id;
                if !seen.insert(*id) {
                    return Err(Error::Corrupt(format!(
                        "subscription {id} appears in more than one group"
                    )));
                }
            }
        }
        for (id, ext) in self.externs.iter_mut() {
            ext.id = *id;
        }

        if self.pack_ids == 0 {
            return Err(Error::Corrupt("pack counter is 0".to_string()));
        }
        let checks = [
            ("subscription", self.sub_ids, seen.iter().max().copied()),
            ("tag", self.tag_ids, self.tags.keys().max().copied()),
            ("extern", self.ext_ids, self.externs.keys().max().copied()),
        ];
        for (kind, counter, max) in checks {
            if let Some(max) = max {
                if max == 0 || max >= counter {
                    return Err(Error::Corrupt(format!(
                        "{kind} id {max} is not below its counter {counter}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// The root group followed by every tag, in id order.
    pub fn groups(&self) -> Vec<GroupRef<'_>> {
        let mut groups = vec![GroupRef {
            id: GroupId::Root,
            name: None,
            pack_ids: self.pack_ids,
            latest: self.latest,
            subscriptions: &self.subscriptions,
        }];
        groups.extend(self.tags.values().map(|tag| GroupRef {
            id: GroupId::Tag(tag.id),
            name: Some(tag.name.as_str()),
            pack_ids: tag.pack_ids,
            latest: tag.latest,
            subscriptions: &tag.subscriptions,
        }));
        groups
    }

    pub fn group(&self, id: GroupId) -> Option<GroupRef<'_>> {
        self.groups().into_iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<GroupMut<'_>> {
        match id {
            GroupId::Root => Some(GroupMut {
                id,
                pack_ids: &mut self.pack_ids,
                latest: &mut self.latest,
                subscriptions: &mut self.subscriptions,
            }),
            GroupId::Tag(tag_id) => self.tags.get_mut(&tag_id).map(|tag| GroupMut {
                id,
                pack_ids: &mut tag.pack_ids,
                latest: &mut tag.latest,
                subscriptions: &mut tag.subscriptions,
            }),
        }
    }

    pub fn subscription(&self, id: u64) -> Option<(GroupId, &Subscription)> {
        if let Some(sub) = self.subscriptions.get(&id) {
            return Some((GroupId::Root, sub));
        }
        self.tags
            .values()
            .find_map(|tag| tag.subscriptions.get(&id).map(|s| (GroupId::Tag(tag.id), s)))
    }

    pub fn subscription_mut(&mut self, id: u64) -> Option<&mut Subscription> {
        if self.subscriptions.contains_key(&id) {
            return self.subscriptions.get_mut(&id);
        }
        self.tags
            .values_mut()
            .find_map(|tag| tag.subscriptions.get_mut(&id))
    }

    fn take_subscription(&mut self, id: u64) -> Option<Subscription> {
        if let Some(sub) = self.subscriptions.remove(&id) {
            return Some(sub);
        }
        self.tags
            .values_mut()
            .find_map(|tag| tag.subscriptions.remove(&id))
    }

    pub fn find_tag(&self, name: &str) -> Option<u64> {
        self.tags
            .values()
            .find(|tag| tag.name == name)
            .map(|tag| tag.id)
    }

    pub fn add_tag(&mut self, name: &str) -> Result<u64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Invalid("tag name cannot be empty".to_string()));
        }
        if self.find_tag(name).is_some() {
            return Err(Error::Invalid(format!("tag \"{name}\" already exists")));
        }

        let id = self.tag_ids;
        self.tag_ids += 1;
        self.tags.insert(
            id,
            Tag {
                id,
                name: name.to_string(),
                pack_ids: 1,
                latest: false,
                subscriptions: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn tag_for(&mut self, name: &str) -> Result<u64> {
        match self.find_tag(name.trim()) {
            Some(id) => Ok(id),
            None => self.add_tag(name),
        }
    }

    pub fn rename_tag(&mut self, id: u64, name: &str) -> Result<()> {
        validate_id("tag", id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Invalid("tag name cannot be empty".to_string()));
        }
        if matches!(self.find_tag(name), Some(other) if other != id) {
            return Err(Error::Invalid(format!("tag \"{name}\" already exists")));
        }
        let tag = self
            .tags
            .get_mut(&id)
            .ok_or(Error::NotFound { kind: "tag", id })?;
        tag.name = name.to_string();
        Ok(())
    }

    /// Only empty tags can be removed; their chunks stay in storage.
    pub fn remove_tag(&mut self, id: u64) -> Result<()> {
        validate_id("tag", id)?;
        let tag = self.tags.get(&id).ok_or(Error::NotFound { kind: "tag", id })?;
        if !tag.subscriptions.is_empty() {
            return Err(Error::Invalid(format!(
                "tag \"{}\" still has {} subscriptions",
                tag.name,
                tag.subscriptions.len()
            )));
        }
        self.tags.remove(&id);
        Ok(())
    }

    pub fn add_subscription(&mut self, new: NewSubscription) -> Result<u64> {
        let title = validate_title(&new.title)?;
        let url = validate_url(&new.url)?;
        let tag = match new.tag.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some(self.tag_for(name)?),
            _ => None,
        };

        let id = self.sub_ids;
        self.sub_ids += 1;

        let sub = Subscription {
            id,
            title,
            url,
            programs: clean_programs(new.programs),
            ..Default::default()
        };
        match tag {
            Some(tag_id) => {
                if let Some(tag) = self.tags.get_mut(&tag_id) {
                    tag.subscriptions.insert(id, sub);
                }
            }
            None => {
                self.subscriptions.insert(id, sub);
            }
        }
        Ok(id)
    }

    pub fn update_subscription(&mut self, id: u64, patch: SubscriptionPatch) -> Result<()> {
        validate_id("subscription", id)?;
        if self.subscription(id).is_none() {
            return Err(Error::NotFound {
                kind: "subscription",
                id,
            });
        }

        let title = patch.title.as_deref().map(validate_title).transpose()?;
        let url = patch.url.as_deref().map(validate_url).transpose()?;
        let target = match &patch.tag {
            None => None,
            Some(None) => Some(GroupId::Root),
            Some(Some(name)) if name.trim().is_empty() => Some(GroupId::Root),
            Some(Some(name)) => Some(GroupId::Tag(self.tag_for(name)?)),
        };

        if let Some(target) = target {
            let current = self.subscription(id).map(|(group, _)| group);
            if current != Some(target) {
                if let Some(mut sub) = self.take_subscription(id) {
                    // Chunk ids of the old sequence mean nothing in the new one.
                    sub.last_chunk = None;
                    if let Some(group) = self.group_mut(target) {
                        group.subscriptions.insert(id, sub);
                    }
                }
            }
        }

        let sub = self.subscription_mut(id).ok_or(Error::NotFound {
            kind: "subscription",
            id,
        })?;
        if let Some(title) = title {
            sub.title = title;
        }
        if let Some(url) = url {
            if url != sub.url {
                sub.last_modified = None;
            }
            sub.url = url;
        }
        if let Some(programs) = patch.programs {
            sub.programs = clean_programs(programs);
        }
        Ok(())
    }

    /// Remove subscriptions, returning the ids that did not exist.
    pub fn remove_subscriptions(&mut self, ids: &[u64]) -> Vec<u64> {
        ids.iter()
            .copied()
            .filter(|id| self.take_subscription(*id).is_none())
            .collect()
    }

    /// All subscriptions sorted by title, case-insensitively.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionListing> {
        let mut listing: Vec<SubscriptionListing> = self
            .groups()
            .into_iter()
            .flat_map(|group| {
                group.subscriptions.values().map(move |sub| SubscriptionListing {
                    id: sub.id,
                    title: sub.title.clone(),
                    url: sub.url.clone(),
                    tag: group.name.map(str::to_string),
                    programs: sub.programs.clone(),
                    error: sub.error.clone(),
                })
            })
            .collect();
        listing.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        listing
    }

    pub fn add_extern(&mut self, name: &str, url: &str) -> Result<u64> {
        let name = validate_title(name)?;
        let url = validate_url(url)?;

        let id = self.ext_ids;
        self.ext_ids += 1;
        self.externs.insert(id, Extern { id, name, url });
        Ok(id)
    }

    pub fn update_extern(&mut self, id: u64, name: Option<&str>, url: Option<&str>) -> Result<()> {
        validate_id("extern", id)?;
        let name = name.map(validate_title).transpose()?;
        let url = url.map(validate_url).transpose()?;
        let ext = self
            .externs
            .get_mut(&id)
            .ok_or(Error::NotFound { kind: "extern", id })?;
        if let Some(name) = name {
            ext.name = name;
        }
        if let Some(url) = url {
            ext.url = url;
        }
        Ok(())
    }

    /// Remove externs, returning the ids that did not exist.
    pub fn remove_externs(&mut self, ids: &[u64]) -> Vec<u64> {
        ids.iter()
            .copied()
            .filter(|id| self.externs.remove(id).is_none())
            .collect()
    }

    pub fn list_externs(&self) -> Vec<Extern> {
        let mut externs: Vec<Extern> = self.externs.values().cloned().collect();
        externs.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        externs
    }
}
