//! One function per user-facing operation. Each opens its own session and
//! either commits everything it changed or nothing.

use tracing::info;

use crate::catalogue::{
    Catalogue, Extern, NewSubscription, SubscriptionListing, SubscriptionPatch, Tag,
};
use crate::config::Config;
use crate::coordinator::{self, Coordinator, FetchReport};
use crate::error::{Error, Result};
use crate::history::{History, Page};
use crate::session::{OpenOptions, Session};
use crate::storage::Storage;

async fn mutate<S, T, F>(storage: &S, force: bool, f: F) -> Result<T>
where
    S: Storage,
    F: FnOnce(&mut Catalogue) -> Result<T>,
{
    let mut session = Session::open(storage, OpenOptions::writable().force(force)).await?;
    let result = f(session.catalogue_mut());
    session.finish(result).await
}

async fn read<S, T, F>(storage: &S, f: F) -> Result<T>
where
    S: Storage,
    F: FnOnce(&Catalogue) -> T,
{
    let session = Session::open(storage, OpenOptions::read_only()).await?;
    let value = f(session.catalogue());
    session.close().await?;
    Ok(value)
}

fn all_found(kind: &'static str, missing: Vec<u64>) -> Result<()> {
    match missing.first() {
        Some(&id) => Err(Error::NotFound { kind, id }),
        None => Ok(()),
    }
}

pub async fn add_subscription<S: Storage>(
    storage: &S,
    force: bool,
    new: NewSubscription,
) -> Result<u64> {
    let id = mutate(storage, force, |c| c.add_subscription(new)).await?;
    info!("Added subscription {}", id);
    Ok(id)
}

pub async fn update_subscription<S: Storage>(
    storage: &S,
    force: bool,
    id: u64,
    patch: SubscriptionPatch,
) -> Result<()> {
    mutate(storage, force, |c| c.update_subscription(id, patch)).await
}

/// Removes all of `ids` or, if any is unknown, none of them.
pub async fn remove_subscriptions<S: Storage>(storage: &S, force: bool, ids: &[u64]) -> Result<()> {
    mutate(storage, force, |c| {
        all_found("subscription", c.remove_subscriptions(ids))
    })
    .await
}

pub async fn list_subscriptions<S: Storage>(storage: &S) -> Result<Vec<SubscriptionListing>> {
    read(storage, Catalogue::list_subscriptions).await
}

pub async fn add_tag<S: Storage>(storage: &S, force: bool, name: &str) -> Result<u64> {
    mutate(storage, force, |c| c.add_tag(name)).await
}

pub async fn rename_tag<S: Storage>(storage: &S, force: bool, id: u64, name: &str) -> Result<()> {
    mutate(storage, force, |c| c.rename_tag(id, name)).await
}

pub async fn remove_tags<S: Storage>(storage: &S, force: bool, ids: &[u64]) -> Result<()> {
    mutate(storage, force, |c| {
        ids.iter().try_for_each(|id| c.remove_tag(*id))
    })
    .await
}

pub async fn list_tags<S: Storage>(storage: &S) -> Result<Vec<Tag>> {
    read(storage, |c| {
        let mut tags: Vec<Tag> = c.tags.values().cloned().collect();
        tags.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        tags
    })
    .await
}

pub async fn add_extern<S: Storage>(storage: &S, force: bool, name: &str, url: &str) -> Result<u64> {
    mutate(storage, force, |c| c.add_extern(name, url)).await
}

pub async fn update_extern<S: Storage>(
    storage: &S,
    force: bool,
    id: u64,
    name: Option<&str>,
    url: Option<&str>,
) -> Result<()> {
    mutate(storage, force, |c| c.update_extern(id, name, url)).await
}

pub async fn remove_externs<S: Storage>(storage: &S, force: bool, ids: &[u64]) -> Result<()> {
    mutate(storage, force, |c| all_found("extern", c.remove_externs(ids))).await
}

pub async fn list_externs<S: Storage>(storage: &S) -> Result<Vec<Extern>> {
    read(storage, Catalogue::list_externs).await
}

/// One complete fetch run: lock, fetch, pack, commit, unlock.
pub async fn fetch<S: Storage>(
    storage: &S,
    config: &Config,
    coordinator: &Coordinator,
    scope: Option<&str>,
) -> Result<FetchReport> {
    let options = OpenOptions::writable()
        .force(config.force)
        .package_size_kb(config.package_size_kb);
    let mut session = Session::open(storage, options).await?;
    let result = coordinator::run(&mut session, coordinator, scope).await;
    session.finish(result).await
}

/// Up to `pages` chunks of a subscription's articles, newest first.
pub async fn history<S: Storage>(storage: &S, sub_id: u64, pages: usize) -> Result<Vec<Page>> {
    let session = Session::open(storage, OpenOptions::read_only()).await?;
    let result = async {
        let catalogue = session.catalogue();
        let (group_id, sub) = catalogue.subscription(sub_id).ok_or(Error::NotFound {
            kind: "subscription",
            id: sub_id,
        })?;
        let group = catalogue
            .group(group_id)
            .ok_or_else(|| Error::Corrupt(format!("subscription {sub_id} has no group")))?;
        History::new(storage, &group)
            .walk(sub_id, sub.last_chunk, pages)
            .await
    }
    .await;
    session.close().await?;
    result
}
