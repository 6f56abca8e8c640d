use std::collections::{HashMap, HashSet};

use emotes_core::RemoteEmote;
use tracing::warn;

use super::index::{EmoteInput, EmoteRecord};

/// Which remote entries a subreddit pipeline is allowed to mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogFilter {
    pub sync_all: bool,
    pub subreddit_enabled: bool,
    pub include_adult: bool,
}

impl CatalogFilter {
    fn admits(&self, subreddit: &str, entry: &RemoteEmote) -> bool {
        let same_subreddit = entry.subreddit.is_empty() || entry.subreddit == subreddit;
        same_subreddit
            && (self.sync_all || self.subreddit_enabled)
            && (self.include_adult || !entry.is_adult_content)
    }
}

/// A local hash the remote catalog no longer lists. Every name of the hash
/// goes, and so does its image unless a surviving entry still uses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleHash {
    pub hash: String,
    pub image: String,
    pub remove_file: bool,
}

/// Names of one remote hash that are not stored locally yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertCandidate {
    pub entry: RemoteEmote,
    pub new_names: Vec<String>,
}

impl InsertCandidate {
    pub fn rows(&self, subreddit: &str) -> impl Iterator<Item = EmoteInput> + '_ {
        let subreddit = subreddit.to_string();
        self.new_names.iter().map(move |name| EmoteInput {
            hash: self.entry.hash.clone(),
            name: name.clone(),
            subreddit: subreddit.clone(),
            image: self.entry.image.clone(),
            animated: self.entry.is_animated,
            adult: self.entry.is_adult_content,
            delay_ms: self.entry.delay,
            frame_index: self.entry.index,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub stale_hashes: Vec<StaleHash>,
    pub stale_names: Vec<EmoteRecord>,
    pub inserts: Vec<InsertCandidate>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.stale_hashes.is_empty() && self.stale_names.is_empty() && self.inserts.is_empty()
    }
}

/// Applies `filter` and resolves collisions, keeping catalog order.
///
/// When two entries share a hash the first one wins. When a name is listed
/// under two hashes it stays with the first. Entries left without a name are
/// dropped since they would produce no rows.
pub fn prepare_catalog(
    subreddit: &str,
    entries: Vec<RemoteEmote>,
    filter: &CatalogFilter,
) -> Vec<RemoteEmote> {
    let mut by_hash: HashMap<String, String> = HashMap::new();
    let mut claimed_names: HashMap<String, String> = HashMap::new();
    let mut prepared = Vec::with_capacity(entries.len());

    for mut entry in entries {
        if !filter.admits(subreddit, &entry) {
            continue;
        }
        if let Some(first_image) = by_hash.get(&entry.hash) {
            warn!(
                subreddit,
                hash = %entry.hash,
                kept = %first_image,
                dropped = %entry.image,
                "hash collision"
            );
            continue;
        }
        by_hash.insert(entry.hash.clone(), entry.image.clone());

        let mut names = Vec::with_capacity(entry.names.len());
        for name in std::mem::take(&mut entry.names) {
            match claimed_names.get(&name) {
                Some(owner) if owner == &entry.hash => {}
                Some(owner) => {
                    warn!(subreddit, name = %name, kept = %owner, dropped = %entry.hash, "name collision");
                }
                None => {
                    claimed_names.insert(name.clone(), entry.hash.clone());
                    names.push(name);
                }
            }
        }
        if names.is_empty() {
            continue;
        }
        entry.names = names;
        prepared.push(entry);
    }
    prepared
}

/// Computes the full-subreddit diff between a prepared remote catalog and
/// the locally stored (hash, name) rows of that subreddit.
///
/// Applying the plan makes the local set equal to the remote one.
pub fn plan(remote: &[RemoteEmote], local: &[EmoteRecord]) -> ReconcilePlan {
    let mut pending: HashMap<&str, (usize, HashSet<&str>)> = remote
        .iter()
        .enumerate()
        .map(|(pos, entry)| {
            let names = entry.names.iter().map(String::as_str).collect();
            (entry.hash.as_str(), (pos, names))
        })
        .collect();
    let live_images: HashSet<&str> = remote.iter().map(|entry| entry.image.as_str()).collect();

    let mut plan = ReconcilePlan::default();
    let mut stale_seen: HashSet<&str> = HashSet::new();

    for row in local {
        match pending.get_mut(row.hash.as_str()) {
            None => {
                if stale_seen.insert(row.hash.as_str()) {
                    plan.stale_hashes.push(StaleHash {
                        hash: row.hash.clone(),
                        image: row.image.clone(),
                        remove_file: !live_images.contains(row.image.as_str()),
                    });
                }
            }
            Some((_, names)) => {
                if !names.remove(row.name.as_str()) {
                    plan.stale_names.push(row.clone());
                }
            }
        }
    }

    let mut remaining: Vec<(usize, HashSet<&str>)> = pending
        .into_values()
        .filter(|(_, names)| !names.is_empty())
        .collect();
    remaining.sort_by_key(|(pos, _)| *pos);

    for (pos, names) in remaining {
        let entry = &remote[pos];
        let new_names = entry
            .names
            .iter()
            .filter(|name| names.contains(name.as_str()))
            .cloned()
            .collect();
        plan.inserts.push(InsertCandidate {
            entry: entry.clone(),
            new_names,
        });
    }
    plan
}
