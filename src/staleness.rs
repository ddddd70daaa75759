use crate::collaborators::Reader;
use crate::collection::CollectionMod;
use crate::game::GameId;
use crate::patch_state::PatchState;
use anyhow::Result;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};
use tracing::{debug, info, warn};

pub const MAX_MODS_TO_CHECK: usize = 4;

type SlotKey = (GameId, String);

#[derive(Default)]
struct Slot {
    value: Mutex<Option<bool>>,
    ready: Condvar,
}

impl Slot {
    fn publish(&self, value: bool) {
        let mut guard = self.value.lock().unwrap_or_else(|err| err.into_inner());
        *guard = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> bool {
        let mut guard = self.value.lock().unwrap_or_else(|err| err.into_inner());
        loop {
            if let Some(value) = *guard {
                return value;
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(|err| err.into_inner());
        }
    }
}

/// Publishes "not stale" and drops the slot when the owner unwinds before publishing.
struct PendingSlot<'a> {
    cache: &'a StalenessCache,
    key: SlotKey,
    slot: &'a Arc<Slot>,
    published: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.slot.publish(false);
        let mut slots = self.cache.slots.lock().unwrap_or_else(|err| err.into_inner());
        if slots.get(&self.key).is_some_and(|slot| Arc::ptr_eq(slot, self.slot)) {
            slots.remove(&self.key);
        }
    }
}

/// Memoized staleness verdicts keyed by game and patch name.
///
/// The first caller for a key computes; concurrent callers block on the same slot.
/// A slot always receives a terminal value, even when the computation errors or panics.
#[derive(Default)]
pub struct StalenessCache {
    slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
}

impl StalenessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute<F>(&self, game: GameId, patch_name: &str, compute: F) -> bool
    where
        F: FnOnce() -> Result<bool>,
    {
        let key = (game, patch_name.to_string());
        let (slot, owner) = {
            let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
            match slots.get(&key) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Slot::default());
                    slots.insert(key, slot.clone());
                    (slot, true)
                }
            }
        };
        if !owner {
            return slot.wait();
        }
        let mut pending = PendingSlot {
            cache: self,
            key: (game, patch_name.to_string()),
            slot: &slot,
            published: false,
        };
        let verdict = match compute() {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(patch = patch_name, error = %err, "staleness check failed");
                false
            }
        };
        slot.publish(verdict);
        pending.published = true;
        verdict
    }

    pub fn cached(&self, game: GameId, patch_name: &str) -> Option<bool> {
        let slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        let slot = slots.get(&(game, patch_name.to_string()))?;
        let value = *slot.value.lock().unwrap_or_else(|err| err.into_inner());
        value
    }

    pub fn invalidate(&self, game: GameId, patch_name: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        slots.remove(&(game, patch_name.to_string())).is_some()
    }
}

struct EvalState<'a> {
    mod_name: &'a str,
    file_name: &'a str,
    fallback_file_name: &'a str,
    content_sha: &'a str,
}

/// True when the persisted state no longer matches the collection on disk.
pub fn patch_mod_needs_update(
    state: Option<&PatchState>,
    load_order: &[String],
    mods: &[CollectionMod],
    reader: &dyn Reader,
) -> bool {
    let Some(state) = state else {
        return false;
    };
    if state.load_order != load_order {
        info!("load order changed since the patch was saved");
        return true;
    }

    let mut groups: Vec<(&str, Vec<EvalState<'_>>)> = Vec::new();
    for definition in state.tracked_conflicts().filter(|definition| !definition.is_from_game) {
        let file_name = if definition.original_file_name.is_empty() {
            definition.file.as_str()
        } else {
            definition.original_file_name.as_str()
        };
        let entry = EvalState {
            mod_name: &definition.mod_name,
            file_name,
            fallback_file_name: &definition.file,
            content_sha: &definition.content_sha,
        };
        match groups
            .iter_mut()
            .find(|(mod_name, _)| *mod_name == definition.mod_name)
        {
            Some((_, entries)) => {
                if !entries.iter().any(|existing| existing.file_name == file_name) {
                    entries.push(entry);
                }
            }
            None => groups.push((&definition.mod_name, vec![entry])),
        }
    }
    if groups.is_empty() {
        return false;
    }

    let active: Vec<&CollectionMod> = mods
        .iter()
        .filter(|entry| load_order.contains(&entry.descriptor_file))
        .collect();
    let stale = AtomicBool::new(false);
    let next = AtomicUsize::new(0);
    let workers = groups.len().min(MAX_MODS_TO_CHECK);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if stale.load(Ordering::SeqCst) {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some((mod_name, entries)) = groups.get(index) else {
                    break;
                };
                if mod_is_stale(mod_name, entries, &active, reader, &stale) {
                    stale.store(true, Ordering::SeqCst);
                    break;
                }
            });
        }
    });
    let verdict = stale.load(Ordering::SeqCst);
    debug!(verdict, mods = groups.len(), "staleness verdict");
    verdict
}

fn mod_is_stale(
    mod_name: &str,
    entries: &[EvalState<'_>],
    active: &[&CollectionMod],
    reader: &dyn Reader,
    cancelled: &AtomicBool,
) -> bool {
    let Some(collection_mod) = active.iter().find(|entry| entry.name == mod_name) else {
        debug!(mod_name, "mod left the collection");
        return true;
    };
    for entry in entries {
        if cancelled.load(Ordering::SeqCst) {
            return false;
        }
        let info = reader
            .get_file_info(&collection_mod.full_path, entry.file_name)
            .or_else(|| reader.get_file_info(&collection_mod.full_path, entry.fallback_file_name));
        match info {
            Some(info) if info.content_sha == entry.content_sha => {}
            _ => {
                debug!(mod_name, file = entry.file_name, "mod file changed");
                return true;
            }
        }
    }
    false
}
