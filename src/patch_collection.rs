use crate::collaborators::{Collaborators, ExportRequest, ParseArgs};
use crate::collection::{CollectionContext, PatchLocation, MOD_DIRECTORY};
use crate::conflicts::{ConflictDetector, ConflictResult, PatchStateMode};
use crate::definition::{Definition, ValueType};
use crate::error::EngineError;
use crate::game::GameId;
use crate::ignore;
use crate::indexed::IndexedDefinitions;
use crate::patch_state::PatchState;
use crate::priority::{PriorityResolver, PriorityResult};
use crate::progress::{ProgressCallback, ProgressStage, ProgressTracker};
use crate::staleness::{patch_mod_needs_update, StalenessCache};
use anyhow::Result;
use rayon::prelude::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportKind {
    Resolved,
    Ignored,
    Custom,
}

type LockKey = (GameId, String);

/// Conflict analysis and patch-mod maintenance for mod collections.
///
/// Every mutating operation takes the collection's lock for its whole
/// purge/export/save sequence, so two actions on the same collection never
/// interleave their file writes. Different collections proceed independently.
pub struct PatchCollectionService {
    pub(crate) collaborators: Collaborators,
    staleness: StalenessCache,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    mods_applied: AtomicBool,
}

impl PatchCollectionService {
    pub fn new(collaborators: Collaborators) -> Self {
        PatchCollectionService {
            collaborators,
            staleness: StalenessCache::new(),
            locks: Mutex::new(HashMap::new()),
            mods_applied: AtomicBool::new(false),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn collection_lock(&self, ctx: &CollectionContext) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((ctx.game, ctx.collection_name.clone()))
            .or_default()
            .clone()
    }

    pub fn is_patch_mod(&self, ctx: &CollectionContext, mod_name: &str) -> bool {
        ctx.is_patch_mod(mod_name)
    }

    // --- analysis ---

    /// Reads and parses every mod of the collection. `None` for an empty collection.
    ///
    /// Files that fail to parse are replaced by the user's custom code for them
    /// when the patch state holds some.
    pub fn get_mod_objects(
        &self,
        ctx: &CollectionContext,
        progress: Option<ProgressCallback>,
    ) -> Result<Option<IndexedDefinitions>> {
        if ctx.mods.is_empty() {
            return Ok(None);
        }
        info!(collection = %ctx.collection_name, mods = ctx.mods.len(), "parsing mods");
        let tracker = ProgressTracker::new(ProgressStage::Parse, ctx.mods.len(), 99.9, progress);
        let parser = &self.collaborators.parser;
        let reader = &self.collaborators.reader;
        let definitions: Vec<Definition> = ctx
            .mods
            .par_iter()
            .flat_map_iter(|entry| {
                let parsed: Vec<Definition> = reader
                    .read(&entry.full_path, ctx.game)
                    .into_iter()
                    .flat_map(|info| {
                        parser.parse(ParseArgs {
                            file: &info.file_name,
                            lines: &info.content,
                            content_sha: &info.content_sha,
                            mod_name: &entry.name,
                            dependencies: &entry.dependencies,
                            game: ctx.game,
                            is_binary: info.is_binary,
                        })
                    })
                    .collect();
                tracker.advance(1);
                parsed
            })
            .collect();

        let state = self
            .collaborators
            .patch_exporter
            .get_patch_state(&ctx.patch_location(), true)?;
        let definitions = match state {
            Some(state) if !state.custom_conflicts.is_empty() => {
                self.replace_invalid(ctx, definitions, &state)
            }
            _ => definitions,
        };
        debug!(definitions = definitions.len(), "parsed collection");
        let indexed = IndexedDefinitions::from_definitions(definitions, false);
        tracker.finish();
        Ok(Some(indexed))
    }

    fn replace_invalid(
        &self,
        ctx: &CollectionContext,
        definitions: Vec<Definition>,
        state: &PatchState,
    ) -> Vec<Definition> {
        let custom = IndexedDefinitions::from_definitions(state.custom_conflicts.clone(), false);
        let mut pruned = Vec::with_capacity(definitions.len());
        for item in definitions {
            if item.value_type != ValueType::Invalid {
                pruned.push(item);
                continue;
            }
            let mut replacements = Vec::new();
            for file_code in custom.get_by_file(&item.file) {
                let Some(history) = state.history_for(&file_code.type_and_id()) else {
                    continue;
                };
                if history.code.trim().is_empty() {
                    continue;
                }
                let lines: Vec<String> = history.code.lines().map(|line| line.to_string()).collect();
                replacements.extend(self.collaborators.parser.parse(ParseArgs {
                    file: &item.file,
                    lines: &lines,
                    content_sha: &item.content_sha,
                    mod_name: &item.mod_name,
                    dependencies: &item.dependencies,
                    game: ctx.game,
                    is_binary: false,
                }));
            }
            if replacements.is_empty() {
                pruned.push(item);
            } else {
                debug!(file = %item.file, "replaced invalid file with custom code");
                for replacement in &mut replacements {
                    replacement.is_custom_patch = true;
                }
                pruned.extend(replacements);
            }
        }
        pruned
    }

    pub fn find_conflicts(
        &self,
        ctx: &CollectionContext,
        definitions: IndexedDefinitions,
        mode: PatchStateMode,
        progress: Option<ProgressCallback>,
    ) -> ConflictResult {
        let mod_order = ctx.mod_order();
        ConflictDetector::new(ctx.game, &mod_order, mode)
            .with_progress(progress)
            .find_conflicts(definitions)
    }

    pub fn eval_definition_priority<'a>(
        &self,
        ctx: &CollectionContext,
        definitions: &[&'a Definition],
    ) -> PriorityResult<'a> {
        let mod_order = ctx.mod_order();
        PriorityResolver::new(ctx.game, &mod_order).eval(definitions)
    }

    // --- resolution ---

    pub fn apply_mod_patch(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        definition: Definition,
    ) -> Result<bool> {
        self.export_mod_patch_definition(ctx, result, definition, ExportKind::Resolved)
    }

    pub fn ignore_mod_patch(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        definition: Definition,
    ) -> Result<bool> {
        self.export_mod_patch_definition(ctx, result, definition, ExportKind::Ignored)
    }

    /// Stores user-written code for an entity; it is attributed to the patch mod.
    pub fn add_custom_mod_patch(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        mut definition: Definition,
    ) -> Result<bool> {
        definition.mod_name = ctx.patch_name();
        self.export_mod_patch_definition(ctx, result, definition, ExportKind::Custom)
    }

    pub fn reset_resolved_conflict(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        type_and_id: &str,
    ) -> Result<bool> {
        self.unresolve_conflict(ctx, result, type_and_id, ExportKind::Resolved)
    }

    pub fn reset_ignored_conflict(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        type_and_id: &str,
    ) -> Result<bool> {
        self.unresolve_conflict(ctx, result, type_and_id, ExportKind::Ignored)
    }

    pub fn reset_custom_conflict(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        type_and_id: &str,
    ) -> Result<bool> {
        self.unresolve_conflict(ctx, result, type_and_id, ExportKind::Custom)
    }

    fn export_mod_patch_definition(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        mut definition: Definition,
        kind: ExportKind,
    ) -> Result<bool> {
        require_name(ctx)?;
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.ensure_patch_mod(ctx)?;
        if !definition.is_from_game && ctx.mod_path(&definition.mod_name).is_none() {
            warn!(mod_name = %definition.mod_name, "definition mod is not part of the collection");
            return Ok(false);
        }

        let rules = ctx.game.rules();
        let overwritten: Option<Definition> = result
            .overwritten_conflicts
            .get_by_type_and_id(&definition.type_and_id())
            .first()
            .map(|item| (*item).clone());
        if kind != ExportKind::Ignored {
            definition.disk_file = rules.disk_file_name(&definition);
            if definition.value_type == ValueType::OverwrittenObject {
                if let Some(overwritten) = &overwritten {
                    definition.order = overwritten.order;
                }
            }
        }

        let mut export = Vec::new();
        match kind {
            ExportKind::Ignored => {
                result.ignored_conflicts.add_to_map(definition, true);
            }
            ExportKind::Custom => {
                result.custom_conflicts.add_to_map(definition.clone(), true);
                export.push(definition);
            }
            ExportKind::Resolved => {
                result.resolved_conflicts.add_to_map(definition.clone(), true);
                export.push(definition);
            }
        }

        let location = ctx.patch_location();
        let mut exported = false;
        if !export.is_empty() {
            ctx.populate_mod_path(&mut export);
            let request = if kind == ExportKind::Custom {
                ExportRequest {
                    game: ctx.game,
                    custom: &export,
                    ..Default::default()
                }
            } else {
                ExportRequest {
                    game: ctx.game,
                    definitions: &export,
                    ..Default::default()
                }
            };
            exported = self
                .collaborators
                .patch_exporter
                .export_definition(&location, &request)?;
            if exported {
                if let Some(overwritten) = &overwritten {
                    if overwritten.disk_file_ci() != export[0].disk_file_ci() {
                        self.collaborators
                            .mod_writer
                            .purge_mod_directory(&location.patch_dir(), Some(&overwritten.disk_file))?;
                    }
                }
            }
        }

        let saved = self.save_state(ctx, result)?;
        info!(
            patch = %location.patch_name,
            action = ?kind,
            exported,
            "recorded conflict resolution"
        );
        Ok(if export.is_empty() { saved } else { exported && saved })
    }

    fn unresolve_conflict(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        type_and_id: &str,
        kind: ExportKind,
    ) -> Result<bool> {
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed: Vec<Definition> = {
            let index = match kind {
                ExportKind::Ignored => &mut result.ignored_conflicts,
                ExportKind::Custom => &mut result.custom_conflicts,
                ExportKind::Resolved => &mut result.resolved_conflicts,
            };
            index
                .ids_by_type_and_id(type_and_id)
                .into_iter()
                .filter_map(|id| index.remove_id(id))
                .collect()
        };
        if removed.is_empty() {
            return Ok(false);
        }

        if kind != ExportKind::Ignored {
            let location = ctx.patch_location();
            let patch_dir = location.patch_dir();
            let writer = &self.collaborators.mod_writer;
            for item in &removed {
                writer.purge_mod_directory(&patch_dir, Some(&item.file))?;
                if !item.disk_file.is_empty() && item.disk_file != item.file {
                    writer.purge_mod_directory(&patch_dir, Some(&item.disk_file))?;
                }
                if !item.value_type.is_overwritten() {
                    continue;
                }
                let mut restore: Vec<Definition> = result
                    .overwritten_conflicts
                    .get_by_type_and_id(type_and_id)
                    .into_iter()
                    .filter(|entry| {
                        result
                            .resolved_conflicts
                            .get_by_type_and_id(&entry.type_and_id())
                            .is_empty()
                    })
                    .cloned()
                    .collect();
                if restore.is_empty() {
                    continue;
                }
                ctx.populate_mod_path(&mut restore);
                self.collaborators.patch_exporter.export_definition(
                    &location,
                    &ExportRequest {
                        game: ctx.game,
                        overwritten: &restore,
                        ..Default::default()
                    },
                )?;
            }
        }

        self.ensure_patch_mod(ctx)?;
        debug!(type_and_id, action = ?kind, "reset conflict resolution");
        self.save_state(ctx, result)
    }

    /// Creates the patch mod on first use and activates it once per process.
    pub(crate) fn ensure_patch_mod(&self, ctx: &CollectionContext) -> Result<()> {
        let writer = &self.collaborators.mod_writer;
        let descriptor = ctx.patch_descriptor();
        if !writer.mod_directory_exists(&descriptor.full_path) {
            writer.create_mod_directory(&ctx.user_dir, Some(MOD_DIRECTORY))?;
            writer.create_mod_directory(&descriptor.full_path, None)?;
            writer.write_descriptor(&ctx.user_dir, &descriptor)?;
            info!(patch = %descriptor.name, "created patch mod");
        }
        if !self.mods_applied.load(Ordering::SeqCst) {
            writer.apply_mods(&ctx.user_dir, std::slice::from_ref(&descriptor))?;
            self.mods_applied.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Forgets that the patch mod was activated, so the next export activates it again.
    pub fn reset_patch_state_cache(&self) -> bool {
        self.mods_applied.store(false, Ordering::SeqCst);
        true
    }

    pub(crate) fn save_state(&self, ctx: &CollectionContext, result: &ConflictResult) -> Result<bool> {
        let state = PatchState::from_result(result, ctx.load_order());
        let saved = self
            .collaborators
            .patch_exporter
            .save_state(&ctx.patch_location(), state)?;
        self.staleness.invalidate(ctx.game, &ctx.patch_name());
        Ok(saved)
    }

    // --- ignore rules ---

    /// Re-evaluates the ignore rules and persists them with the rest of the state.
    pub fn save_ignored_paths(&self, ctx: &CollectionContext, result: &mut ConflictResult) -> Result<bool> {
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        ignore::eval_mod_ignore_definitions(result, &ctx.mod_order());
        self.save_state(ctx, result)
    }

    pub fn add_mods_to_ignore_list(&self, result: &mut ConflictResult, mods: &[String]) {
        ignore::add_mods_to_ignore_list(result, mods);
    }

    pub fn get_ignored_mods(&self, result: &ConflictResult) -> Vec<String> {
        ignore::get_ignored_mods(result)
    }

    pub fn should_ignore_game_mods(&self, result: &ConflictResult) -> bool {
        ignore::should_ignore_game_mods(result)
    }

    pub fn should_show_self_conflicts(&self, result: &ConflictResult) -> bool {
        ignore::should_show_self_conflicts(result)
    }

    pub fn toggle_ignore_game_mods(&self, result: &mut ConflictResult) -> bool {
        ignore::toggle_ignore_game_mods(result)
    }

    pub fn toggle_self_mod_conflicts(&self, result: &mut ConflictResult) -> bool {
        ignore::toggle_self_mod_conflicts(result)
    }

    // --- patch state queries ---

    /// A copy of `copy` owned by the patch mod, carrying the last saved code for it.
    pub fn create_patch_definition(&self, ctx: &CollectionContext, copy: &Definition) -> Result<Definition> {
        require_name(ctx)?;
        let mut patch = copy.clone();
        patch.mod_name = ctx.patch_name();
        let state = self
            .collaborators
            .patch_exporter
            .get_patch_state(&ctx.patch_location(), true)?;
        if let Some(history) = state.as_ref().and_then(|state| state.history_for(&copy.type_and_id())) {
            patch.code = history.code.clone();
        }
        Ok(patch)
    }

    /// Exported text of a definition, or empty when the patch has no such file.
    pub fn load_definition_contents(&self, ctx: &CollectionContext, definition: &Definition) -> Result<String> {
        let location = ctx.patch_location();
        let exporter = &self.collaborators.patch_exporter;
        if !definition.disk_file.is_empty() {
            let contents = exporter.load_definition_contents(&location, &definition.disk_file)?;
            if !contents.is_empty() {
                return Ok(contents);
            }
        }
        exporter.load_definition_contents(&location, &definition.file)
    }

    pub fn get_patch_state_mode(&self, ctx: &CollectionContext) -> Result<PatchStateMode> {
        let state = self
            .collaborators
            .patch_exporter
            .get_patch_state(&ctx.patch_location(), false)?;
        Ok(state.map_or(PatchStateMode::None, |state| state.mode))
    }

    pub fn patch_has_game_definitions(&self, ctx: &CollectionContext) -> Result<bool> {
        let state = self
            .collaborators
            .patch_exporter
            .get_patch_state(&ctx.patch_location(), false)?;
        Ok(state.is_some_and(|state| state.has_game_definitions))
    }

    /// True when the saved patch no longer matches the collection. The verdict is
    /// cached per patch until [`Self::invalidate_patch_mod_state`] or the next save.
    pub fn patch_mod_needs_update(&self, ctx: &CollectionContext) -> bool {
        let location = ctx.patch_location();
        self.staleness.get_or_compute(ctx.game, &location.patch_name, || {
            let state = self
                .collaborators
                .patch_exporter
                .get_patch_state(&location, false)?;
            Ok(patch_mod_needs_update(
                state.as_ref(),
                &ctx.load_order(),
                &ctx.mods,
                self.collaborators.reader.as_ref(),
            ))
        })
    }

    pub fn invalidate_patch_mod_state(&self, ctx: &CollectionContext) -> bool {
        self.staleness.invalidate(ctx.game, &ctx.patch_name());
        true
    }

    // --- patch mod lifecycle ---

    /// Removes the patch mod and its descriptor.
    pub fn clean_patch_collection(&self, ctx: &CollectionContext) -> Result<bool> {
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = &self.collaborators.mod_writer;
        let descriptor = ctx.patch_descriptor();
        writer.delete_descriptor(&ctx.user_dir, &descriptor)?;
        let purged = writer.purge_mod_directory(&descriptor.full_path, None)?;
        self.staleness.invalidate(ctx.game, &descriptor.name);
        info!(patch = %descriptor.name, purged, "cleaned patch mod");
        Ok(purged)
    }

    pub fn copy_patch_collection(&self, ctx: &CollectionContext, new_name: &str) -> Result<bool> {
        let target = renamed(ctx, new_name)?;
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let copied = self
            .collaborators
            .patch_exporter
            .copy_patch_mod(&ctx.patch_location(), &target.patch_location())?;
        if copied {
            self.collaborators
                .mod_writer
                .write_descriptor(&target.user_dir, &target.patch_descriptor())?;
        }
        Ok(copied)
    }

    pub fn rename_patch_collection(&self, ctx: &CollectionContext, new_name: &str) -> Result<bool> {
        let target = renamed(ctx, new_name)?;
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let from: PatchLocation = ctx.patch_location();
        let renamed = self
            .collaborators
            .patch_exporter
            .rename_patch_mod(&from, &target.patch_location())?;
        if renamed {
            let writer = &self.collaborators.mod_writer;
            writer.delete_descriptor(&ctx.user_dir, &ctx.patch_descriptor())?;
            writer.write_descriptor(&target.user_dir, &target.patch_descriptor())?;
            self.staleness.invalidate(ctx.game, &from.patch_name);
        }
        Ok(renamed)
    }
}

pub(crate) fn require_name(ctx: &CollectionContext) -> Result<()> {
    if ctx.collection_name.trim().is_empty() {
        return Err(EngineError::InvalidState("collection has no name".to_string()).into());
    }
    Ok(())
}

fn renamed(ctx: &CollectionContext, new_name: &str) -> Result<CollectionContext> {
    require_name(ctx)?;
    if new_name.trim().is_empty() || new_name == ctx.collection_name {
        return Err(EngineError::InvalidState(format!(
            "cannot move patch of {} to {new_name:?}",
            ctx.collection_name
        ))
        .into());
    }
    let mut target = ctx.clone();
    target.collection_name = new_name.to_string();
    Ok(target)
}
