use crate::collaborators::ExportRequest;
use crate::collection::CollectionContext;
use crate::conflicts::ConflictResult;
use crate::definition::{Definition, ValueType};
use crate::ignore::eval_mod_ignore_definitions;
use crate::indexed::{group_ordered, IndexedDefinitions};
use crate::patch_collection::{require_name, PatchCollectionService};
use crate::patch_state::PatchState;
use crate::progress::{ProgressCallback, ProgressStage, ProgressTracker};
use anyhow::Result;
use std::{
    collections::BTreeSet,
    path::Path,
    slice,
    sync::PoisonError,
};
use tracing::{debug, info};

impl PatchCollectionService {
    /// Brings the patch mod in line with a fresh analysis.
    ///
    /// Without saved state the overwritten and orphan conflicts are exported
    /// straight away. With saved state every cached group is compared against the
    /// new analysis; changed groups lose their exported files and resolutions.
    /// Patch files nothing refers to any more are removed in both cases.
    pub fn initialize_patch_state(
        &self,
        ctx: &CollectionContext,
        result: ConflictResult,
        progress: Option<ProgressCallback>,
    ) -> Result<ConflictResult> {
        require_name(ctx)?;
        let lock = self.collection_lock(ctx);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let location = ctx.patch_location();
        let exporter = &self.collaborators.patch_exporter;
        let state = exporter.get_patch_state(&location, true)?;
        let patch_files = exporter.get_patch_files(&location);
        let cleaned = self.clean_overwritten_directories(ctx, &result)?;

        let mut total = patch_files.len() + result.all_conflicts.len() + result.overwritten_conflicts.len();
        if let Some(state) = &state {
            total += state.conflicts.len()
                + state.orphan_conflicts.len()
                + state.overwritten_conflicts.len() * 2
                + 1;
        }
        let tracker = ProgressTracker::new(ProgressStage::PatchSync, total, 99.9, progress);
        tracker.publish(0.0);

        let synced = match state {
            Some(state) => self.reconcile(ctx, result, state, &patch_files, &cleaned, &tracker)?,
            None => self.cold_start(ctx, result, &patch_files, &tracker)?,
        };
        tracker.finish();
        Ok(synced)
    }

    fn cold_start(
        &self,
        ctx: &CollectionContext,
        mut result: ConflictResult,
        patch_files: &[String],
        tracker: &ProgressTracker,
    ) -> Result<ConflictResult> {
        info!(patch = %ctx.patch_name(), "no saved patch state");
        self.sync_patch_files(ctx, &result, patch_files, tracker)?;
        let orphans = pending_orphans(&result);
        if !result.overwritten_conflicts.is_empty() || !orphans.is_empty() {
            self.ensure_patch_mod(ctx)?;
        }
        let mut exported = self.export_overwritten(ctx, &result, None, tracker)?;
        exported |= self.export_orphans(ctx, &mut result, orphans)?;
        eval_mod_ignore_definitions(&mut result, &ctx.mod_order());
        if exported {
            self.save_state(ctx, &result)?;
        }
        Ok(result)
    }

    fn reconcile(
        &self,
        ctx: &CollectionContext,
        result: ConflictResult,
        state: PatchState,
        patch_files: &[String],
        cleaned: &BTreeSet<String>,
        tracker: &ProgressTracker,
    ) -> Result<ConflictResult> {
        let patch_dir = ctx.patch_location().patch_dir();
        let mut resolved = state.resolved_conflicts.clone();
        let mut ignored: Vec<Definition> = Vec::new();
        let mut dropped = 0usize;

        for (cached, current) in [
            (&state.conflicts, &result.conflicts),
            (&state.orphan_conflicts, &result.orphan_conflicts),
        ] {
            for (type_and_id, group) in group_by_type_and_id(cached) {
                tracker.advance(group.len());
                let matched = current.get_by_type_and_id(&type_and_id);
                if is_cached_definition_different(&matched, &group) {
                    let files = resolved_files(&state.resolved_conflicts, &type_and_id);
                    self.purge_files(&patch_dir, &files)?;
                    resolved.retain(|item| item.type_and_id().to_lowercase() != type_and_id);
                    dropped += 1;
                } else {
                    ignored.extend(
                        state
                            .ignored_conflicts
                            .iter()
                            .filter(|item| item.type_and_id().to_lowercase() == type_and_id)
                            .cloned(),
                    );
                }
            }
        }

        for (type_and_id, group) in group_by_type_and_id(&state.overwritten_conflicts) {
            tracker.advance(group.len());
            let mut files: Vec<String> = group
                .iter()
                .flat_map(|item| item.overwritten_file_names.iter().cloned())
                .collect();
            files.extend(
                group
                    .iter()
                    .filter(|item| !item.disk_file.trim().is_empty())
                    .map(|item| item.disk_file.clone()),
            );
            let kept = resolved_files(&state.resolved_conflicts, &type_and_id);
            files.retain(|file| !kept.iter().any(|name| name.eq_ignore_ascii_case(file)));
            let matched = result.overwritten_conflicts.get_by_type_and_id(&type_and_id);
            if is_cached_definition_different(&matched, &group) {
                self.purge_files(&patch_dir, &files)?;
            }
        }

        let resolved = IndexedDefinitions::from_definitions(resolved, true);
        self.export_overwritten(ctx, &result, Some((&resolved, &state)), tracker)?;
        tracker.advance(1);

        let custom = IndexedDefinitions::from_definitions(state.custom_conflicts.clone(), true);
        self.restore_custom(ctx, &custom, cleaned, &state)?;

        let mut synced = ConflictResult {
            all_conflicts: result.all_conflicts,
            conflicts: result.conflicts,
            orphan_conflicts: result.orphan_conflicts,
            resolved_conflicts: resolved,
            ignored_conflicts: IndexedDefinitions::from_definitions(ignored, true),
            rule_ignored_conflicts: IndexedDefinitions::from_definitions(Vec::new(), true),
            overwritten_conflicts: result.overwritten_conflicts,
            custom_conflicts: custom,
            ignored_paths: state.ignore_conflict_paths.clone(),
            mode: result.mode,
        };
        self.resolve_orphans(ctx, &mut synced)?;
        eval_mod_ignore_definitions(&mut synced, &ctx.mod_order());
        self.sync_patch_files(ctx, &synced, patch_files, tracker)?;
        self.save_state(ctx, &synced)?;
        info!(
            patch = %ctx.patch_name(),
            dropped,
            resolved = synced.resolved_conflicts.len(),
            "reconciled patch state"
        );
        Ok(synced)
    }

    /// Overwritten objects are rewritten from scratch, so their directories start empty.
    fn clean_overwritten_directories(
        &self,
        ctx: &CollectionContext,
        result: &ConflictResult,
    ) -> Result<BTreeSet<String>> {
        let directories: BTreeSet<String> = result
            .overwritten_conflicts
            .get_all()
            .into_iter()
            .map(|definition| definition.parent_directory().to_string())
            .filter(|directory| !directory.is_empty())
            .collect();
        let patch_dir = ctx.patch_location().patch_dir();
        for directory in &directories {
            self.collaborators
                .mod_writer
                .purge_mod_directory(&patch_dir, Some(directory))?;
        }
        Ok(directories.into_iter().map(|dir| dir.to_lowercase()).collect())
    }

    /// Writes every overwritten winner, substituting the user's resolution when one exists.
    fn export_overwritten(
        &self,
        ctx: &CollectionContext,
        result: &ConflictResult,
        saved: Option<(&IndexedDefinitions, &PatchState)>,
        tracker: &ProgressTracker,
    ) -> Result<bool> {
        let location = ctx.patch_location();
        let mut exported = false;
        for item in result.overwritten_conflicts.get_all() {
            let resolution = match saved {
                Some((resolved, _)) => resolved.get_by_type_and_id(&item.type_and_id()).first().copied(),
                None => result
                    .resolved_conflicts
                    .get_by_type_and_id(&item.type_and_id())
                    .first()
                    .copied(),
            };
            let mut definition = match resolution {
                Some(resolution) => {
                    let mut definition = resolution.clone();
                    definition.order = item.order;
                    definition.disk_file = item.disk_file.clone();
                    definition.file = item.file.clone();
                    definition.overwritten_file_names = item.overwritten_file_names.clone();
                    if let Some((_, state)) = saved {
                        if let Some(history) = state.history_for(&definition.type_and_id()) {
                            definition.code = history.code.clone();
                        }
                    }
                    definition
                }
                None => item.clone(),
            };
            ctx.populate_mod_path(slice::from_mut(&mut definition));
            exported |= self.collaborators.patch_exporter.export_definition(
                &location,
                &ExportRequest {
                    game: ctx.game,
                    overwritten: slice::from_ref(&definition),
                    ..Default::default()
                },
            )?;
            tracker.advance(1);
        }
        Ok(exported)
    }

    /// Custom code living in a cleaned directory is written again.
    fn restore_custom(
        &self,
        ctx: &CollectionContext,
        custom: &IndexedDefinitions,
        cleaned: &BTreeSet<String>,
        state: &PatchState,
    ) -> Result<()> {
        if cleaned.is_empty() {
            return Ok(());
        }
        let mut restore: Vec<Definition> = custom
            .get_all()
            .into_iter()
            .filter(|definition| cleaned.contains(&definition.parent_directory_ci()))
            .map(|definition| {
                let mut definition = definition.clone();
                if let Some(history) = state.history_for(&definition.type_and_id()) {
                    definition.code = history.code.clone();
                }
                definition
            })
            .collect();
        if restore.is_empty() {
            return Ok(());
        }
        ctx.populate_mod_path(&mut restore);
        self.collaborators.patch_exporter.export_definition(
            &ctx.patch_location(),
            &ExportRequest {
                game: ctx.game,
                custom: &restore,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn resolve_orphans(&self, ctx: &CollectionContext, result: &mut ConflictResult) -> Result<bool> {
        let orphans = pending_orphans(result);
        self.export_orphans(ctx, result, orphans)
    }

    /// Exports orphans nobody acted on yet and records them as resolved.
    fn export_orphans(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        mut orphans: Vec<Definition>,
    ) -> Result<bool> {
        let rules = ctx.game.rules();
        if orphans.is_empty() {
            return Ok(false);
        }
        for orphan in &mut orphans {
            orphan.disk_file = rules.disk_file_name(orphan);
        }
        ctx.populate_mod_path(&mut orphans);
        let exported = self.collaborators.patch_exporter.export_definition(
            &ctx.patch_location(),
            &ExportRequest {
                game: ctx.game,
                definitions: &orphans,
                ..Default::default()
            },
        )?;
        debug!(orphans = orphans.len(), exported, "resolved orphan conflicts");
        for orphan in orphans {
            result.resolved_conflicts.add_to_map(orphan, true);
        }
        Ok(exported)
    }

    /// Removes patch files that no partition refers to.
    fn sync_patch_files(
        &self,
        ctx: &CollectionContext,
        result: &ConflictResult,
        patch_files: &[String],
        tracker: &ProgressTracker,
    ) -> Result<()> {
        let patch_dir = ctx.patch_location().patch_dir();
        let writer = &self.collaborators.mod_writer;
        let mut seen = BTreeSet::new();
        for file in patch_files {
            tracker.advance(1);
            if !seen.insert(file.to_lowercase()) {
                continue;
            }
            let referenced = result.custom_conflicts.exists_by_file(file)
                || result.overwritten_conflicts.exists_by_file(file)
                || result.resolved_conflicts.exists_by_file(file);
            if !referenced && writer.purge_mod_directory(&patch_dir, Some(file))? {
                debug!(file = %file, "purged stale patch file");
                continue;
            }
            let Some(resolved) = result.resolved_conflicts.get_by_disk_file(file).first().copied() else {
                continue;
            };
            let overwritten = result
                .overwritten_conflicts
                .get_by_type_and_id(&resolved.type_and_id());
            if let Some(overwritten) = overwritten.first() {
                if overwritten.disk_file_ci() != resolved.disk_file_ci() {
                    writer.purge_mod_directory(&patch_dir, Some(&overwritten.disk_file))?;
                }
            }
        }
        Ok(())
    }

    fn purge_files(&self, patch_dir: &Path, files: &[String]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for file in files {
            if seen.insert(file.as_str()) {
                self.collaborators
                    .mod_writer
                    .purge_mod_directory(patch_dir, Some(file))?;
            }
        }
        Ok(())
    }
}

fn pending_orphans(result: &ConflictResult) -> Vec<Definition> {
    result
        .orphan_conflicts
        .get_all()
        .into_iter()
        .filter(|definition| is_exportable(definition.value_type))
        .filter(|definition| {
            let key = definition.type_and_id();
            result.resolved_conflicts.get_by_type_and_id(&key).is_empty()
                && result.ignored_conflicts.get_by_type_and_id(&key).is_empty()
                && result.custom_conflicts.get_by_type_and_id(&key).is_empty()
        })
        .cloned()
        .collect()
}

fn is_exportable(value_type: ValueType) -> bool {
    !value_type.is_overwritten()
        && !matches!(
            value_type,
            ValueType::Variable | ValueType::Namespace | ValueType::Invalid
        )
}

/// Groups in first-seen order under the lowercase type-and-id key detection uses.
fn group_by_type_and_id(definitions: &[Definition]) -> Vec<(String, Vec<&Definition>)> {
    group_ordered(definitions, |definition| definition.type_and_id().to_lowercase())
}

/// Files and disk files of the saved resolutions for one entity; `type_and_id` is lowercase.
fn resolved_files(resolved: &[Definition], type_and_id: &str) -> Vec<String> {
    let matching = resolved
        .iter()
        .filter(|item| item.type_and_id().to_lowercase() == type_and_id);
    let mut files: Vec<String> = matching.clone().map(|item| item.file.clone()).collect();
    files.extend(
        matching
            .filter(|item| !item.disk_file.trim().is_empty())
            .map(|item| item.disk_file.clone()),
    );
    files
}

/// Same count, and every cached entry still present with the same file and content.
fn is_cached_definition_different(current: &[&Definition], cached: &[&Definition]) -> bool {
    if current.len() != cached.len() {
        return true;
    }
    let unchanged = cached
        .iter()
        .filter(|cached| {
            current.iter().any(|current| {
                current.file_ci() == cached.file_ci() && current.definition_sha == cached.definition_sha
            })
        })
        .count();
    unchanged != cached.len()
}
