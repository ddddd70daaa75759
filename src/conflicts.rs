use crate::definition::{
    definition_sha, empty_comment, file_extension, file_stem, valid_file_name, Definition,
    ValueType,
};
use crate::game::GameId;
use crate::indexed::{group_ordered, DefId, IndexedDefinitions};
use crate::priority::PriorityResolver;
use crate::progress::{ProgressCallback, ProgressStage, ProgressTracker};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStateMode {
    None,
    Default,
    Advanced,
}

impl Default for PatchStateMode {
    fn default() -> Self {
        PatchStateMode::Default
    }
}

impl PatchStateMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(PatchStateMode::None),
            "default" => Some(PatchStateMode::Default),
            "advanced" => Some(PatchStateMode::Advanced),
            _ => None,
        }
    }
}

/// Partitioned outcome of one analysis run.
#[derive(Debug, Clone, Default)]
pub struct ConflictResult {
    pub all_conflicts: IndexedDefinitions,
    pub conflicts: IndexedDefinitions,
    pub orphan_conflicts: IndexedDefinitions,
    pub resolved_conflicts: IndexedDefinitions,
    pub ignored_conflicts: IndexedDefinitions,
    pub rule_ignored_conflicts: IndexedDefinitions,
    pub overwritten_conflicts: IndexedDefinitions,
    pub custom_conflicts: IndexedDefinitions,
    pub ignored_paths: String,
    pub mode: PatchStateMode,
}

impl ConflictResult {
    /// Detected conflicts for an entity, from either the multi or the orphan partition.
    pub fn detected_for(&self, type_and_id: &str) -> Vec<&Definition> {
        let found = self.conflicts.get_by_type_and_id(type_and_id);
        if found.is_empty() {
            self.orphan_conflicts.get_by_type_and_id(type_and_id)
        } else {
            found
        }
    }
}

/// Insertion-ordered set of conflicting slots.
#[derive(Default)]
struct ConflictSet {
    order: Vec<DefId>,
    seen: HashSet<DefId>,
}

impl ConflictSet {
    fn insert(&mut self, id: DefId) {
        if self.seen.insert(id) {
            self.order.push(id);
        }
    }

    fn contains(&self, id: DefId) -> bool {
        self.seen.contains(&id)
    }
}

#[derive(Default)]
struct DetectionState {
    conflicts: ConflictSet,
    processed: HashSet<DefId>,
    file_cache: HashMap<String, bool>,
}

struct OverwrittenEntry {
    definition: Definition,
    winner: Definition,
    contributor_names: Vec<String>,
}

pub struct ConflictDetector<'m> {
    resolver: PriorityResolver<'m>,
    mode: PatchStateMode,
    progress: Option<ProgressCallback>,
}

impl<'m> ConflictDetector<'m> {
    pub fn new(game: GameId, mod_order: &'m [String], mode: PatchStateMode) -> Self {
        ConflictDetector {
            resolver: PriorityResolver::new(game, mod_order),
            mode,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn find_conflicts(&self, mut definitions: IndexedDefinitions) -> ConflictResult {
        let file_keys = definitions.get_all_file_keys();
        let type_and_id_keys = definitions.get_all_type_and_id_keys();
        let mut overwritten_ids = definitions.ids_by_value_type(ValueType::OverwrittenObject);
        overwritten_ids.extend(
            definitions.ids_by_value_type(ValueType::OverwrittenObjectWithPreserveFileName),
        );
        overwritten_ids.sort();
        let empty_ids = definitions.ids_by_value_type(ValueType::EmptyFile);

        let total = file_keys.len()
            + type_and_id_keys.len() * 2
            + overwritten_ids.len()
            + empty_ids.len();
        let tracker =
            ProgressTracker::new(ProgressStage::Analyze, total, 99.9, self.progress.clone());
        info!(
            definitions = definitions.len(),
            files = file_keys.len(),
            mode = ?self.mode,
            "analyzing definitions"
        );

        self.add_empty_file_tombstones(&mut definitions, &empty_ids, &tracker);

        let mut state = DetectionState::default();
        for file in &file_keys {
            let ids = definitions.ids_by_file(file);
            self.eval_definitions(&mut definitions, ids, &mut state);
            tracker.advance(1);
        }
        for type_and_id in &type_and_id_keys {
            let ids = definitions.ids_by_type_and_id(type_and_id);
            self.eval_definitions(&mut definitions, ids, &mut state);
            tracker.advance(1);
        }

        self.add_last_file_tombstones(&mut definitions, &type_and_id_keys, &mut state, &tracker);
        let overwritten =
            self.synthesize_overwritten(&definitions, &overwritten_ids, &state, &tracker);

        let by_type_and_id = group_ordered(
            state
                .conflicts
                .order
                .iter()
                .filter_map(|id| definitions.get(*id))
                .cloned(),
            |definition| definition.type_and_id().to_lowercase(),
        );
        let mut conflicts = Vec::new();
        let mut orphans = Vec::new();
        for (_, group) in by_type_and_id {
            if group.len() > 1 {
                conflicts.extend(group);
            } else {
                orphans.extend(group);
            }
        }

        info!(
            conflicts = conflicts.len(),
            orphans = orphans.len(),
            overwritten = overwritten.len(),
            "analysis finished"
        );
        tracker.publish(99.9);
        tracker.finish();

        ConflictResult {
            all_conflicts: definitions,
            conflicts: IndexedDefinitions::from_definitions(conflicts, true),
            orphan_conflicts: IndexedDefinitions::from_definitions(orphans, true),
            resolved_conflicts: IndexedDefinitions::from_definitions(Vec::new(), true),
            ignored_conflicts: IndexedDefinitions::from_definitions(Vec::new(), true),
            rule_ignored_conflicts: IndexedDefinitions::from_definitions(Vec::new(), true),
            overwritten_conflicts: IndexedDefinitions::from_definitions(overwritten, true),
            custom_conflicts: IndexedDefinitions::from_definitions(Vec::new(), true),
            ignored_paths: String::new(),
            mode: self.mode,
        }
    }

    /// A mod shipping an empty file deletes what earlier mods put in that file.
    fn add_empty_file_tombstones(
        &self,
        definitions: &mut IndexedDefinitions,
        empty_ids: &[DefId],
        tracker: &ProgressTracker,
    ) {
        let mut created: HashSet<(String, String)> = HashSet::new();
        for id in empty_ids {
            let Some(empty) = definitions.get(*id).cloned() else {
                tracker.advance(1);
                continue;
            };
            if empty.is_localisation() {
                tracker.advance(1);
                continue;
            }
            let mut tombstones = Vec::new();
            let mut owners: Vec<DefId> = Vec::new();
            for other in definitions.get_by_file(&empty.file) {
                if other.mod_name == empty.mod_name
                    || other.value_type == ValueType::Invalid
                    || other.value_type == ValueType::EmptyFile
                {
                    continue;
                }
                let type_and_id = other.type_and_id();
                let owned: Vec<DefId> = definitions
                    .ids_by_type_and_id(&type_and_id)
                    .into_iter()
                    .filter(|owner| {
                        definitions
                            .get(*owner)
                            .is_some_and(|existing| existing.mod_name == empty.mod_name)
                    })
                    .collect();
                if !owned.is_empty() {
                    // own copy elsewhere takes the empty file's name
                    owners.extend(owned);
                    continue;
                }
                if !created.insert((empty.mod_name.clone(), type_and_id.to_lowercase())) {
                    continue;
                }
                let mut copy = other.clone();
                copy.mod_name = empty.mod_name.clone();
                copy.definition_sha = empty.definition_sha.clone();
                copy.dependencies = empty.dependencies.clone();
                copy.code = empty.code.clone();
                copy.original_code = empty.original_code.clone();
                copy.content_sha = empty.content_sha.clone();
                copy.code_tag = empty.code_tag.clone();
                copy.code_separator = empty.code_separator.clone();
                copy.is_from_game = empty.is_from_game;
                copy.is_custom_patch = empty.is_custom_patch;
                copy.merge_file_names(empty.file_names());
                tombstones.push(copy);
            }
            if !tombstones.is_empty() {
                debug!(file = %empty.file, mod_name = %empty.mod_name, count = tombstones.len(), "empty file tombstones");
            }
            for tombstone in tombstones {
                definitions.add_to_map(tombstone, false);
            }
            for owner in owners {
                if let Some(definition) = definitions.get_mut(owner) {
                    definition.merge_file_names(empty.file_names());
                }
            }
            tracker.advance(1);
        }
    }

    fn eval_definitions(
        &self,
        definitions: &mut IndexedDefinitions,
        mut ids: Vec<DefId>,
        state: &mut DetectionState,
    ) {
        self.sort_ids(definitions, &mut ids);
        let candidates: Vec<DefId> = ids
            .into_iter()
            .filter(|id| is_candidate(definitions, *id))
            .collect();

        for id in candidates {
            if state.processed.contains(&id) || state.conflicts.contains(id) {
                continue;
            }
            let Some(definition) = definitions.get(id) else {
                continue;
            };
            if definition.allow_duplicate {
                continue;
            }
            let type_and_id = definition.type_and_id();
            let sha = definition.definition_sha.clone();
            let mut all: Vec<DefId> = definitions
                .ids_by_type_and_id(&type_and_id)
                .into_iter()
                .filter(|other| is_candidate(definitions, *other))
                .collect();
            self.sort_ids(definitions, &mut all);
            state.processed.extend(all.iter().copied());

            if all.len() > 1 {
                let identical = all
                    .iter()
                    .filter_map(|other| definitions.get(*other))
                    .all(|other| other.definition_sha == sha);
                if !identical {
                    self.eval_content_conflicts(definitions, &all, state);
                }
            } else if all.len() == 1 {
                self.eval_single(definitions, id, state);
            }
        }
    }

    fn eval_content_conflicts(
        &self,
        definitions: &mut IndexedDefinitions,
        all: &[DefId],
        state: &mut DetectionState,
    ) {
        let mut valid: Vec<DefId> = Vec::new();
        for &candidate in all {
            if state.conflicts.contains(candidate) || valid.contains(&candidate) {
                continue;
            }
            let Some(mod_name) = definitions.get(candidate).map(|d| d.mod_name.clone()) else {
                continue;
            };
            let overriders: Vec<String> = all
                .iter()
                .filter_map(|other| definitions.get(*other))
                .filter(|other| !other.is_custom_patch && other.depends_on(&mod_name))
                .flat_map(|other| other.file_names())
                .collect();
            if !overriders.is_empty() && self.mode == PatchStateMode::Default {
                if let Some(skipped) = definitions.get_mut(candidate) {
                    skipped.merge_file_names(overriders);
                }
                continue;
            }
            valid.push(candidate);
        }

        let groups: Vec<Vec<DefId>> = group_ordered(
            valid.into_iter().filter(|id| definitions.get(*id).is_some()),
            |id| {
                definitions
                    .get(*id)
                    .map(|definition| definition.definition_sha.clone())
                    .unwrap_or_default()
            },
        )
        .into_iter()
        .map(|(_, group)| group)
        .collect();
        if groups.len() < 2 {
            return;
        }

        for group in groups {
            let refs: Vec<&Definition> = group.iter().filter_map(|id| definitions.get(*id)).collect();
            let Some(position) = self.resolver.eval(&refs).position_in(&refs) else {
                continue;
            };
            let winner = group[position];
            if state.conflicts.contains(winner) {
                continue;
            }
            let names: Vec<String> = group
                .iter()
                .filter(|id| **id != winner)
                .filter_map(|id| definitions.get(*id))
                .flat_map(|definition| definition.file_names())
                .collect();
            let exists = self.exists_in_last_file(definitions, winner);
            if let Some(definition) = definitions.get_mut(winner) {
                definition.merge_file_names(names);
                definition.exists_in_last_file = exists;
            }
            state.conflicts.insert(winner);
        }
    }

    /// Only one definition exists for the entity; it still conflicts when the
    /// file's last mod dropped it.
    fn eval_single(&self, definitions: &mut IndexedDefinitions, id: DefId, state: &mut DetectionState) {
        let Some(definition) = definitions.get(id) else {
            return;
        };
        let file = definition.file_ci();
        if definition.value_type == ValueType::Binary {
            state.file_cache.entry(file).or_insert(false);
            return;
        }
        let shared = match state.file_cache.get(&file) {
            Some(shared) => *shared,
            None => {
                let file_definitions = definitions.get_by_file(&file);
                let mut mods: Vec<&str> = file_definitions
                    .iter()
                    .map(|other| other.mod_name.as_str())
                    .collect();
                mods.sort_unstable();
                mods.dedup();
                let shared = if mods.len() > 1 {
                    let overrides = !definition.is_custom_patch
                        && definition
                            .dependencies
                            .iter()
                            .any(|dependency| mods.contains(&dependency.as_str()));
                    !(overrides && self.mode == PatchStateMode::Default)
                } else {
                    false
                };
                state.file_cache.insert(file, shared);
                shared
            }
        };
        if shared && !definition.is_from_game && !state.conflicts.contains(id) {
            let exists = self.exists_in_last_file(definitions, id);
            if let Some(definition) = definitions.get_mut(id) {
                definition.exists_in_last_file = exists;
            }
            if !exists {
                state.conflicts.insert(id);
            }
        }
    }

    /// Whether the highest-priority mod contributing to this file also defines the entity there.
    fn exists_in_last_file(&self, definitions: &IndexedDefinitions, id: DefId) -> bool {
        let Some(definition) = definitions.get(id) else {
            return true;
        };
        let file_definitions = definitions.get_by_file(&definition.file);
        let Some(last_mod) = self.last_mod(&file_definitions) else {
            return true;
        };
        let type_and_id = definition.type_and_id();
        file_definitions
            .iter()
            .any(|other| other.mod_name == last_mod.mod_name && other.type_and_id() == type_and_id)
    }

    fn last_mod<'a>(&self, file_definitions: &[&'a Definition]) -> Option<&'a Definition> {
        let mut last: Option<&'a Definition> = None;
        for definition in file_definitions {
            let better = match last {
                Some(current) => {
                    self.resolver.mod_position(&definition.mod_name)
                        > self.resolver.mod_position(&current.mod_name)
                }
                None => true,
            };
            if better {
                last = Some(*definition);
            }
        }
        last
    }

    /// When every surviving definition was dropped from its file, the deletion
    /// itself becomes a resolvable conflict.
    fn add_last_file_tombstones(
        &self,
        definitions: &mut IndexedDefinitions,
        type_and_id_keys: &[String],
        state: &mut DetectionState,
        tracker: &ProgressTracker,
    ) {
        let mut grouped: HashMap<String, Vec<DefId>> = HashMap::new();
        for id in &state.conflicts.order {
            if let Some(definition) = definitions.get(*id) {
                grouped
                    .entry(definition.type_and_id().to_lowercase())
                    .or_default()
                    .push(*id);
            }
        }
        for key in type_and_id_keys {
            tracker.advance(1);
            let Some(items) = grouped.get(key) else {
                continue;
            };
            let refs: Vec<&Definition> = items.iter().filter_map(|id| definitions.get(*id)).collect();
            if refs.is_empty() || refs.iter().any(|definition| definition.exists_in_last_file) {
                continue;
            }
            let first = refs[0];
            let file_definitions = definitions.get_by_file(&first.file);
            let Some(last) = self.last_mod(&file_definitions) else {
                continue;
            };
            let mut copy = first.clone();
            copy.dependencies = last.dependencies.clone();
            copy.mod_name = last.mod_name.clone();
            copy.code = empty_comment(&copy.file);
            copy.original_code = copy.code.clone();
            copy.definition_sha = definition_sha(&copy.code);
            copy.content_sha = last.content_sha.clone();
            copy.code_separator = last.code_separator.clone();
            copy.code_tag = last.code_tag.clone();
            copy.original_file_name = last.original_file_name.clone();
            copy.variables = last.variables.clone();
            copy.is_from_game = last.is_from_game;
            copy.merge_file_names(last.file_names());
            copy.exists_in_last_file = true;
            debug!(entity = %copy.type_and_id(), mod_name = %copy.mod_name, "entity removed by last file");
            let id = definitions.add_to_map(copy, false);
            state.conflicts.insert(id);
        }
    }

    fn synthesize_overwritten(
        &self,
        definitions: &IndexedDefinitions,
        overwritten_ids: &[DefId],
        state: &DetectionState,
        tracker: &ProgressTracker,
    ) -> Vec<Definition> {
        let groups = group_ordered(
            overwritten_ids.iter().filter_map(|id| definitions.get(*id)),
            |definition| definition.type_and_id().to_lowercase(),
        );

        let mut conflicted: HashMap<String, Vec<&Definition>> = HashMap::new();
        for id in &state.conflicts.order {
            if let Some(definition) = definitions.get(*id) {
                conflicted
                    .entry(definition.type_and_id().to_lowercase())
                    .or_default()
                    .push(definition);
            }
        }

        let mut sort_cache: HashMap<String, HashMap<String, i32>> = HashMap::new();
        let mut entries: Vec<OverwrittenEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (key, group) in groups {
            let directory = group[0].parent_directory_ci();
            if !sort_cache.contains_key(&directory) {
                let order = self.directory_order(definitions, &directory);
                sort_cache.insert(directory.clone(), order);
            }

            let (winner, contributors) = match conflicted.get(&key) {
                Some(items) if !items.is_empty() => (self.resolver.eval(items).definition, items.clone()),
                _ => {
                    let valid: Vec<&Definition> = group
                        .iter()
                        .copied()
                        .filter(|definition| {
                            let overridden = group.iter().any(|other| {
                                !other.is_custom_patch && other.depends_on(&definition.mod_name)
                            });
                            !overridden || self.mode == PatchStateMode::Advanced
                        })
                        .collect();
                    (self.resolver.eval(&valid).definition, valid)
                }
            };
            tracker.advance(group.len());
            let Some(winner) = winner else {
                continue;
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            let mut definition = winner.clone();
            definition.order = sort_cache
                .get(&directory)
                .and_then(|order| order.get(&key))
                .copied()
                .unwrap_or_default();
            entries.push(OverwrittenEntry {
                definition,
                winner: winner.clone(),
                contributor_names: contributors
                    .iter()
                    .flat_map(|definition| definition.overwritten_names())
                    .collect(),
            });
        }

        let rules = self.resolver.game().rules();
        let by_directory = group_ordered(0..entries.len(), |index| {
            entries[*index].definition.parent_directory_ci()
        });
        for (_, mut indices) in by_directory {
            indices.sort_by_key(|index| entries[*index].definition.order);
            for (position, index) in indices.into_iter().enumerate() {
                let entry = &mut entries[index];
                let winner = &entry.winner;
                let definition = &mut entry.definition;
                definition.order = position as i32 + 1;
                let old_file = definition.file.clone();
                let generated = format!(
                    "{}{}",
                    valid_file_name(&winner.id),
                    file_extension(&winner.file)
                );
                definition.file = join_path(winner.parent_directory(), &generated);
                let mut names = winner.overwritten_names();
                for name in &entry.contributor_names {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                definition.overwritten_file_names = names;
                definition.disk_file = rules.disk_file_name(definition);
                let preserve = old_file == definition.file
                    || definition.value_type == ValueType::OverwrittenObjectWithPreserveFileName;
                definition.file = rules.file_name(definition);
                if preserve && !definition.overwritten_file_names.contains(&old_file) {
                    definition.overwritten_file_names.push(old_file);
                }
            }
        }
        entries.into_iter().map(|entry| entry.definition).collect()
    }

    /// Export order of every entity in a directory: winners sorted by file stem, then `order`.
    fn directory_order(&self, definitions: &IndexedDefinitions, directory: &str) -> HashMap<String, i32> {
        let all: Vec<&Definition> = definitions
            .get_by_directory(directory)
            .into_iter()
            .filter(|definition| definition.value_type.is_conflict_candidate())
            .collect();
        let by_entity = group_ordered(all, |definition| definition.type_and_id().to_lowercase());
        let mut winners: Vec<(String, String, i32)> = Vec::new();
        for (key, group) in by_entity {
            if let Some(winner) = self.resolver.eval_with(&group, true).definition {
                winners.push((key, file_stem(&winner.file).to_string(), winner.order));
            }
        }

        // stable: equal stem and order keep first-seen order
        winners.sort_by(|(_, left_stem, left_order), (_, right_stem, right_order)| {
            left_stem.cmp(right_stem).then(left_order.cmp(right_order))
        });
        winners
            .into_iter()
            .enumerate()
            .map(|(index, (key, _, _))| (key, index as i32))
            .collect()
    }

    fn sort_ids(&self, definitions: &IndexedDefinitions, ids: &mut [DefId]) {
        ids.sort_by_key(|id| {
            definitions
                .get(*id)
                .map(|definition| self.resolver.mod_position(&definition.mod_name))
                .unwrap_or(i64::MAX)
        });
    }
}

fn is_candidate(definitions: &IndexedDefinitions, id: DefId) -> bool {
    definitions
        .get(id)
        .map(|definition| definition.value_type.is_conflict_candidate())
        .unwrap_or(false)
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityType;
    use crate::progress::ProgressEvent;
    use std::sync::{Arc, Mutex};

    fn order(mods: &[&str]) -> Vec<String> {
        mods.iter().map(|name| name.to_string()).collect()
    }

    fn object(mod_name: &str, id: &str, file: &str, body: &str) -> Definition {
        let mut definition = Definition::new("common/buildings", id, file, mod_name);
        definition.code = format!("{id} = {{ {body} }}");
        definition.original_code = definition.code.clone();
        definition.ensure_sha();
        definition
    }

    fn detect(definitions: Vec<Definition>, mods: &[String], mode: PatchStateMode) -> ConflictResult {
        ConflictDetector::new(GameId::Stellaris, mods, mode)
            .find_conflicts(IndexedDefinitions::from_definitions(definitions, false))
    }

    fn mods_of(definitions: Vec<&Definition>) -> Vec<String> {
        let mut mods: Vec<String> = definitions.iter().map(|d| d.mod_name.clone()).collect();
        mods.sort();
        mods
    }

    // --- content conflicts ---

    #[test]
    fn three_mods_one_file_make_one_group() {
        let mods = order(&["ModA", "ModB", "ModC"]);
        let result = detect(
            vec![
                object("ModA", "building_1", "common/buildings/b.txt", "a = 1"),
                object("ModB", "building_1", "common/buildings/b.txt", "a = 2"),
                object("ModC", "building_1", "common/buildings/b.txt", "a = 3"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        let group = result.conflicts.get_by_type_and_id("common/buildings-building_1");
        assert_eq!(group.len(), 3);
        assert!(result.orphan_conflicts.is_empty());
        assert_eq!(result.all_conflicts.len(), 3);
    }

    #[test]
    fn identical_content_is_not_a_conflict() {
        let mods = order(&["A", "B"]);
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/a.txt", "x = 1"),
                object("B", "b1", "common/buildings/b.txt", "x = 1"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        assert!(result.conflicts.is_empty());
        assert!(result.orphan_conflicts.is_empty());
    }

    #[test]
    fn equal_content_merges_file_names() {
        let mods = order(&["A", "B", "C"]);
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/a.txt", "x = 1"),
                object("B", "b1", "common/buildings/b.txt", "x = 1"),
                object("C", "b1", "common/buildings/c.txt", "x = 2"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        let group = result.conflicts.get_by_type_and_id("common/buildings-b1");
        assert_eq!(group.len(), 2);
        let shared = group.iter().find(|d| d.definition_sha != group_sha(&group, "C")).unwrap();
        assert_eq!(shared.file_names().len(), 2);
    }

    fn group_sha(group: &[&Definition], mod_name: &str) -> String {
        group
            .iter()
            .find(|d| d.mod_name == mod_name)
            .map(|d| d.definition_sha.clone())
            .unwrap_or_default()
    }

    // --- dependencies ---

    #[test]
    fn dependency_removes_overridden_mod_in_default_mode() {
        let mods = order(&["A", "B", "C"]);
        let mut b = object("B", "b1", "common/buildings/b.txt", "x = 2");
        b.dependencies = vec!["A".to_string()];
        let definitions = vec![
            object("A", "b1", "common/buildings/a.txt", "x = 1"),
            b,
            object("C", "b1", "common/buildings/c.txt", "x = 3"),
        ];
        let result = detect(definitions.clone(), &mods, PatchStateMode::Default);
        assert_eq!(
            mods_of(result.conflicts.get_by_type_and_id("common/buildings-b1")),
            vec!["B", "C"]
        );

        let advanced = detect(definitions, &mods, PatchStateMode::Advanced);
        assert_eq!(
            mods_of(advanced.conflicts.get_by_type_and_id("common/buildings-b1")),
            vec!["A", "B", "C"]
        );
    }

    #[test]
    fn dependency_exclusion_resolves_as_override() {
        let mods = order(&["A", "B"]);
        let mut b = object("B", "b1", "common/buildings/b.txt", "x = 2");
        b.dependencies = vec!["A".to_string()];
        let a = object("A", "b1", "common/buildings/b.txt", "x = 1");
        let result = PriorityResolver::new(GameId::Stellaris, &mods).eval(&[&a, &b]);
        assert_eq!(result.priority_type, PriorityType::ModOverride);
        assert_eq!(result.definition.map(|d| d.mod_name.as_str()), Some("B"));
    }

    // --- last file checks ---

    #[test]
    fn entity_dropped_by_last_mod_is_an_orphan_with_tombstone() {
        let mods = order(&["A", "B"]);
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/b.txt", "x = 1"),
                object("A", "b2", "common/buildings/b.txt", "y = 1"),
                object("B", "b2", "common/buildings/b.txt", "y = 1"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        let group = result.conflicts.get_by_type_and_id("common/buildings-b1");
        assert_eq!(group.len(), 2);
        let tombstone = group.iter().find(|d| d.mod_name == "B").unwrap();
        assert_eq!(tombstone.code, "# empty");
        assert!(tombstone.exists_in_last_file);
        assert!(result.conflicts.get_by_type_and_id("common/buildings-b2").is_empty());
    }

    #[test]
    fn single_mod_file_is_never_a_conflict() {
        let mods = order(&["A"]);
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/b.txt", "x = 1"),
                object("A", "b2", "common/buildings/b.txt", "y = 1"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        assert!(result.conflicts.is_empty());
        assert!(result.orphan_conflicts.is_empty());
    }

    #[test]
    fn empty_file_deletes_earlier_content() {
        let mods = order(&["A", "B"]);
        let mut empty = Definition::new("common/buildings", "b.txt", "common/buildings/b.txt", "B");
        empty.value_type = ValueType::EmptyFile;
        empty.code = String::new();
        empty.ensure_sha();
        let result = detect(
            vec![object("A", "b1", "common/buildings/b.txt", "x = 1"), empty],
            &mods,
            PatchStateMode::Default,
        );
        let group = result.conflicts.get_by_type_and_id("common/buildings-b1");
        assert_eq!(mods_of(group), vec!["A", "B"]);
    }

    #[test]
    fn empty_file_is_recorded_on_the_mods_own_copy() {
        let mods = order(&["A", "B"]);
        let mut empty = Definition::new("common/buildings", "b.txt", "common/buildings/b.txt", "B");
        empty.value_type = ValueType::EmptyFile;
        empty.ensure_sha();
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/b.txt", "x = 1"),
                object("B", "b1", "common/buildings/moved.txt", "x = 2"),
                empty,
            ],
            &mods,
            PatchStateMode::Default,
        );
        let own = result
            .all_conflicts
            .get_by_type_and_id("common/buildings-b1")
            .into_iter()
            .find(|definition| definition.mod_name == "B")
            .cloned()
            .unwrap();
        assert_eq!(own.file, "common/buildings/moved.txt");
        assert!(own.file_names().contains(&"common/buildings/b.txt".to_string()));
    }

    // --- overwritten objects ---

    #[test]
    fn overwritten_objects_get_generated_file_names() {
        let mods = order(&["A", "B"]);
        let mut a = Definition::new("gfx", "sprite_a", "gfx/sprites.gfx", "A");
        a.value_type = ValueType::OverwrittenObject;
        a.code = "sprite_a = { a }".to_string();
        a.ensure_sha();
        let mut b = Definition::new("gfx", "sprite_a", "gfx/other.gfx", "B");
        b.value_type = ValueType::OverwrittenObject;
        b.code = "sprite_a = { b }".to_string();
        b.ensure_sha();
        let result = detect(vec![a, b], &mods, PatchStateMode::Default);

        let synthesized = result.overwritten_conflicts.get_all();
        assert_eq!(synthesized.len(), 1);
        let definition = synthesized[0];
        assert_eq!(definition.order, 1);
        assert_eq!(definition.file, "gfx/!!!_sprite_a.gfx");
        assert_eq!(definition.disk_file, "gfx/!!!_sprite_a.gfx");
        assert!(definition.overwritten_file_names.contains(&"gfx/sprites.gfx".to_string()));
        assert!(definition.overwritten_file_names.contains(&"gfx/other.gfx".to_string()));
    }

    // --- result properties ---

    #[test]
    fn every_detected_entity_lands_in_exactly_one_partition() {
        let mods = order(&["A", "B", "C"]);
        let result = detect(
            vec![
                object("A", "b1", "common/buildings/b.txt", "x = 1"),
                object("B", "b1", "common/buildings/b.txt", "x = 2"),
                object("A", "b2", "common/buildings/b.txt", "y = 1"),
                object("C", "b3", "common/buildings/c.txt", "z = 1"),
                object("A", "b3", "common/buildings/a.txt", "z = 2"),
            ],
            &mods,
            PatchStateMode::Default,
        );
        for key in result.all_conflicts.get_all_type_and_id_keys() {
            let in_conflicts = !result.conflicts.get_by_type_and_id(&key).is_empty();
            let in_orphans = !result.orphan_conflicts.get_by_type_and_id(&key).is_empty();
            assert!(!(in_conflicts && in_orphans), "{key} in both partitions");
        }
    }

    #[test]
    fn repeated_runs_give_identical_partitions() {
        let mods = order(&["A", "B", "C"]);
        let store = IndexedDefinitions::from_definitions(
            vec![
                object("A", "b1", "common/buildings/b.txt", "x = 1"),
                object("B", "b1", "common/buildings/b.txt", "x = 2"),
                object("C", "b1", "common/buildings/c.txt", "x = 3"),
                object("A", "b2", "common/buildings/b.txt", "y = 1"),
            ],
            false,
        );
        let detector = ConflictDetector::new(GameId::Stellaris, &mods, PatchStateMode::Default);
        let first = detector.find_conflicts(store.clone());
        let second = detector.find_conflicts(store);
        let slots = |index: &IndexedDefinitions| -> Vec<(String, String, String)> {
            let mut slots: Vec<_> = index
                .get_all()
                .iter()
                .map(|d| (d.type_and_id(), d.mod_name.clone(), d.file.clone()))
                .collect();
            slots.sort();
            slots
        };
        assert_eq!(slots(&first.conflicts), slots(&second.conflicts));
        assert_eq!(slots(&first.orphan_conflicts), slots(&second.orphan_conflicts));
        assert_eq!(slots(&first.overwritten_conflicts), slots(&second.overwritten_conflicts));
    }

    #[test]
    fn progress_ends_at_100_and_never_decreases() {
        let mods = order(&["A", "B"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |event: ProgressEvent| {
            sink.lock().unwrap().push(event.percentage);
        });
        ConflictDetector::new(GameId::Stellaris, &mods, PatchStateMode::Default)
            .with_progress(Some(callback))
            .find_conflicts(IndexedDefinitions::from_definitions(
                vec![
                    object("A", "b1", "common/buildings/b.txt", "x = 1"),
                    object("B", "b1", "common/buildings/b.txt", "x = 2"),
                ],
                false,
            ));
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }
}
