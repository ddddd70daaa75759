use crate::conflicts::{ConflictResult, PatchStateMode};
use crate::definition::Definition;
use crate::indexed::IndexedDefinitions;
use serde::{Deserialize, Serialize};

pub const PATCH_STATE_VERSION: u32 = 1;

/// Persisted resolution state of one patch mod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchState {
    pub version: u32,
    /// Descriptor files of the collection at save time, in priority order.
    pub load_order: Vec<String>,
    pub mode: PatchStateMode,
    pub ignore_conflict_paths: String,
    pub conflicts: Vec<Definition>,
    pub orphan_conflicts: Vec<Definition>,
    pub resolved_conflicts: Vec<Definition>,
    pub ignored_conflicts: Vec<Definition>,
    pub overwritten_conflicts: Vec<Definition>,
    pub custom_conflicts: Vec<Definition>,
    /// Last saved code per resolved or custom entity.
    pub conflict_history: Vec<Definition>,
    pub has_game_definitions: bool,
    pub saved_at: Option<String>,
}

impl PatchState {
    pub fn from_result(result: &ConflictResult, load_order: Vec<String>) -> Self {
        PatchState {
            version: PATCH_STATE_VERSION,
            load_order,
            mode: result.mode,
            ignore_conflict_paths: result.ignored_paths.clone(),
            conflicts: flatten(&result.conflicts),
            orphan_conflicts: flatten(&result.orphan_conflicts),
            resolved_conflicts: flatten(&result.resolved_conflicts),
            ignored_conflicts: flatten(&result.ignored_conflicts),
            overwritten_conflicts: flatten(&result.overwritten_conflicts),
            custom_conflicts: flatten(&result.custom_conflicts),
            conflict_history: Vec::new(),
            has_game_definitions: result.all_conflicts.has_game_definitions(),
            saved_at: None,
        }
    }

    pub fn history_for(&self, type_and_id: &str) -> Option<&Definition> {
        self.conflict_history
            .iter()
            .find(|entry| entry.type_and_id() == type_and_id)
    }

    /// Replaces history entries for every given definition, keeping the rest.
    pub fn upsert_history<'a, I>(&mut self, definitions: I)
    where
        I: IntoIterator<Item = &'a Definition>,
    {
        for definition in definitions {
            let key = definition.type_and_id();
            self.conflict_history
                .retain(|entry| entry.type_and_id() != key);
            self.conflict_history.push(definition.clone());
        }
    }

    /// Every cached entity whose contributing files are checked for staleness.
    pub fn tracked_conflicts(&self) -> impl Iterator<Item = &Definition> {
        self.conflicts
            .iter()
            .chain(self.orphan_conflicts.iter())
            .chain(self.overwritten_conflicts.iter())
    }
}

fn flatten(definitions: &IndexedDefinitions) -> Vec<Definition> {
    definitions.get_all().into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, mod_name: &str, code: &str) -> Definition {
        let mut definition = Definition::new("common/buildings", id, "common/buildings/b.txt", mod_name);
        definition.code = code.to_string();
        definition
    }

    #[test]
    fn history_upsert_replaces_by_entity() {
        let mut state = PatchState::default();
        state.upsert_history([&def("a", "A", "a = 1"), &def("b", "A", "b = 1")]);
        state.upsert_history([&def("a", "patch", "a = 2")]);
        assert_eq!(state.conflict_history.len(), 2);
        let history = state.history_for("common/buildings-a").unwrap();
        assert_eq!(history.code, "a = 2");
        assert!(state.history_for("common/buildings-c").is_none());
    }

    #[test]
    fn from_result_flattens_partitions() {
        let mut result = ConflictResult::default();
        result.conflicts.add_to_map(def("a", "A", "a = 1"), false);
        result.conflicts.add_to_map(def("a", "B", "a = 2"), false);
        result.orphan_conflicts.add_to_map(def("b", "B", "b = 1"), false);
        result.mode = PatchStateMode::Advanced;
        let state = PatchState::from_result(&result, vec!["mod/a.mod".to_string()]);
        assert_eq!(state.conflicts.len(), 2);
        assert_eq!(state.orphan_conflicts.len(), 1);
        assert_eq!(state.tracked_conflicts().count(), 3);
        assert_eq!(state.mode, PatchStateMode::Advanced);
        assert_eq!(state.version, PATCH_STATE_VERSION);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let state: PatchState = serde_json::from_str(r#"{"load_order":["mod/a.mod"]}"#).unwrap();
        assert_eq!(state.load_order, vec!["mod/a.mod"]);
        assert!(state.conflicts.is_empty());
        assert_eq!(state.mode, PatchStateMode::Default);
    }
}
