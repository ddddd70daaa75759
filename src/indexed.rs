use crate::definition::{Definition, ValueType};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

/// Groups `items` by `key`, keeping groups and their members in first-seen order.
pub fn group_ordered<T, K, F>(items: impl IntoIterator<Item = T>, mut key: F) -> Vec<(K, Vec<T>)>
where
    K: Eq + Hash + Clone,
    F: FnMut(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for item in items {
        let key = key(&item);
        match positions.get(&key) {
            Some(&index) => groups[index].1.push(item),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }
    groups
}

/// Handle to a definition slot inside one `IndexedDefinitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefId(usize);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HierarchicalDefinitions {
    pub name: String,
    pub key: String,
    pub file_names: BTreeSet<String>,
    /// Non-game mods contributing to this node.
    pub mods: Vec<String>,
    pub non_game_definitions: usize,
    pub children: Vec<HierarchicalDefinitions>,
}

/// Multi-key in-memory index over definitions. Keys are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct IndexedDefinitions {
    slots: Vec<Option<Definition>>,
    by_file: BTreeMap<String, Vec<DefId>>,
    by_disk_file: BTreeMap<String, Vec<DefId>>,
    by_type_and_id: BTreeMap<String, Vec<DefId>>,
    by_type: BTreeMap<String, Vec<DefId>>,
    by_directory: BTreeMap<String, Vec<DefId>>,
    by_value_type: HashMap<ValueType, Vec<DefId>>,
    all_file_keys: HashMap<String, usize>,
    game_definitions: usize,
    map_hierarchical: bool,
}

impl IndexedDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions<I>(definitions: I, map_hierarchical: bool) -> Self
    where
        I: IntoIterator<Item = Definition>,
    {
        let mut index = Self::new();
        index.init_map(definitions, map_hierarchical);
        index
    }

    pub fn init_map<I>(&mut self, definitions: I, map_hierarchical: bool)
    where
        I: IntoIterator<Item = Definition>,
    {
        *self = Self {
            map_hierarchical,
            ..Self::default()
        };
        for definition in definitions {
            self.insert(definition);
        }
    }

    /// Inserts a definition. With `replace_if_exists` an existing definition in
    /// the same slot (type, id, mod, file) is removed first.
    pub fn add_to_map(&mut self, definition: Definition, replace_if_exists: bool) -> DefId {
        if replace_if_exists {
            self.remove(&definition);
        }
        self.insert(definition)
    }

    fn insert(&mut self, definition: Definition) -> DefId {
        let id = DefId(self.slots.len());
        let keys = SlotKeys::of(&definition);
        push_key(&mut self.by_file, keys.file, id);
        if !keys.disk_file.is_empty() {
            push_key(&mut self.by_disk_file, keys.disk_file, id);
        }
        push_key(&mut self.by_type_and_id, keys.type_and_id, id);
        push_key(&mut self.by_type, keys.kind, id);
        push_key(&mut self.by_directory, keys.directory, id);
        self.by_value_type
            .entry(definition.value_type)
            .or_default()
            .push(id);
        for name in keys.all_files {
            *self.all_file_keys.entry(name).or_default() += 1;
        }
        if definition.is_from_game {
            self.game_definitions += 1;
        }
        self.slots.push(Some(definition));
        id
    }

    /// Removes the definition occupying the same slot as `definition`.
    pub fn remove(&mut self, definition: &Definition) -> bool {
        let key = definition.type_and_id().to_lowercase();
        let found = self.by_type_and_id.get(&key).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| matches!(self.get(*id), Some(existing) if existing.same_slot(definition)))
        });
        match found {
            Some(id) => self.remove_id(id).is_some(),
            None => false,
        }
    }

    pub fn remove_id(&mut self, id: DefId) -> Option<Definition> {
        let definition = self.slots.get_mut(id.0)?.take()?;
        let keys = SlotKeys::of(&definition);
        pull_key(&mut self.by_file, &keys.file, id);
        pull_key(&mut self.by_disk_file, &keys.disk_file, id);
        pull_key(&mut self.by_type_and_id, &keys.type_and_id, id);
        pull_key(&mut self.by_type, &keys.kind, id);
        pull_key(&mut self.by_directory, &keys.directory, id);
        if let Some(ids) = self.by_value_type.get_mut(&definition.value_type) {
            ids.retain(|existing| *existing != id);
        }
        for name in keys.all_files {
            if let Some(count) = self.all_file_keys.get_mut(&name) {
                *count -= 1;
                if *count == 0 {
                    self.all_file_keys.remove(&name);
                }
            }
        }
        if definition.is_from_game {
            self.game_definitions -= 1;
        }
        Some(definition)
    }

    pub fn get(&self, id: DefId) -> Option<&Definition> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    /// Mutating a definition's key fields through this handle desynchronizes the
    /// indices; only non-key fields may be changed.
    pub fn get_mut(&mut self, id: DefId) -> Option<&mut Definition> {
        self.slots.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    pub fn ids(&self) -> Vec<DefId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| DefId(index))
            .collect()
    }

    pub fn get_all(&self) -> Vec<&Definition> {
        self.slots.iter().flatten().collect()
    }

    pub fn ids_by_file(&self, file: &str) -> Vec<DefId> {
        lookup(&self.by_file, &file.to_lowercase())
    }

    pub fn ids_by_type_and_id(&self, type_and_id: &str) -> Vec<DefId> {
        lookup(&self.by_type_and_id, &type_and_id.to_lowercase())
    }

    pub fn ids_by_directory(&self, directory: &str) -> Vec<DefId> {
        lookup(&self.by_directory, &directory.to_lowercase())
    }

    pub fn ids_by_value_type(&self, value_type: ValueType) -> Vec<DefId> {
        self.by_value_type
            .get(&value_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_by_file(&self, file: &str) -> Vec<&Definition> {
        self.resolve(self.ids_by_file(file))
    }

    pub fn get_by_disk_file(&self, file: &str) -> Vec<&Definition> {
        self.resolve(lookup(&self.by_disk_file, &file.to_lowercase()))
    }

    pub fn get_by_type_and_id(&self, type_and_id: &str) -> Vec<&Definition> {
        self.resolve(self.ids_by_type_and_id(type_and_id))
    }

    pub fn get_by_type(&self, kind: &str) -> Vec<&Definition> {
        self.resolve(lookup(&self.by_type, &kind.to_lowercase()))
    }

    pub fn get_by_directory(&self, directory: &str) -> Vec<&Definition> {
        self.resolve(self.ids_by_directory(directory))
    }

    pub fn get_by_value_type(&self, value_type: ValueType) -> Vec<&Definition> {
        self.resolve(self.ids_by_value_type(value_type))
    }

    pub fn get_all_file_keys(&self) -> Vec<String> {
        self.by_file.keys().cloned().collect()
    }

    pub fn get_all_type_and_id_keys(&self) -> Vec<String> {
        self.by_type_and_id.keys().cloned().collect()
    }

    pub fn get_all_type_keys(&self) -> Vec<String> {
        self.by_type.keys().cloned().collect()
    }

    pub fn get_all_directory_keys(&self) -> Vec<String> {
        self.by_directory.keys().cloned().collect()
    }

    /// True when any definition uses `file` as its file, disk file, or overwritten name.
    pub fn exists_by_file(&self, file: &str) -> bool {
        self.all_file_keys.contains_key(&file.to_lowercase())
    }

    pub fn has_game_definitions(&self) -> bool {
        self.game_definitions > 0
    }

    pub fn is_hierarchical(&self) -> bool {
        self.map_hierarchical
    }

    /// Groups by parent directory, then by id. Empty unless the store was built hierarchical.
    pub fn get_hierarchical_definitions(&self) -> Vec<HierarchicalDefinitions> {
        if !self.map_hierarchical {
            return Vec::new();
        }
        let mut groups = Vec::new();
        for (directory, ids) in &self.by_directory {
            let mut children: BTreeMap<String, HierarchicalDefinitions> = BTreeMap::new();
            for definition in self.resolve(ids.clone()) {
                let child = children
                    .entry(definition.id.to_lowercase())
                    .or_insert_with(|| HierarchicalDefinitions {
                        name: definition.id.clone(),
                        key: definition.type_and_id(),
                        ..Default::default()
                    });
                child.file_names.insert(definition.file.clone());
                if !definition.is_from_game {
                    child.non_game_definitions += 1;
                    if !child.mods.contains(&definition.mod_name) {
                        child.mods.push(definition.mod_name.clone());
                    }
                }
            }
            let Some(first) = ids.first().and_then(|id| self.get(*id)) else {
                continue;
            };
            let mut group = HierarchicalDefinitions {
                name: first.parent_directory().to_string(),
                key: directory.clone(),
                ..Default::default()
            };
            for child in children.values() {
                group.non_game_definitions += child.non_game_definitions;
                group.file_names.extend(child.file_names.iter().cloned());
                for name in &child.mods {
                    if !group.mods.contains(name) {
                        group.mods.push(name.clone());
                    }
                }
            }
            group.children = children.into_values().collect();
            group
                .children
                .sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
            groups.push(group);
        }
        groups.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        groups
    }

    fn resolve(&self, ids: Vec<DefId>) -> Vec<&Definition> {
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }
}

struct SlotKeys {
    file: String,
    disk_file: String,
    type_and_id: String,
    kind: String,
    directory: String,
    all_files: Vec<String>,
}

impl SlotKeys {
    fn of(definition: &Definition) -> Self {
        let mut all_files = vec![definition.file_ci()];
        if !definition.disk_file.is_empty() {
            all_files.push(definition.disk_file_ci());
        }
        for name in &definition.overwritten_file_names {
            all_files.push(name.to_lowercase());
        }
        all_files.sort();
        all_files.dedup();
        SlotKeys {
            file: definition.file_ci(),
            disk_file: definition.disk_file_ci(),
            type_and_id: definition.type_and_id().to_lowercase(),
            kind: definition.kind.to_lowercase(),
            directory: definition.parent_directory_ci(),
            all_files,
        }
    }
}

fn push_key(map: &mut BTreeMap<String, Vec<DefId>>, key: String, id: DefId) {
    map.entry(key).or_default().push(id);
}

fn pull_key(map: &mut BTreeMap<String, Vec<DefId>>, key: &str, id: DefId) {
    if let Some(ids) = map.get_mut(key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

fn lookup(map: &BTreeMap<String, Vec<DefId>>, key: &str) -> Vec<DefId> {
    map.get(key).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, file: &str, mod_name: &str) -> Definition {
        Definition::new("common/buildings", id, file, mod_name)
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let index = IndexedDefinitions::from_definitions(
            vec![def("b1", "common/buildings/B.txt", "A")],
            false,
        );
        assert_eq!(index.get_by_file("COMMON/BUILDINGS/b.txt").len(), 1);
        assert_eq!(index.get_by_type_and_id("Common/Buildings-B1").len(), 1);
        assert_eq!(index.get_by_directory("common/BUILDINGS").len(), 1);
        assert!(index.get_by_file("missing.txt").is_empty());
    }

    #[test]
    fn remove_purges_every_index() {
        let mut disk = def("b1", "common/buildings/b.txt", "A");
        disk.disk_file = "common/buildings/zzz_b.txt".to_string();
        let other = def("b2", "common/buildings/b.txt", "A");
        let mut index = IndexedDefinitions::from_definitions(vec![disk.clone(), other], false);

        assert!(index.remove(&disk));
        assert!(index.get_by_type_and_id(&disk.type_and_id()).is_empty());
        assert!(index.get_by_disk_file("common/buildings/zzz_b.txt").is_empty());
        assert!(!index.exists_by_file("common/buildings/zzz_b.txt"));
        assert!(index.exists_by_file("common/buildings/b.txt"));
        assert_eq!(index.get_by_value_type(ValueType::Object).len(), 1);
        assert_eq!(index.len(), 1);
        assert!(!index.remove(&disk));
    }

    #[test]
    fn empty_keys_disappear() {
        let definition = def("b1", "common/buildings/b.txt", "A");
        let mut index = IndexedDefinitions::from_definitions(vec![definition.clone()], false);
        index.remove(&definition);
        assert!(index.get_all_file_keys().is_empty());
        assert!(index.get_all_type_and_id_keys().is_empty());
        assert!(index.get_all_directory_keys().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn replace_if_exists_keeps_one_copy() {
        let mut index = IndexedDefinitions::new();
        let mut definition = def("b1", "common/buildings/b.txt", "A");
        index.add_to_map(definition.clone(), false);
        definition.code = "changed".to_string();
        index.add_to_map(definition.clone(), true);
        let found = index.get_by_type_and_id(&definition.type_and_id());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "changed");
    }

    #[test]
    fn exists_by_file_covers_overwritten_names() {
        let mut definition = def("b1", "gfx/x.gfx", "A");
        definition.overwritten_file_names = vec!["gfx/Old.gfx".to_string()];
        let index = IndexedDefinitions::from_definitions(vec![definition], false);
        assert!(index.exists_by_file("gfx/old.gfx"));
    }

    #[test]
    fn game_definition_count_tracks_removal() {
        let mut game = def("b1", "common/buildings/b.txt", "Game");
        game.is_from_game = true;
        let mut index = IndexedDefinitions::from_definitions(vec![game.clone()], false);
        assert!(index.has_game_definitions());
        index.remove(&game);
        assert!(!index.has_game_definitions());
    }

    #[test]
    fn hierarchy_groups_by_directory_and_id() {
        let mut game = def("b1", "common/buildings/b.txt", "Game");
        game.is_from_game = true;
        let index = IndexedDefinitions::from_definitions(
            vec![
                def("b1", "common/buildings/b.txt", "A"),
                def("b1", "common/buildings/c.txt", "B"),
                game,
                Definition::new("events", "e1", "events/e.txt", "A"),
            ],
            true,
        );
        let groups = index.get_hierarchical_definitions();
        assert_eq!(groups.len(), 2);
        let buildings = &groups[0];
        assert_eq!(buildings.key, "common/buildings");
        assert_eq!(buildings.children.len(), 1);
        let child = &buildings.children[0];
        assert_eq!(child.key, "common/buildings-b1");
        assert_eq!(child.mods, vec!["A", "B"]);
        assert_eq!(child.non_game_definitions, 2);
        assert_eq!(child.file_names.len(), 2);
    }

    #[test]
    fn hierarchy_is_empty_when_not_requested() {
        let index =
            IndexedDefinitions::from_definitions(vec![def("b1", "common/buildings/b.txt", "A")], false);
        assert!(index.get_hierarchical_definitions().is_empty());
    }

    #[test]
    fn grouping_keeps_first_seen_order() {
        let groups = group_ordered(["b1", "a1", "b2", "c1", "a2"], |item| item[..1].to_string());
        let keys: Vec<&str> = groups.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(groups[0].1, vec!["b1", "b2"]);
        assert_eq!(groups[1].1, vec!["a1", "a2"]);
    }
}
