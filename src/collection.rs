use crate::definition::{valid_file_name, Definition};
use crate::game::GameId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const MOD_DIRECTORY: &str = "mod";
pub const MOD_EXTENSION: &str = ".mod";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMod {
    pub name: String,
    /// Descriptor path relative to the game's user directory, e.g. `mod/foo.mod`.
    pub descriptor_file: String,
    pub full_path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub version: String,
}

/// An ordered set of mods; later mods have higher priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModCollection {
    pub name: String,
    #[serde(default)]
    pub game: GameId,
    #[serde(default)]
    pub mods: Vec<CollectionMod>,
}

impl ModCollection {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context("read collection")?;
        let collection: ModCollection = serde_json::from_str(&raw).context("parse collection")?;
        Ok(collection)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize collection")?;
        fs::write(path, raw).context("write collection")?;
        Ok(())
    }
}

/// Immutable inputs shared by every operation on one collection.
#[derive(Debug, Clone)]
pub struct CollectionContext {
    pub game: GameId,
    pub collection_name: String,
    pub mods: Vec<CollectionMod>,
    /// Game user directory; mods live in `<user_dir>/mod`.
    pub user_dir: PathBuf,
    pub patch_prefix: String,
}

impl CollectionContext {
    pub fn new(collection: &ModCollection, user_dir: PathBuf, patch_prefix: &str) -> Self {
        CollectionContext {
            game: collection.game,
            collection_name: collection.name.clone(),
            mods: collection.mods.clone(),
            user_dir,
            patch_prefix: patch_prefix.to_string(),
        }
    }

    pub fn patch_name(&self) -> String {
        format!("{}{}", self.patch_prefix, valid_file_name(&self.collection_name))
    }

    pub fn is_patch_mod(&self, mod_name: &str) -> bool {
        mod_name.starts_with(&self.patch_prefix)
    }

    pub fn mod_root(&self) -> PathBuf {
        self.user_dir.join(MOD_DIRECTORY)
    }

    pub fn patch_location(&self) -> PatchLocation {
        PatchLocation {
            root: self.mod_root(),
            patch_name: self.patch_name(),
        }
    }

    pub fn mod_order(&self) -> Vec<String> {
        self.mods.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn load_order(&self) -> Vec<String> {
        self.mods
            .iter()
            .map(|entry| entry.descriptor_file.clone())
            .collect()
    }

    pub fn find_mod(&self, name: &str) -> Option<&CollectionMod> {
        self.mods.iter().find(|entry| entry.name == name)
    }

    /// Root directory of the mod that owns `mod_name`, if it is part of this collection.
    pub fn mod_path(&self, mod_name: &str) -> Option<PathBuf> {
        if mod_name == self.patch_name() {
            return Some(self.patch_location().patch_dir());
        }
        self.find_mod(mod_name).map(|entry| entry.full_path.clone())
    }

    pub fn populate_mod_path(&self, definitions: &mut [Definition]) {
        for definition in definitions {
            if let Some(path) = self.mod_path(&definition.mod_name) {
                definition.mod_path = path.to_string_lossy().into_owned();
            }
        }
    }

    pub fn patch_descriptor(&self) -> CollectionMod {
        let patch_name = self.patch_name();
        CollectionMod {
            name: patch_name.clone(),
            descriptor_file: format!("{MOD_DIRECTORY}/{patch_name}{MOD_EXTENSION}"),
            full_path: self.mod_root().join(&patch_name),
            dependencies: self.mod_order(),
            version: String::new(),
        }
    }
}

/// Where a collection's patch mod lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchLocation {
    pub root: PathBuf,
    pub patch_name: String,
}

impl PatchLocation {
    pub fn patch_dir(&self) -> PathBuf {
        self.root.join(&self.patch_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collection() -> ModCollection {
        ModCollection {
            name: "My: Collection".to_string(),
            game: GameId::Stellaris,
            mods: vec![
                CollectionMod {
                    name: "A".to_string(),
                    descriptor_file: "mod/a.mod".to_string(),
                    full_path: PathBuf::from("/mods/a"),
                    dependencies: Vec::new(),
                    version: "1.0".to_string(),
                },
                CollectionMod {
                    name: "B".to_string(),
                    descriptor_file: "mod/b.mod".to_string(),
                    full_path: PathBuf::from("/mods/b"),
                    dependencies: vec!["A".to_string()],
                    version: String::new(),
                },
            ],
        }
    }

    #[test]
    fn patch_name_is_sanitized() {
        let context = CollectionContext::new(&collection(), PathBuf::from("/user"), "patchsmith_");
        assert_eq!(context.patch_name(), "patchsmith_My Collection");
        assert_eq!(
            context.patch_location().patch_dir(),
            PathBuf::from("/user/mod/patchsmith_My Collection")
        );
        assert!(context.is_patch_mod("patchsmith_My Collection"));
    }

    #[test]
    fn orders_follow_collection() {
        let context = CollectionContext::new(&collection(), PathBuf::from("/user"), "p_");
        assert_eq!(context.mod_order(), vec!["A", "B"]);
        assert_eq!(context.load_order(), vec!["mod/a.mod", "mod/b.mod"]);
        assert_eq!(context.patch_descriptor().descriptor_file, "mod/p_My Collection.mod");
    }

    #[test]
    fn mod_paths_resolve_collection_and_patch_mods() {
        let context = CollectionContext::new(&collection(), PathBuf::from("/user"), "p_");
        let mut definitions = vec![
            Definition::new("t", "x", "common/t/x.txt", "B"),
            Definition::new("t", "x", "common/t/x.txt", "p_My Collection"),
            Definition::new("t", "x", "common/t/x.txt", "Unknown"),
        ];
        context.populate_mod_path(&mut definitions);
        assert_eq!(definitions[0].mod_path, "/mods/b");
        assert_eq!(
            PathBuf::from(&definitions[1].mod_path),
            PathBuf::from("/user/mod/p_My Collection")
        );
        assert!(definitions[2].mod_path.is_empty());
    }

    #[test]
    fn collection_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("collection.json");
        collection().save(&path).unwrap();
        let loaded = ModCollection::load(&path).unwrap();
        assert_eq!(loaded.mods, collection().mods);
        assert_eq!(loaded.game, GameId::Stellaris);
    }
}
