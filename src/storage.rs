use crate::collaborators::{
    ExportRequest, FileInfo, MergeExporter, ModWriter, PatchExporter, Reader,
};
use crate::collection::{CollectionMod, PatchLocation};
use crate::definition::{empty_comment, file_extension, normalize_path, Definition, ValueType};
use crate::game::{GameId, GameRules, LOCALISATION_DIR};
use crate::patch_state::{PatchState, PATCH_STATE_VERSION};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const STATE_FILE: &str = "state.json";
pub const DESCRIPTOR_FILE: &str = "descriptor.mod";
pub const LOAD_ORDER_FILE: &str = "load_order.json";

const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".gui", ".gfx", ".yml", ".asset", ".lua", ".csv", ".shader", ".fxh", ".sfx",
    ".settings", ".mod",
];

pub fn is_text_file(path: &str) -> bool {
    let ext = file_extension(path).to_lowercase();
    TEXT_EXTENSIONS.contains(&ext.as_str())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().context("json parent")?;
    fs::create_dir_all(parent).context("create json dir")?;
    let raw = serde_json::to_string_pretty(value).context("serialize json")?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, raw).context("write json temp")?;
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            let _ = fs::remove_file(&temp);
            return Err(err).with_context(|| format!("replace {}", path.display()));
        }
    }
    fs::rename(&temp, path).context("finalize json")?;
    Ok(())
}

fn write_text(path: &Path, relative: &str, code: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create export dir")?;
    }
    let mut text = String::with_capacity(code.len() + 3);
    if relative.to_lowercase().starts_with(LOCALISATION_DIR) {
        text.push('\u{feff}');
    }
    text.push_str(code);
    fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn copy_file(source: &Path, target: &Path) -> Result<bool> {
    if !source.is_file() {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("create copy dir")?;
    }
    fs::copy(source, target).with_context(|| format!("copy {}", source.display()))?;
    Ok(true)
}

/// Writes one definition to `relative` under `root`; binaries are copied from their mod.
fn export_one(root: &Path, relative: &str, definition: &Definition) -> Result<bool> {
    let target = root.join(relative);
    if definition.value_type == ValueType::Binary {
        let source = Path::new(&definition.mod_path).join(&definition.file);
        return copy_file(&source, &target);
    }
    let code = if definition.code.trim().is_empty() {
        empty_comment(relative)
    } else {
        definition.code.clone()
    };
    write_text(&target, relative, &code)?;
    Ok(true)
}

// --- reader ---

#[derive(Debug, Default, Clone)]
pub struct FsReader;

impl Reader for FsReader {
    fn read(&self, root: &Path, game: GameId) -> Vec<FileInfo> {
        if !root.is_dir() {
            return Vec::new();
        }
        let rules = game.rules();
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let relative = normalize_path(&relative.to_string_lossy());
            if !rules.is_game_folder(&relative) {
                continue;
            }
            match read_file_info(entry.path(), &relative) {
                Ok(info) => files.push(info),
                Err(err) => warn!(file = %relative, error = %err, "skipping unreadable file"),
            }
        }
        files
    }

    fn get_file_info(&self, root: &Path, relative: &str) -> Option<FileInfo> {
        if relative.trim().is_empty() {
            return None;
        }
        let path = root.join(relative);
        if !path.is_file() {
            return None;
        }
        read_file_info(&path, &normalize_path(relative)).ok()
    }
}

fn read_file_info(path: &Path, relative: &str) -> Result<FileInfo> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let content_sha = format!("{:x}", Sha256::digest(&bytes));
    let is_binary = !is_text_file(relative);
    let content = if is_binary {
        Vec::new()
    } else {
        let text = String::from_utf8_lossy(&bytes);
        text.trim_start_matches('\u{feff}')
            .lines()
            .map(|line| line.to_string())
            .collect()
    };
    Ok(FileInfo {
        file_name: relative.to_string(),
        content,
        content_sha,
        is_binary,
    })
}

// --- patch exporter ---

#[derive(Debug, Default, Clone)]
pub struct FsPatchExporter;

impl FsPatchExporter {
    fn state_path(location: &PatchLocation) -> PathBuf {
        location.patch_dir().join(STATE_FILE)
    }

    fn target_for(rules: &GameRules, definition: &Definition) -> String {
        rules.disk_file_name(definition)
    }
}

impl PatchExporter for FsPatchExporter {
    fn get_patch_state(
        &self,
        location: &PatchLocation,
        load_external_code: bool,
    ) -> Result<Option<PatchState>> {
        let path = Self::state_path(location);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).context("read patch state")?;
        let mut state: PatchState = serde_json::from_str(&raw).context("parse patch state")?;
        if !load_external_code {
            state.conflict_history.clear();
        }
        Ok(Some(state))
    }

    fn save_state(&self, location: &PatchLocation, mut state: PatchState) -> Result<bool> {
        let incoming = std::mem::take(&mut state.conflict_history);
        // an unreadable previous state only loses history
        if let Ok(Some(previous)) = self.get_patch_state(location, true) {
            state.conflict_history = previous.conflict_history;
        }
        let updates: Vec<Definition> = incoming
            .into_iter()
            .chain(state.resolved_conflicts.iter().cloned())
            .chain(state.custom_conflicts.iter().cloned())
            .collect();
        state.upsert_history(updates.iter());
        state.version = PATCH_STATE_VERSION;
        state.saved_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        write_json_atomic(&Self::state_path(location), &state)?;
        debug!(patch = %location.patch_name, "saved patch state");
        Ok(true)
    }

    fn export_definition(
        &self,
        location: &PatchLocation,
        request: &ExportRequest<'_>,
    ) -> Result<bool> {
        if request.is_empty() {
            return Ok(false);
        }
        let rules = request.game.rules();
        let root = location.patch_dir();
        let mut exported = false;
        for definition in request.definitions.iter().chain(request.custom.iter()) {
            let target = Self::target_for(rules, definition);
            exported |= export_one(&root, &target, definition)?;
        }
        for definition in request.overwritten {
            let target = if definition.disk_file.is_empty() {
                definition.file.clone()
            } else {
                definition.disk_file.clone()
            };
            exported |= export_one(&root, &target, definition)?;
        }
        debug!(patch = %location.patch_name, exported, "exported definitions");
        Ok(exported)
    }

    fn get_patch_files(&self, location: &PatchLocation) -> Vec<String> {
        let root = location.patch_dir();
        if !root.is_dir() {
            return Vec::new();
        }
        WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&root).ok()?;
                Some(normalize_path(&relative.to_string_lossy()))
            })
            .filter(|relative| {
                !relative.eq_ignore_ascii_case(STATE_FILE)
                    && !relative.eq_ignore_ascii_case(DESCRIPTOR_FILE)
                    && !relative.ends_with(".tmp")
            })
            .collect()
    }

    fn load_definition_contents(&self, location: &PatchLocation, file: &str) -> Result<String> {
        let path = location.patch_dir().join(file);
        if !path.is_file() {
            return Ok(String::new());
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(raw.trim_start_matches('\u{feff}').to_string())
    }

    fn copy_patch_mod(&self, from: &PatchLocation, to: &PatchLocation) -> Result<bool> {
        let source = from.patch_dir();
        if !source.is_dir() {
            return Ok(false);
        }
        let target = to.patch_dir();
        for entry in WalkDir::new(&source).into_iter().filter_map(|entry| entry.ok()) {
            let Ok(relative) = entry.path().strip_prefix(&source) else {
                continue;
            };
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&destination).context("create patch copy dir")?;
            } else {
                copy_file(entry.path(), &destination)?;
            }
        }
        Ok(true)
    }

    fn rename_patch_mod(&self, from: &PatchLocation, to: &PatchLocation) -> Result<bool> {
        let source = from.patch_dir();
        let target = to.patch_dir();
        if !source.is_dir() || target.exists() {
            return Ok(false);
        }
        fs::rename(&source, &target).context("rename patch mod")?;
        Ok(true)
    }
}

// --- mod writer ---

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct LoadOrderFile {
    enabled_mods: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct FsModWriter;

impl FsModWriter {
    fn descriptor_text(descriptor: &CollectionMod) -> String {
        let mut text = format!(
            "name=\"{}\"\npath=\"{}\"\n",
            descriptor.name,
            normalize_path(&descriptor.full_path.to_string_lossy())
        );
        if !descriptor.version.is_empty() {
            text.push_str(&format!("version=\"{}\"\n", descriptor.version));
        }
        if !descriptor.dependencies.is_empty() {
            text.push_str("dependencies={\n");
            for dependency in &descriptor.dependencies {
                text.push_str(&format!("\t\"{dependency}\"\n"));
            }
            text.push_str("}\n");
        }
        text
    }
}

impl ModWriter for FsModWriter {
    fn create_mod_directory(&self, root: &Path, relative: Option<&str>) -> Result<bool> {
        let path = match relative {
            Some(relative) => root.join(relative),
            None => root.to_path_buf(),
        };
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(true)
    }

    fn purge_mod_directory(&self, root: &Path, relative: Option<&str>) -> Result<bool> {
        let path = match relative {
            Some(relative) if !relative.trim().is_empty() => root.join(relative),
            Some(_) => return Ok(false),
            None => root.to_path_buf(),
        };
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("purge {}", path.display()))?;
            true
        } else if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("purge {}", path.display()))?;
            true
        } else {
            false
        };
        if removed && relative.is_some() {
            prune_empty_parents(root, &path);
        }
        Ok(removed)
    }

    fn write_descriptor(&self, user_dir: &Path, descriptor: &CollectionMod) -> Result<bool> {
        let text = Self::descriptor_text(descriptor);
        let path = user_dir.join(&descriptor.descriptor_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create descriptor dir")?;
        }
        fs::write(&path, &text).context("write descriptor")?;
        if descriptor.full_path.is_dir() {
            fs::write(descriptor.full_path.join(DESCRIPTOR_FILE), &text)
                .context("write mod descriptor")?;
        }
        Ok(true)
    }

    fn delete_descriptor(&self, user_dir: &Path, descriptor: &CollectionMod) -> Result<bool> {
        let path = user_dir.join(&descriptor.descriptor_file);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path).context("delete descriptor")?;
        Ok(true)
    }

    fn apply_mods(&self, user_dir: &Path, top_priority: &[CollectionMod]) -> Result<bool> {
        let path = user_dir.join(LOAD_ORDER_FILE);
        let mut load_order = if path.exists() {
            let raw = fs::read_to_string(&path).context("read load order")?;
            serde_json::from_str::<LoadOrderFile>(&raw).context("parse load order")?
        } else {
            LoadOrderFile::default()
        };
        for descriptor in top_priority {
            load_order
                .enabled_mods
                .retain(|entry| entry != &descriptor.descriptor_file);
            load_order.enabled_mods.push(descriptor.descriptor_file.clone());
        }
        write_json_atomic(&path, &load_order)?;
        Ok(true)
    }

    fn mod_directory_exists(&self, root: &Path) -> bool {
        root.is_dir()
    }
}

fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut current = removed.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty || fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

// --- merge exporter ---

#[derive(Debug, Default, Clone)]
pub struct FsMergeExporter;

impl MergeExporter for FsMergeExporter {
    fn export_definitions(&self, export_path: &Path, definitions: &[Definition]) -> Result<bool> {
        let mut by_file: BTreeMap<String, Vec<&Definition>> = BTreeMap::new();
        for definition in definitions {
            let target = if definition.disk_file.is_empty() {
                definition.file.clone()
            } else {
                definition.disk_file.clone()
            };
            by_file.entry(target).or_default().push(definition);
        }
        for (file, group) in &by_file {
            if group.len() == 1 || group.iter().any(|item| item.value_type == ValueType::Binary) {
                for definition in group {
                    export_one(export_path, file, definition)?;
                }
                continue;
            }
            let code = group
                .iter()
                .map(|definition| definition.code.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            write_text(&export_path.join(file), file, &code)?;
        }
        Ok(!by_file.is_empty())
    }

    fn export_file(&self, mod_root: &Path, relative: &str, export_path: &Path) -> Result<bool> {
        copy_file(&mod_root.join(relative), &export_path.join(relative))
    }
}
