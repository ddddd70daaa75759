use crate::collection::{CollectionMod, PatchLocation};
use crate::definition::Definition;
use crate::game::GameId;
use crate::patch_state::PatchState;
use crate::parser::SimpleParser;
use crate::storage::{FsMergeExporter, FsModWriter, FsPatchExporter, FsReader};
use anyhow::Result;
use std::{path::Path, sync::Arc};

/// One file read from a mod directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileInfo {
    /// Path relative to the mod root, `/` separated.
    pub file_name: String,
    pub content: Vec<String>,
    pub content_sha: String,
    pub is_binary: bool,
}

pub struct ParseArgs<'a> {
    pub file: &'a str,
    pub lines: &'a [String],
    pub content_sha: &'a str,
    pub mod_name: &'a str,
    pub dependencies: &'a [String],
    pub game: GameId,
    pub is_binary: bool,
}

/// Turns the lines of one file into definitions. Failures surface as `Invalid` definitions.
pub trait DefinitionParser: Send + Sync {
    fn parse(&self, args: ParseArgs<'_>) -> Vec<Definition>;
}

/// Reads mod files; missing paths are empty results, never errors.
pub trait Reader: Send + Sync {
    fn read(&self, root: &Path, game: GameId) -> Vec<FileInfo>;
    fn get_file_info(&self, root: &Path, relative: &str) -> Option<FileInfo>;
}

/// Definitions written in one export call.
#[derive(Debug, Default)]
pub struct ExportRequest<'a> {
    pub game: GameId,
    pub definitions: &'a [Definition],
    pub overwritten: &'a [Definition],
    pub custom: &'a [Definition],
}

impl ExportRequest<'_> {
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.overwritten.is_empty() && self.custom.is_empty()
    }
}

pub trait PatchExporter: Send + Sync {
    fn get_patch_state(&self, location: &PatchLocation, load_external_code: bool)
        -> Result<Option<PatchState>>;
    fn save_state(&self, location: &PatchLocation, state: PatchState) -> Result<bool>;
    fn export_definition(&self, location: &PatchLocation, request: &ExportRequest<'_>)
        -> Result<bool>;
    /// Files currently present in the patch mod, relative to its root.
    fn get_patch_files(&self, location: &PatchLocation) -> Vec<String>;
    fn load_definition_contents(&self, location: &PatchLocation, file: &str) -> Result<String>;
    fn copy_patch_mod(&self, from: &PatchLocation, to: &PatchLocation) -> Result<bool>;
    fn rename_patch_mod(&self, from: &PatchLocation, to: &PatchLocation) -> Result<bool>;
}

pub trait ModWriter: Send + Sync {
    fn create_mod_directory(&self, root: &Path, relative: Option<&str>) -> Result<bool>;
    /// Removes a file or directory under `root`, or `root` itself when `relative` is `None`.
    fn purge_mod_directory(&self, root: &Path, relative: Option<&str>) -> Result<bool>;
    fn write_descriptor(&self, user_dir: &Path, descriptor: &CollectionMod) -> Result<bool>;
    fn delete_descriptor(&self, user_dir: &Path, descriptor: &CollectionMod) -> Result<bool>;
    /// Appends the given mods to the game's active list with top priority.
    fn apply_mods(&self, user_dir: &Path, top_priority: &[CollectionMod]) -> Result<bool>;
    fn mod_directory_exists(&self, root: &Path) -> bool;
}

pub trait MergeExporter: Send + Sync {
    fn export_definitions(&self, export_path: &Path, definitions: &[Definition]) -> Result<bool>;
    fn export_file(&self, mod_root: &Path, relative: &str, export_path: &Path) -> Result<bool>;
}

/// The collaborator set shared by the engine services.
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn DefinitionParser>,
    pub reader: Arc<dyn Reader>,
    pub patch_exporter: Arc<dyn PatchExporter>,
    pub mod_writer: Arc<dyn ModWriter>,
    pub merge_exporter: Arc<dyn MergeExporter>,
}

impl Collaborators {
    /// Plain files on disk with the bundled script parser.
    pub fn filesystem() -> Self {
        Collaborators {
            parser: Arc::new(SimpleParser),
            reader: Arc::new(FsReader),
            patch_exporter: Arc::new(FsPatchExporter),
            mod_writer: Arc::new(FsModWriter),
            merge_exporter: Arc::new(FsMergeExporter),
        }
    }
}
