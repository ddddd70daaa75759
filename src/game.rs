use crate::definition::{file_extension, valid_file_name, Definition, ValueType};
use serde::{Deserialize, Serialize};

pub const FIOS_PREFIX: &str = "!!!_";
pub const LIOS_PREFIX: &str = "zzz_";
pub const LOCALISATION_DIR: &str = "localisation";
pub const REPLACE_DIR: &str = "replace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameId {
    Stellaris,
    HeartsOfIron4,
    EuropaUniversalis4,
    CrusaderKings3,
    Imperator,
    Victoria3,
}

impl Default for GameId {
    fn default() -> Self {
        GameId::Stellaris
    }
}

/// Per-game file ordering rules.
pub struct GameRules {
    /// Directories where the first file in sorted order wins.
    pub fios_paths: &'static [&'static str],
    /// Directories whose objects replace whole files instead of merging.
    pub overwritten_paths: &'static [&'static str],
    /// Top-level folders the game reads script data from.
    pub game_folders: &'static [&'static str],
}

const STELLARIS_FIOS: &[&str] = &[
    "common/on_actions",
    "common/scripted_effects",
    "common/scripted_triggers",
    "common/static_modifiers",
    "common/event_chains",
    "common/achievements",
    "common/button_effects",
    "common/component_sets",
    "events",
    "interface",
    "gfx",
];
const STELLARIS_OVERWRITTEN: &[&str] = &["common/on_actions", "gfx", "interface"];

const CLAUSEWITZ_FIOS: &[&str] = &["common/on_actions", "events", "interface", "gfx"];
const CLAUSEWITZ_OVERWRITTEN: &[&str] = &["gfx", "interface"];

const JOMINI_FIOS: &[&str] = &["common/on_action", "events", "gui", "gfx"];
const JOMINI_OVERWRITTEN: &[&str] = &["gfx", "gui"];

const CLAUSEWITZ_FOLDERS: &[&str] = &[
    "common",
    "events",
    "gfx",
    "interface",
    "localisation",
    "map",
    "music",
    "sound",
    "fonts",
    "flags",
    "prescripted_countries",
];
const JOMINI_FOLDERS: &[&str] = &[
    "common",
    "events",
    "gfx",
    "gui",
    "localization",
    "localisation",
    "map_data",
    "music",
    "sound",
    "fonts",
];

static STELLARIS_RULES: GameRules = GameRules {
    fios_paths: STELLARIS_FIOS,
    overwritten_paths: STELLARIS_OVERWRITTEN,
    game_folders: CLAUSEWITZ_FOLDERS,
};
static CLAUSEWITZ_RULES: GameRules = GameRules {
    fios_paths: CLAUSEWITZ_FIOS,
    overwritten_paths: CLAUSEWITZ_OVERWRITTEN,
    game_folders: CLAUSEWITZ_FOLDERS,
};
static JOMINI_RULES: GameRules = GameRules {
    fios_paths: JOMINI_FIOS,
    overwritten_paths: JOMINI_OVERWRITTEN,
    game_folders: JOMINI_FOLDERS,
};

impl GameId {
    pub fn display_name(self) -> &'static str {
        match self {
            GameId::Stellaris => "Stellaris",
            GameId::HeartsOfIron4 => "Hearts of Iron IV",
            GameId::EuropaUniversalis4 => "Europa Universalis IV",
            GameId::CrusaderKings3 => "Crusader Kings III",
            GameId::Imperator => "Imperator: Rome",
            GameId::Victoria3 => "Victoria 3",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameId::Stellaris => "stellaris",
            GameId::HeartsOfIron4 => "hoi4",
            GameId::EuropaUniversalis4 => "eu4",
            GameId::CrusaderKings3 => "ck3",
            GameId::Imperator => "imperator",
            GameId::Victoria3 => "vic3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        supported_games()
            .into_iter()
            .find(|game| game.as_str().eq_ignore_ascii_case(value))
    }

    pub fn rules(self) -> &'static GameRules {
        match self {
            GameId::Stellaris => &STELLARIS_RULES,
            GameId::HeartsOfIron4 | GameId::EuropaUniversalis4 => &CLAUSEWITZ_RULES,
            GameId::CrusaderKings3 | GameId::Imperator | GameId::Victoria3 => &JOMINI_RULES,
        }
    }
}

pub fn supported_games() -> Vec<GameId> {
    vec![
        GameId::Stellaris,
        GameId::HeartsOfIron4,
        GameId::EuropaUniversalis4,
        GameId::CrusaderKings3,
        GameId::Imperator,
        GameId::Victoria3,
    ]
}

impl GameRules {
    pub fn uses_fios(&self, definition: &Definition) -> bool {
        let parent = definition.parent_directory_ci();
        self.fios_paths.iter().any(|path| path_matches(&parent, path))
    }

    pub fn is_overwritten_path(&self, directory: &str) -> bool {
        let directory = directory.to_lowercase();
        self.overwritten_paths
            .iter()
            .any(|path| path_matches(&directory, path))
    }

    pub fn is_game_folder(&self, file: &str) -> bool {
        let file = file.to_lowercase();
        self.game_folders.iter().any(|folder| file.starts_with(folder))
    }

    /// Patch file name that makes the definition win for this directory.
    pub fn file_name(&self, definition: &Definition) -> String {
        let parent = definition.parent_directory();
        let name = exported_name(definition);
        let name = name.as_str();
        if self.uses_fios(definition) {
            return join(parent, &format!("{FIOS_PREFIX}{name}"));
        }
        if definition.is_localisation() {
            let in_replace = parent
                .to_lowercase()
                .split('/')
                .any(|segment| segment == REPLACE_DIR);
            if in_replace || parent.is_empty() {
                return join(parent, name);
            }
            return join(&join(parent, REPLACE_DIR), name);
        }
        join(parent, &format!("{LIOS_PREFIX}{name}"))
    }

    /// On-disk name; equal to `file_name` unless the definition carries a suffix.
    pub fn disk_file_name(&self, definition: &Definition) -> String {
        let name = self.file_name(definition);
        if definition.file_name_suffix.is_empty() {
            return name;
        }
        let ext = file_extension(&name);
        let base = &name[..name.len() - ext.len()];
        if base.ends_with(&definition.file_name_suffix) {
            return name;
        }
        format!("{base}{}{ext}", definition.file_name_suffix)
    }
}

fn path_matches(directory: &str, rule: &str) -> bool {
    directory == rule || directory.ends_with(&format!("/{rule}"))
}

/// Whole files keep their name; entities are named after their id.
fn exported_name(definition: &Definition) -> String {
    let whole_file = matches!(
        definition.value_type,
        ValueType::Binary | ValueType::EmptyFile | ValueType::Invalid
    ) || definition.is_localisation();
    if whole_file {
        valid_file_name(file_name_of(&definition.file))
    } else {
        valid_file_name(&format!(
            "{}{}",
            definition.id,
            file_extension(&definition.file)
        ))
    }
}

fn file_name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}
