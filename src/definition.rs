use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Object,
    Namespace,
    Variable,
    OverwrittenObject,
    OverwrittenObjectWithPreserveFileName,
    EmptyFile,
    Binary,
    Invalid,
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::Object
    }
}

impl ValueType {
    pub fn is_overwritten(self) -> bool {
        matches!(
            self,
            ValueType::OverwrittenObject | ValueType::OverwrittenObjectWithPreserveFileName
        )
    }

    /// Kinds that take part in conflict detection.
    pub fn is_conflict_candidate(self) -> bool {
        !matches!(
            self,
            ValueType::Variable | ValueType::Namespace | ValueType::Invalid | ValueType::EmptyFile
        )
    }
}

/// One script entity contributed by one mod from one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Definition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub file: String,
    pub disk_file: String,
    pub file_name_suffix: String,
    pub mod_name: String,
    /// Absolute root of the owning mod, filled in before export.
    pub mod_path: String,
    pub is_from_game: bool,
    pub is_custom_patch: bool,
    pub code: String,
    pub original_code: String,
    pub code_tag: String,
    pub code_separator: String,
    pub value_type: ValueType,
    pub content_sha: String,
    pub definition_sha: String,
    pub dependencies: Vec<String>,
    pub additional_file_names: Vec<String>,
    pub overwritten_file_names: Vec<String>,
    pub order: i32,
    #[serde(default = "default_true")]
    pub exists_in_last_file: bool,
    pub allow_duplicate: bool,
    pub custom_priority_order: i32,
    pub original_file_name: String,
    pub virtual_path: String,
    #[serde(skip)]
    pub variables: Vec<Definition>,
}

impl Definition {
    pub fn new(kind: &str, id: &str, file: &str, mod_name: &str) -> Self {
        Definition {
            id: id.to_string(),
            kind: kind.to_string(),
            file: normalize_path(file),
            mod_name: mod_name.to_string(),
            exists_in_last_file: true,
            ..Default::default()
        }
    }

    pub fn type_and_id(&self) -> String {
        format!("{}-{}", self.kind, self.id)
    }

    pub fn file_ci(&self) -> String {
        self.file.to_lowercase()
    }

    pub fn disk_file_ci(&self) -> String {
        self.disk_file.to_lowercase()
    }

    pub fn parent_directory(&self) -> &str {
        match self.file.rfind('/') {
            Some(index) => &self.file[..index],
            None => "",
        }
    }

    pub fn parent_directory_ci(&self) -> String {
        self.parent_directory().to_lowercase()
    }

    /// Every physical file this entity may map to, `file` included.
    pub fn file_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.additional_file_names.len() + 1);
        push_distinct(&mut names, &self.file);
        for name in &self.additional_file_names {
            push_distinct(&mut names, name);
        }
        names
    }

    pub fn overwritten_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.overwritten_file_names.len() + 1);
        push_distinct(&mut names, &self.file);
        for name in &self.overwritten_file_names {
            push_distinct(&mut names, name);
        }
        names
    }

    pub fn merge_file_names<I>(&mut self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        for name in names {
            if name != self.file && !self.additional_file_names.contains(&name) {
                self.additional_file_names.push(name);
            }
        }
    }

    pub fn is_localisation(&self) -> bool {
        self.file_ci().starts_with("localisation")
    }

    pub fn depends_on(&self, mod_name: &str) -> bool {
        self.dependencies.iter().any(|dep| dep == mod_name)
    }

    /// Slot identity used when removing a definition from a store.
    pub fn same_slot(&self, other: &Definition) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.mod_name == other.mod_name
            && self.file.eq_ignore_ascii_case(&other.file)
    }

    /// Fills `definition_sha` from the normalized code when the parser left it empty.
    pub fn ensure_sha(&mut self) {
        if self.definition_sha.is_empty() {
            self.definition_sha = if self.value_type == ValueType::Binary {
                self.content_sha.clone()
            } else {
                definition_sha(&self.code)
            };
        }
    }
}

/// Hash of the code with whitespace removed so formatting changes do not count as edits.
pub fn definition_sha(code: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for ch in code.chars().filter(|ch| !ch.is_whitespace()) {
        let mut buf = [0u8; 4];
        hasher.update(ch.encode_utf8(&mut buf).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

pub fn file_stem(path: &str) -> &str {
    let name = match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    };
    match name.rfind('.') {
        Some(index) if index > 0 => &name[..index],
        _ => name,
    }
}

pub fn file_extension(path: &str) -> &str {
    let name = match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    };
    match name.rfind('.') {
        Some(index) if index > 0 => &name[index..],
        _ => "",
    }
}

/// Drops characters that are not allowed in file names on any supported platform.
pub fn valid_file_name(name: &str) -> String {
    name.chars()
        .filter(|ch| !matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|ch| !ch.is_control())
        .collect()
}

/// Comment body written in place of deleted content.
pub fn empty_comment(file: &str) -> String {
    match file_extension(file).to_lowercase().as_str() {
        ".lua" => "-- empty".to_string(),
        _ => "# empty".to_string(),
    }
}

fn push_distinct(names: &mut Vec<String>, name: &str) {
    if !name.is_empty() && !names.iter().any(|existing| existing == name) {
        names.push(name.to_string());
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_id_joins_type_and_id() {
        let def = Definition::new("common/buildings", "building_1", "common/buildings/b.txt", "A");
        assert_eq!(def.type_and_id(), "common/buildings-building_1");
    }

    #[test]
    fn file_names_include_file_once() {
        let mut def = Definition::new("t", "x", "dir/a.txt", "A");
        def.merge_file_names(vec!["dir/a.txt".to_string(), "dir/b.txt".to_string()]);
        def.merge_file_names(vec!["dir/b.txt".to_string()]);
        assert_eq!(def.file_names(), vec!["dir/a.txt", "dir/b.txt"]);
    }

    #[test]
    fn backslashes_are_normalized() {
        let def = Definition::new("t", "x", "common\\Buildings\\B.txt", "A");
        assert_eq!(def.file, "common/Buildings/B.txt");
        assert_eq!(def.parent_directory_ci(), "common/buildings");
    }

    #[test]
    fn stem_and_extension() {
        assert_eq!(file_stem("common/x/00_a.txt"), "00_a");
        assert_eq!(file_extension("common/x/00_a.txt"), ".txt");
        assert_eq!(file_extension("common/x/noext"), "");
    }

    #[test]
    fn sha_ignores_whitespace() {
        assert_eq!(definition_sha("a = { b = 1 }"), definition_sha("a={\n\tb=1\n}"));
        assert_ne!(definition_sha("a = 1"), definition_sha("a = 2"));
    }

    #[test]
    fn valid_file_name_strips_reserved_characters() {
        assert_eq!(valid_file_name("a:b*c?"), "abc");
    }

    #[test]
    fn exists_in_last_file_defaults_true_when_deserialized() {
        let def: Definition = serde_json::from_str(r#"{"id":"x","type":"t"}"#).unwrap();
        assert!(def.exists_in_last_file);
    }
}
