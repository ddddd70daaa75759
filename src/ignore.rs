use crate::conflicts::ConflictResult;
use crate::indexed::IndexedDefinitions;
use glob::{MatchOptions, Pattern};
use std::collections::HashSet;

pub const MOD_NAME_IGNORE_ID: &str = "modName:";
pub const SHOW_GAME_MODS_ID: &str = "--showGameMods";
pub const SHOW_SELF_CONFLICTS_ID: &str = "--showSelfConflicts";

const WILDCARD_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Parsed form of the user's ignore text. One directive per line; `#` starts a comment.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoreRules {
    pub ignored_mods: Vec<String>,
    pub ignore_game_mods: bool,
    pub ignore_self_conflicts: bool,
    pub ignore: Vec<String>,
    pub include: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        IgnoreRules {
            ignored_mods: Vec::new(),
            ignore_game_mods: true,
            ignore_self_conflicts: true,
            ignore: Vec::new(),
            include: Vec::new(),
        }
    }
}

impl IgnoreRules {
    pub fn parse(text: &str) -> Self {
        let mut rules = IgnoreRules::default();
        for line in text.lines().filter(|line| !line.trim().starts_with('#')) {
            let parsed = standardize(line);
            if parsed.is_empty() {
                continue;
            }
            if let Some(name) = parsed.strip_prefix(MOD_NAME_IGNORE_ID) {
                rules.ignored_mods.push(name.trim().to_string());
            } else if parsed == SHOW_GAME_MODS_ID {
                rules.ignore_game_mods = false;
            } else if parsed == SHOW_SELF_CONFLICTS_ID {
                rules.ignore_self_conflicts = false;
            } else if let Some(include) = parsed.strip_prefix('!') {
                rules.include.push(include.trim_start_matches('!').to_string());
            } else {
                rules.ignore.push(parsed);
            }
        }
        rules
    }

    fn is_ignored_path(&self, files: &[String]) -> bool {
        self.ignore.iter().any(|rule| eval_wildcard(rule, files))
            && !self.include.iter().any(|rule| eval_wildcard(rule, files))
    }
}

/// `*` and `?` patterns match the whole path; anything else is a case-insensitive prefix.
pub fn eval_wildcard(pattern: &str, values: &[String]) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        let Ok(compiled) = Pattern::new(&escape_brackets(pattern)) else {
            return false;
        };
        return values
            .iter()
            .any(|value| compiled.matches_with(value, WILDCARD_OPTIONS));
    }
    let pattern = pattern.to_lowercase();
    values
        .iter()
        .any(|value| value.to_lowercase().starts_with(&pattern))
}

/// Rebuilds `rule_ignored_conflicts` from the ignore text and the default auto-ignores.
pub fn eval_mod_ignore_definitions(result: &mut ConflictResult, collection_mods: &[String]) {
    let mut rule_ignored = IndexedDefinitions::from_definitions(Vec::new(), true);
    let mut already_ignored: HashSet<String> = HashSet::new();
    let rules = IgnoreRules::parse(&result.ignored_paths);
    let hierarchy = result.conflicts.get_hierarchical_definitions();

    let mut ignore = |key: &str, rule_ignored: &mut IndexedDefinitions| {
        if !already_ignored.insert(key.to_lowercase()) {
            return;
        }
        if let Some(first) = result.conflicts.get_by_type_and_id(key).first() {
            rule_ignored.add_to_map((*first).clone(), false);
        }
    };

    if !result.ignored_paths.trim().is_empty() {
        let allowed: Vec<&String> = collection_mods
            .iter()
            .filter(|name| !rules.ignored_mods.contains(name))
            .collect();
        let is_allowed = |mods: &[String]| mods.iter().any(|name| allowed.contains(&name));
        for top in &hierarchy {
            if is_allowed(&top.mods) {
                for child in &top.children {
                    if !is_allowed(&child.mods) {
                        ignore(&child.key, &mut rule_ignored);
                    }
                }
                for child in &top.children {
                    let files: Vec<String> = child.file_names.iter().cloned().collect();
                    if rules.is_ignored_path(&files) {
                        ignore(&child.key, &mut rule_ignored);
                    }
                }
            } else {
                for child in &top.children {
                    ignore(&child.key, &mut rule_ignored);
                }
            }
        }
    }

    if rules.ignore_game_mods || rules.ignore_self_conflicts {
        for top in &hierarchy {
            for child in top.children.iter().filter(|child| child.mods.len() <= 1) {
                if rules.ignore_game_mods && child.non_game_definitions <= 1 {
                    ignore(&child.key, &mut rule_ignored);
                }
                if rules.ignore_self_conflicts && child.non_game_definitions > 1 {
                    ignore(&child.key, &mut rule_ignored);
                }
            }
        }
    }

    result.rule_ignored_conflicts = rule_ignored;
}

pub fn get_ignored_mods(result: &ConflictResult) -> Vec<String> {
    IgnoreRules::parse(&result.ignored_paths).ignored_mods
}

/// Replaces every `modName:` line with one line per mod in `mods`.
pub fn add_mods_to_ignore_list(result: &mut ConflictResult, mods: &[String]) {
    let mut lines: Vec<String> = result
        .ignored_paths
        .lines()
        .filter(|line| !standardize(line).starts_with(MOD_NAME_IGNORE_ID))
        .map(|line| line.to_string())
        .collect();
    lines.extend(mods.iter().map(|name| format!("{MOD_NAME_IGNORE_ID}{name}")));
    result.ignored_paths = join_lines(lines);
}

pub fn should_ignore_game_mods(result: &ConflictResult) -> bool {
    !result
        .ignored_paths
        .lines()
        .any(|line| line.trim() == SHOW_GAME_MODS_ID)
}

pub fn should_show_self_conflicts(result: &ConflictResult) -> bool {
    result
        .ignored_paths
        .lines()
        .any(|line| line.trim() == SHOW_SELF_CONFLICTS_ID)
}

/// Flips the game-mod auto-ignore and returns the new "ignore" state.
pub fn toggle_ignore_game_mods(result: &mut ConflictResult) -> bool {
    let ignoring = should_ignore_game_mods(result);
    let mut lines: Vec<String> = result.ignored_paths.lines().map(|l| l.to_string()).collect();
    if ignoring {
        lines.push(SHOW_GAME_MODS_ID.to_string());
    } else {
        lines.retain(|line| line.trim() != SHOW_GAME_MODS_ID);
    }
    result.ignored_paths = join_lines(lines);
    !ignoring
}

/// Flips the self-conflict display and returns the new "show" state.
pub fn toggle_self_mod_conflicts(result: &mut ConflictResult) -> bool {
    let showing = should_show_self_conflicts(result);
    let mut lines: Vec<String> = result.ignored_paths.lines().map(|l| l.to_string()).collect();
    if showing {
        lines.retain(|line| line.trim() != SHOW_SELF_CONFLICTS_ID);
    } else {
        lines.push(SHOW_SELF_CONFLICTS_ID.to_string());
    }
    result.ignored_paths = join_lines(lines);
    !showing
}

fn standardize(line: &str) -> String {
    line.replace('\\', "/").trim().trim_start_matches('/').to_string()
}

fn join_lines(lines: Vec<String>) -> String {
    lines.join("\n").trim_matches(|ch| ch == '\n' || ch == '\r').to_string()
}

fn escape_brackets(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Definition;

    fn conflict(mod_name: &str, id: &str, file: &str, from_game: bool) -> Definition {
        let mut definition = Definition::new("common/buildings", id, file, mod_name);
        definition.is_from_game = from_game;
        definition
    }

    fn result_with(definitions: Vec<Definition>, ignored_paths: &str) -> ConflictResult {
        ConflictResult {
            conflicts: IndexedDefinitions::from_definitions(definitions, true),
            ignored_paths: ignored_paths.to_string(),
            ..Default::default()
        }
    }

    fn mods(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn ignored_keys(result: &ConflictResult) -> Vec<String> {
        result.rule_ignored_conflicts.get_all_type_and_id_keys()
    }

    // --- parsing ---

    #[test]
    fn parse_reads_every_directive() {
        let rules = IgnoreRules::parse(
            "# comment\nmodName:Big Mod\n--showGameMods\n--showSelfConflicts\n\\common\\x\n!common/x/keep.txt",
        );
        assert_eq!(rules.ignored_mods, vec!["Big Mod"]);
        assert!(!rules.ignore_game_mods);
        assert!(!rules.ignore_self_conflicts);
        assert_eq!(rules.ignore, vec!["common/x"]);
        assert_eq!(rules.include, vec!["common/x/keep.txt"]);
    }

    #[test]
    fn wildcards_are_case_insensitive() {
        let files = vec!["common/Buildings/00_b.txt".to_string()];
        assert!(eval_wildcard("common/buildings/*.txt", &files));
        assert!(eval_wildcard("COMMON/*/00_?.txt", &files));
        assert!(eval_wildcard("common/build", &files));
        assert!(!eval_wildcard("events/*", &files));
    }

    // --- evaluation ---

    #[test]
    fn two_mod_conflicts_survive_defaults() {
        let mut result = result_with(
            vec![
                conflict("A", "b1", "common/buildings/a.txt", false),
                conflict("B", "b1", "common/buildings/b.txt", false),
            ],
            "",
        );
        eval_mod_ignore_definitions(&mut result, &mods(&["A", "B"]));
        assert!(result.rule_ignored_conflicts.is_empty());
    }

    #[test]
    fn game_versus_single_mod_is_ignored_by_default() {
        let mut result = result_with(
            vec![
                conflict("Game", "b1", "common/buildings/a.txt", true),
                conflict("A", "b1", "common/buildings/b.txt", false),
            ],
            "",
        );
        eval_mod_ignore_definitions(&mut result, &mods(&["A"]));
        assert_eq!(ignored_keys(&result), vec!["common/buildings-b1"]);

        result.ignored_paths = SHOW_GAME_MODS_ID.to_string();
        eval_mod_ignore_definitions(&mut result, &mods(&["A"]));
        assert!(result.rule_ignored_conflicts.is_empty());
    }

    #[test]
    fn self_conflicts_are_ignored_until_shown() {
        let mut result = result_with(
            vec![
                conflict("A", "b1", "common/buildings/a.txt", false),
                conflict("A", "b1", "common/buildings/b.txt", false),
            ],
            "",
        );
        eval_mod_ignore_definitions(&mut result, &mods(&["A"]));
        assert_eq!(result.rule_ignored_conflicts.len(), 1);

        toggle_self_mod_conflicts(&mut result);
        eval_mod_ignore_definitions(&mut result, &mods(&["A"]));
        assert!(result.rule_ignored_conflicts.is_empty());
    }

    #[test]
    fn path_rules_honor_includes() {
        let mut result = result_with(
            vec![
                conflict("A", "b1", "common/buildings/a.txt", false),
                conflict("B", "b1", "common/buildings/b.txt", false),
                conflict("A", "b2", "common/buildings/keep.txt", false),
                conflict("B", "b2", "common/buildings/keep2.txt", false),
            ],
            "common/buildings/*\n!common/buildings/keep*",
        );
        eval_mod_ignore_definitions(&mut result, &mods(&["A", "B"]));
        assert_eq!(ignored_keys(&result), vec!["common/buildings-b1"]);
    }

    #[test]
    fn ignored_mod_hides_its_only_conflicts() {
        let mut result = result_with(
            vec![
                conflict("A", "b1", "common/buildings/a.txt", false),
                conflict("B", "b1", "common/buildings/b.txt", false),
            ],
            "modName:A\nmodName:B",
        );
        eval_mod_ignore_definitions(&mut result, &mods(&["A", "B"]));
        assert_eq!(result.rule_ignored_conflicts.len(), 1);
    }

    // --- maintenance ---

    #[test]
    fn add_mods_replaces_previous_mod_lines() {
        let mut result = result_with(Vec::new(), "modName:Old\ncommon/x");
        add_mods_to_ignore_list(&mut result, &mods(&["New"]));
        assert_eq!(result.ignored_paths, "common/x\nmodName:New");
        assert_eq!(get_ignored_mods(&result), vec!["New"]);
    }

    #[test]
    fn toggles_round_trip() {
        let mut result = result_with(Vec::new(), "");
        assert!(should_ignore_game_mods(&result));
        assert!(!toggle_ignore_game_mods(&mut result));
        assert!(!should_ignore_game_mods(&result));
        assert!(toggle_ignore_game_mods(&mut result));
        assert_eq!(result.ignored_paths, "");

        assert!(toggle_self_mod_conflicts(&mut result));
        assert!(should_show_self_conflicts(&result));
    }
}
