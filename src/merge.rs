use crate::collaborators::{Collaborators, ParseArgs};
use crate::collection::{CollectionContext, CollectionMod, MOD_DIRECTORY, MOD_EXTENSION};
use crate::conflicts::ConflictResult;
use crate::definition::{valid_file_name, Definition, ValueType};
use crate::game::GameRules;
use crate::indexed::{group_ordered, IndexedDefinitions};
use crate::priority::PriorityResolver;
use crate::progress::{ProgressCallback, ProgressStage, ProgressTracker};
use anyhow::Result;
use std::{cmp::Ordering, collections::HashSet, path::PathBuf};
use tracing::{debug, info};

const INDENT: usize = 4;

fn closing_separator(separator: &str) -> Option<&'static str> {
    match separator {
        "{" => Some("}"),
        "[" => Some("]"),
        _ => None,
    }
}

fn is_variable_like(definition: &Definition) -> bool {
    matches!(
        definition.value_type,
        ValueType::Variable | ValueType::Namespace
    )
}

/// Reassembles definitions into one script block.
///
/// Definitions are grouped by `code_tag` (case-insensitive, sorted). Untagged groups are
/// emitted as namespaces, variables, then bodies. Tagged groups are wrapped in
/// `tag = {` ... `}` or `tag:` with indented content.
pub fn merge_definitions(definitions: &[Definition]) -> Option<Definition> {
    let first = definitions.first()?;
    let mut copy = first.clone();
    if is_variable_like(&copy) {
        copy.value_type = ValueType::Object;
    }

    let mut groups = group_ordered(definitions, |definition| definition.code_tag.to_lowercase());
    groups.sort_by(|(left, _), (right, _)| left.cmp(right));

    let tagged_variables: Vec<&str> = definitions
        .iter()
        .filter(|definition| {
            definition.value_type == ValueType::Variable && !definition.code_tag.trim().is_empty()
        })
        .map(|definition| definition.original_code.as_str())
        .collect();

    let mut lines: Vec<String> = Vec::new();
    for (_, group) in &groups {
        let namespaces = group
            .iter()
            .filter(|definition| definition.value_type == ValueType::Namespace)
            .map(|definition| definition.original_code.as_str());
        let bodies: Vec<&str> = group
            .iter()
            .filter(|definition| !is_variable_like(definition))
            .map(|definition| definition.original_code.as_str())
            .collect();
        let head = group[0];
        if head.code_tag.trim().is_empty() {
            let variables = group
                .iter()
                .filter(|definition| definition.value_type == ValueType::Variable)
                .map(|definition| definition.original_code.as_str());
            for code in namespaces.chain(variables).chain(bodies) {
                lines.push(code.to_string());
            }
        } else {
            let vars: Vec<&str> = namespaces.chain(tagged_variables.iter().copied()).collect();
            merge_code(&mut lines, &head.code_tag, &head.code_separator, &vars, &bodies);
        }
    }
    copy.code = lines.join("\n");
    Some(copy)
}

fn merge_code(lines: &mut Vec<String>, tag: &str, separator: &str, vars: &[&str], bodies: &[&str]) {
    match closing_separator(separator) {
        Some(closing) => {
            lines.push(format!("{tag} = {separator}"));
            push_indented(lines, vars, INDENT);
            push_indented(lines, bodies, INDENT);
            lines.push(closing.to_string());
        }
        None => {
            lines.push(format!("{tag}{separator}"));
            push_indented(lines, vars, INDENT);
            push_indented(lines, bodies, INDENT);
        }
    }
}

fn push_indented(lines: &mut Vec<String>, blocks: &[&str], indent: usize) {
    let pad = " ".repeat(indent);
    for block in blocks {
        for line in block.lines() {
            lines.push(format!("{pad}{line}"));
        }
    }
}

fn clean_code(code: &str) -> String {
    code.replace([' ', '\t'], "").trim().to_string()
}

fn next_variable_name(export: &[Definition], variable: &Definition) -> String {
    let taken = |name: &str| export.iter().any(|item| item.id.eq_ignore_ascii_case(name));
    let mut count = export
        .iter()
        .filter(|item| item.id.eq_ignore_ascii_case(&variable.id))
        .count()
        + 1;
    let mut name = format!("{}_{count}", variable.id);
    while taken(&name) {
        count += 1;
        name = format!("{}_{count}", variable.id);
    }
    name
}

/// Renames whole-token references to a variable.
fn rename_variable(code: &str, old_id: &str, new_id: &str) -> String {
    code.split('\n')
        .map(|line| {
            line.split(' ')
                .map(|token| {
                    if token.trim() == old_id {
                        token.replace(old_id, new_id)
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_namespaces(export: &mut Vec<Definition>, definition: &Definition) {
    for namespace in definition
        .variables
        .iter()
        .filter(|item| item.value_type == ValueType::Namespace)
    {
        let code = clean_code(&namespace.code);
        let exists = export.iter().any(|item| {
            item.value_type == ValueType::Namespace && clean_code(&item.code) == code
        });
        if !exists {
            let mut copy = namespace.clone();
            copy.code_tag = definition.code_tag.clone();
            copy.code_separator = definition.code_separator.clone();
            export.push(copy);
        }
    }
}

/// Copies the definition's variables under unique ids and rewrites its code to match.
fn push_variables(export: &mut Vec<Definition>, definition: &mut Definition) {
    let variables: Vec<Definition> = definition
        .variables
        .iter()
        .filter(|item| item.value_type == ValueType::Variable)
        .cloned()
        .collect();
    for variable in variables {
        let mut copy = variable.clone();
        let old_id = copy.id.clone();
        copy.id = next_variable_name(export, &variable);
        copy.code = rename_variable(&copy.code, &old_id, &copy.id);
        copy.original_code = rename_variable(&copy.original_code, &old_id, &copy.id);
        copy.code_tag = definition.code_tag.clone();
        copy.code_separator = definition.code_separator.clone();
        definition.code = rename_variable(&definition.code, &old_id, &copy.id);
        definition.original_code = rename_variable(&definition.original_code, &old_id, &copy.id);
        export.push(copy);
    }
}

fn carry_variables(export: &mut Vec<Definition>, mut definition: Definition) {
    if !definition.variables.is_empty() {
        push_namespaces(export, &definition);
        push_variables(export, &mut definition);
    }
    export.push(definition);
}

/// Contributions from minority mods take the `order` of the majority mod's matching slot.
fn fix_order(all: &IndexedDefinitions, rules: &GameRules, export: &mut [Definition]) {
    let counts: Vec<(String, usize)> = group_ordered(export.iter(), |item| item.mod_name.clone())
        .into_iter()
        .map(|(name, items)| (name, items.len()))
        .collect();
    if counts.len() < 2 {
        return;
    }
    let mut top: Option<&(String, usize)> = None;
    for entry in &counts {
        if top.map_or(true, |current| entry.1 > current.1) {
            top = Some(entry);
        }
    }
    let Some((top_mod, _)) = top else {
        return;
    };
    for item in export.iter_mut().filter(|item| item.mod_name != *top_mod) {
        let matches: Vec<&Definition> = all
            .get_by_type_and_id(&item.type_and_id())
            .into_iter()
            .filter(|definition| definition.mod_name == *top_mod)
            .collect();
        if matches.len() > 1 {
            let file_ci = item.file_ci();
            item.order = match matches.iter().find(|definition| definition.file_ci() == file_ci) {
                Some(found) => found.order,
                None if rules.uses_fios(item) => matches
                    .iter()
                    .min_by(|left, right| left.file.cmp(&right.file))
                    .map(|definition| definition.order)
                    .unwrap_or(item.order),
                None => matches
                    .iter()
                    .max_by(|left, right| left.file.cmp(&right.file))
                    .map(|definition| definition.order)
                    .unwrap_or(item.order),
            };
        } else if let Some(single) = matches.first() {
            item.order = single.order;
        }
    }
}

fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |value: &str| -> Vec<u64> {
        value
            .trim_start_matches('v')
            .split('.')
            .map(|part| part.trim_matches('*').parse().unwrap_or(0))
            .collect()
    };
    parse(left).cmp(&parse(right))
}

/// Builds merged collection mods from analysis results or from raw mod files.
pub struct MergeService {
    collaborators: Collaborators,
}

impl MergeService {
    pub fn new(collaborators: Collaborators) -> Self {
        MergeService { collaborators }
    }

    /// Creates an empty mod named after `merge_name` and returns its descriptor.
    fn prepare_output(&self, ctx: &CollectionContext, merge_name: &str) -> Result<CollectionMod> {
        let folder = valid_file_name(merge_name);
        let writer = &self.collaborators.mod_writer;
        writer.purge_mod_directory(&ctx.user_dir, Some(&format!("{MOD_DIRECTORY}/{folder}")))?;
        writer.create_mod_directory(&ctx.user_dir, Some(MOD_DIRECTORY))?;
        let full_path = ctx.mod_root().join(&folder);
        writer.create_mod_directory(&full_path, None)?;
        let version = ctx
            .mods
            .iter()
            .map(|entry| entry.version.as_str())
            .filter(|version| !version.is_empty())
            .max_by(|left, right| compare_versions(left, right))
            .unwrap_or_default()
            .to_string();
        let descriptor = CollectionMod {
            name: merge_name.to_string(),
            descriptor_file: format!("{MOD_DIRECTORY}/{folder}{MOD_EXTENSION}"),
            full_path,
            dependencies: Vec::new(),
            version,
        };
        writer.write_descriptor(&ctx.user_dir, &descriptor)?;
        Ok(descriptor)
    }

    /// Writes one mod holding the resolved state of every analysed file.
    pub fn merge_collection_by_definitions(
        &self,
        ctx: &CollectionContext,
        result: &mut ConflictResult,
        merge_name: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Option<CollectionMod>> {
        if result.all_conflicts.is_empty() {
            return Ok(None);
        }
        let output = self.prepare_output(ctx, merge_name)?;
        let export_path: PathBuf = output.full_path.clone();
        info!(merge = %output.name, "merging collection by definitions");

        let state = self
            .collaborators
            .patch_exporter
            .get_patch_state(&ctx.patch_location(), true)?
            .unwrap_or_default();
        result.resolved_conflicts =
            IndexedDefinitions::from_definitions(state.resolved_conflicts.clone(), true);
        result.ignored_conflicts =
            IndexedDefinitions::from_definitions(state.ignored_conflicts.clone(), true);
        result.custom_conflicts =
            IndexedDefinitions::from_definitions(state.custom_conflicts.clone(), false);
        let history = IndexedDefinitions::from_definitions(state.conflict_history.clone(), false);

        let total = result
            .all_conflicts
            .get_all()
            .into_iter()
            .filter(|definition| !is_variable_like(definition))
            .count()
            + result.custom_conflicts.len();
        let tracker = ProgressTracker::new(ProgressStage::Merge, total, 99.9, progress);
        let exporter = &self.collaborators.merge_exporter;

        for file in result.custom_conflicts.get_all_file_keys() {
            let Some(custom) = result.custom_conflicts.get_by_file(&file).first().copied() else {
                continue;
            };
            let mut definition = custom.clone();
            if let Some(entry) = history.get_by_type_and_id(&definition.type_and_id()).first() {
                definition.code = entry.code.clone();
            }
            let mut batch = vec![definition];
            ctx.populate_mod_path(&mut batch);
            exporter.export_definitions(&export_path, &batch)?;
            tracker.advance(1);
        }

        let mod_order = ctx.mod_order();
        let resolver = PriorityResolver::new(ctx.game, &mod_order);
        let rules = ctx.game.rules();
        let mut dumped: HashSet<String> = HashSet::new();

        for file in result.all_conflicts.get_all_file_keys() {
            let definitions: Vec<&Definition> = result
                .all_conflicts
                .get_by_file(&file)
                .into_iter()
                .filter(|definition| definition.value_type != ValueType::EmptyFile)
                .collect();
            if definitions.is_empty() {
                continue;
            }
            let groups = group_ordered(definitions, |definition| definition.type_and_id().to_lowercase());

            let mut export: Vec<Definition> = Vec::new();
            for (type_and_id, group) in &groups {
                if is_variable_like(group[0]) {
                    continue;
                }
                let resolved = result.resolved_conflicts.get_by_type_and_id(type_and_id);
                let overwritten = result.overwritten_conflicts.get_by_type_and_id(type_and_id);
                if !resolved.is_empty() {
                    for item in resolved {
                        if dumped.contains(&item.type_and_id()) {
                            continue;
                        }
                        if item.value_type == ValueType::Binary {
                            dumped.insert(item.type_and_id());
                            export.push(item.clone());
                            continue;
                        }
                        let code = history
                            .get_by_type_and_id(&item.type_and_id())
                            .first()
                            .map(|entry| entry.code.clone())
                            .unwrap_or_else(|| item.code.clone());
                        let lines: Vec<String> = code.lines().map(|line| line.to_string()).collect();
                        let parsed = self.collaborators.parser.parse(ParseArgs {
                            file: &item.file,
                            lines: &lines,
                            content_sha: &item.content_sha,
                            mod_name: &item.mod_name,
                            dependencies: &item.dependencies,
                            game: ctx.game,
                            is_binary: false,
                        });
                        let variables: Vec<Definition> =
                            parsed.iter().filter(|entry| is_variable_like(entry)).cloned().collect();
                        for mut other in parsed.into_iter().filter(|entry| !is_variable_like(entry)) {
                            other.variables = variables.clone();
                            dumped.insert(other.type_and_id());
                            carry_variables(&mut export, other);
                        }
                    }
                } else if !overwritten.is_empty() {
                    for item in overwritten {
                        if dumped.insert(item.type_and_id()) {
                            carry_variables(&mut export, item.clone());
                        }
                    }
                } else {
                    let mut conflicted = result.conflicts.get_by_type_and_id(type_and_id);
                    let winner = if conflicted.is_empty() {
                        Some(group[0])
                    } else {
                        resolver.sort_by_mod_order(&mut conflicted);
                        resolver.eval(&conflicted).definition
                    };
                    if let Some(winner) = winner {
                        if dumped.insert(winner.type_and_id()) {
                            carry_variables(&mut export, winner.clone());
                        }
                    }
                }
                tracker.advance(group.len());
            }

            if export.iter().all(is_variable_like) {
                continue;
            }
            fix_order(&result.all_conflicts, rules, &mut export);

            let mut variables: Vec<Definition> =
                export.iter().filter(|item| is_variable_like(item)).cloned().collect();
            variables.sort_by(|left, right| left.id.cmp(&right.id));
            let mut others: Vec<Definition> =
                export.into_iter().filter(|item| !is_variable_like(item)).collect();
            others.sort_by_key(|item| item.order);
            variables.extend(others);

            let Some(mut merged) = merge_definitions(&variables) else {
                continue;
            };
            if let Some(original) = result.all_conflicts.get_by_file(&file).first() {
                merged.file = original.file.clone();
                merged.disk_file = original.disk_file.clone();
            }
            let mut batch = vec![merged];
            ctx.populate_mod_path(&mut batch);
            exporter.export_definitions(&export_path, &batch)?;
            debug!(file = %file, "merged file");
        }
        tracker.finish();
        Ok(Some(output))
    }

    /// Copies every game file of every mod in load order, the patch mod last, so the
    /// highest-priority copy of each file survives.
    pub fn merge_collection_by_files(
        &self,
        ctx: &CollectionContext,
        merge_name: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Option<CollectionMod>> {
        if ctx.mods.is_empty() {
            return Ok(None);
        }
        let output = self.prepare_output(ctx, merge_name)?;
        info!(merge = %output.name, "merging collection by files");

        let mut sources: Vec<(PathBuf, Vec<String>)> = Vec::new();
        let mut roots: Vec<PathBuf> = ctx.mods.iter().map(|entry| entry.full_path.clone()).collect();
        let patch_dir = ctx.patch_location().patch_dir();
        if self.collaborators.mod_writer.mod_directory_exists(&patch_dir) {
            roots.push(patch_dir);
        }
        for root in roots {
            let files: Vec<String> = self
                .collaborators
                .reader
                .read(&root, ctx.game)
                .into_iter()
                .map(|info| info.file_name)
                .collect();
            sources.push((root, files));
        }

        let total = sources.iter().map(|(_, files)| files.len()).sum();
        let tracker = ProgressTracker::new(ProgressStage::FileMerge, total, 100.0, progress);
        for (root, files) in &sources {
            for file in files {
                self.collaborators
                    .merge_exporter
                    .export_file(root, file, &output.full_path)?;
                tracker.advance(1);
            }
        }
        tracker.finish();
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, code: &str, value_type: ValueType) -> Definition {
        let mut definition = Definition::new("common/t", id, "common/t/a.txt", "A");
        definition.code = code.to_string();
        definition.original_code = code.to_string();
        definition.value_type = value_type;
        definition
    }

    fn tagged(mut definition: Definition, tag: &str, separator: &str) -> Definition {
        definition.code_tag = tag.to_string();
        definition.code_separator = separator.to_string();
        definition
    }

    // --- merge_definitions ---

    #[test]
    fn single_untagged_definition_is_unchanged() {
        let definition = def("a", "a = {\n\tx = 1\n}", ValueType::Object);
        let merged = merge_definitions(&[definition.clone()]).unwrap();
        assert_eq!(merged.code, definition.original_code);
    }

    #[test]
    fn empty_group_merges_to_nothing() {
        assert!(merge_definitions(&[]).is_none());
    }

    #[test]
    fn untagged_group_orders_namespaces_then_variables() {
        let merged = merge_definitions(&[
            def("a", "a = { }", ValueType::Object),
            def("@v", "@v = 1", ValueType::Variable),
            def("ns", "namespace = ns", ValueType::Namespace),
        ])
        .unwrap();
        assert_eq!(merged.code, "namespace = ns\n@v = 1\na = { }");
        assert_eq!(merged.value_type, ValueType::Object);
    }

    #[test]
    fn curly_tag_wraps_and_closes() {
        let merged = merge_definitions(&[
            tagged(def("a", "a = yes", ValueType::Object), "on_game_start", "{"),
            tagged(def("@v", "@v = 1", ValueType::Variable), "on_game_start", "{"),
        ])
        .unwrap();
        assert_eq!(merged.code, "on_game_start = {\n    @v = 1\n    a = yes\n}");
    }

    #[test]
    fn other_separators_have_no_closing_token() {
        let merged = merge_definitions(&[
            tagged(def("key_a", "key_a:0 \"A\"", ValueType::Object), "l_english", ":"),
            tagged(def("key_b", "key_b:0 \"B\"", ValueType::Object), "l_english", ":"),
        ])
        .unwrap();
        assert_eq!(merged.code, "l_english:\n    key_a:0 \"A\"\n    key_b:0 \"B\"");
    }

    #[test]
    fn groups_are_sorted_by_tag() {
        let merged = merge_definitions(&[
            tagged(def("b", "b = 1", ValueType::Object), "Zeta", "{"),
            tagged(def("a", "a = 1", ValueType::Object), "alpha", "{"),
        ])
        .unwrap();
        assert!(merged.code.starts_with("alpha = {"));
        assert!(merged.code.ends_with("Zeta = {\n    b = 1\n}"));
    }

    // --- variables ---

    #[test]
    fn variables_are_renamed_uniquely() {
        let mut export = vec![def("@cost_1", "@cost_1 = 5", ValueType::Variable)];
        let mut object = def("a", "a = {\n\tcost = @cost\n}", ValueType::Object);
        object.variables = vec![def("@cost", "@cost = 10", ValueType::Variable)];
        push_variables(&mut export, &mut object);
        assert_eq!(export[1].id, "@cost_2");
        assert_eq!(export[1].code, "@cost_2 = 10");
        assert_eq!(object.code, "a = {\n\tcost = @cost_2\n}");
    }

    #[test]
    fn namespaces_are_not_duplicated() {
        let mut export = vec![def("ns", "namespace = ns", ValueType::Namespace)];
        let mut object = def("a", "a = { }", ValueType::Object);
        object.variables = vec![def("ns", "namespace  =  ns", ValueType::Namespace)];
        push_namespaces(&mut export, &object);
        assert_eq!(export.len(), 1);
    }

    #[test]
    fn rename_only_touches_whole_tokens() {
        assert_eq!(
            rename_variable("x = @a\ny = @ab", "@a", "@a_1"),
            "x = @a_1\ny = @ab"
        );
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("v3.*", "3.0"), Ordering::Equal);
    }
}
