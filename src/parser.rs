use crate::collaborators::{DefinitionParser, ParseArgs};
use crate::definition::{file_extension, normalize_path, Definition, ValueType};
use crate::game::LOCALISATION_DIR;
use crate::storage::is_text_file;

/// Line-oriented parser for `key = { ... }` script files and `.yml` localisation.
#[derive(Debug, Default, Clone)]
pub struct SimpleParser;

impl DefinitionParser for SimpleParser {
    fn parse(&self, args: ParseArgs<'_>) -> Vec<Definition> {
        let file = normalize_path(args.file);
        if args.is_binary || !is_text_file(&file) {
            let mut definition = base_definition(&args, &file, name_of(&file), ValueType::Binary);
            definition.definition_sha = args.content_sha.to_string();
            return vec![definition];
        }
        if is_localisation(&file) {
            return parse_localisation(&args, &file);
        }
        parse_script(&args, &file)
    }
}

struct Block {
    key: String,
    lines: Vec<String>,
    depth: i32,
    opened: bool,
}

enum Entry {
    Object(Block),
    Single(Definition),
}

fn parse_script(args: &ParseArgs<'_>, file: &str) -> Vec<Definition> {
    let overwritten = args.game.rules().is_overwritten_path(parent_of(file));
    let mut entries: Vec<Entry> = Vec::new();
    let mut current: Option<Block> = None;

    for line in args.lines {
        let stripped = strip_comment(line);
        let trimmed = stripped.trim();
        let (open, close) = count_braces(stripped);

        if let Some(mut block) = current.take() {
            block.lines.push(line.clone());
            if open > 0 {
                block.opened = true;
            }
            block.depth += open - close;
            if block.depth < 0 {
                return vec![whole_file(args, file, ValueType::Invalid)];
            }
            let finished = if block.opened {
                block.depth == 0
            } else {
                !trimmed.is_empty()
            };
            if finished {
                entries.push(Entry::Object(block));
            } else {
                current = Some(block);
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        let depth = open - close;
        if depth < 0 {
            return vec![whole_file(args, file, ValueType::Invalid)];
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            if depth > 0 {
                return vec![whole_file(args, file, ValueType::Invalid)];
            }
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.starts_with('@') {
            let mut variable = base_definition(args, file, key, ValueType::Variable);
            variable.code = trimmed.to_string();
            entries.push(Entry::Single(variable));
            continue;
        }
        if key.eq_ignore_ascii_case("namespace") {
            let mut namespace =
                base_definition(args, file, value.trim_matches('"'), ValueType::Namespace);
            namespace.code = trimmed.to_string();
            entries.push(Entry::Single(namespace));
            continue;
        }
        let block = Block {
            key: key.to_string(),
            lines: vec![line.clone()],
            depth,
            opened: open > 0,
        };
        if depth > 0 || (open == 0 && value.is_empty()) {
            current = Some(block);
        } else {
            entries.push(Entry::Object(block));
        }
    }

    if current.is_some() {
        return vec![whole_file(args, file, ValueType::Invalid)];
    }
    if entries.is_empty() {
        return vec![whole_file(args, file, ValueType::EmptyFile)];
    }

    let object_type = if overwritten {
        ValueType::OverwrittenObject
    } else {
        ValueType::Object
    };
    let mut variables = Vec::new();
    let mut definitions = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let mut definition = match entry {
            Entry::Single(definition) => definition,
            Entry::Object(block) => {
                let mut definition = base_definition(args, file, &block.key, object_type);
                definition.code = block.lines.join("\n");
                definition
            }
        };
        definition.order = index as i32 + 1;
        definition.original_code = definition.code.clone();
        definition.ensure_sha();
        if matches!(
            definition.value_type,
            ValueType::Variable | ValueType::Namespace
        ) {
            variables.push(definition.clone());
        }
        definitions.push(definition);
    }
    if !variables.is_empty() {
        for definition in definitions
            .iter_mut()
            .filter(|definition| definition.value_type == object_type)
        {
            definition.variables = variables.clone();
        }
    }
    definitions
}

fn parse_localisation(args: &ParseArgs<'_>, file: &str) -> Vec<Definition> {
    let mut tag: Option<String> = None;
    let mut definitions = Vec::new();
    for line in args.lines {
        let stripped = strip_comment(line).trim().trim_start_matches('\u{feff}');
        if stripped.is_empty() {
            continue;
        }
        if stripped.starts_with("l_") && stripped.ends_with(':') {
            tag = Some(stripped.trim_end_matches(':').to_string());
            continue;
        }
        let Some(code_tag) = tag.as_ref() else {
            continue;
        };
        let Some((key, _)) = stripped.split_once(':') else {
            continue;
        };
        let mut definition = base_definition(args, file, key.trim(), ValueType::Object);
        definition.code_tag = code_tag.clone();
        definition.code_separator = ":".to_string();
        definition.code = stripped.to_string();
        definition.original_code = definition.code.clone();
        definition.order = definitions.len() as i32 + 1;
        definition.ensure_sha();
        definitions.push(definition);
    }
    if definitions.is_empty() {
        return vec![whole_file(args, file, ValueType::EmptyFile)];
    }
    definitions
}

fn base_definition(args: &ParseArgs<'_>, file: &str, id: &str, value_type: ValueType) -> Definition {
    let mut definition = Definition::new(parent_of(file), id, file, args.mod_name);
    definition.disk_file = definition.file.clone();
    definition.content_sha = args.content_sha.to_string();
    definition.dependencies = args.dependencies.to_vec();
    definition.value_type = value_type;
    definition
}

fn whole_file(args: &ParseArgs<'_>, file: &str, value_type: ValueType) -> Definition {
    let mut definition = base_definition(args, file, name_of(file), value_type);
    definition.code = args.lines.join("\n");
    definition.original_code = definition.code.clone();
    definition.ensure_sha();
    definition
}

fn is_localisation(file: &str) -> bool {
    let lower = file.to_lowercase();
    (lower.starts_with(LOCALISATION_DIR) || lower.starts_with("localization"))
        && file_extension(&lower) == ".yml"
}

fn parent_of(file: &str) -> &str {
    match file.rfind('/') {
        Some(index) => &file[..index],
        None => "",
    }
}

fn name_of(file: &str) -> &str {
    match file.rfind('/') {
        Some(index) => &file[index + 1..],
        None => file,
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..index],
            _ => {}
        }
    }
    line
}

fn count_braces(text: &str) -> (i32, i32) {
    let mut in_quotes = false;
    let mut open = 0;
    let mut close = 0;
    for ch in text.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '{' if !in_quotes => open += 1,
            '}' if !in_quotes => close += 1,
            _ => {}
        }
    }
    (open, close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::GameId;

    fn parse(file: &str, text: &str) -> Vec<Definition> {
        let lines: Vec<String> = text.lines().map(|line| line.to_string()).collect();
        let dependencies = vec!["Base".to_string()];
        SimpleParser.parse(ParseArgs {
            file,
            lines: &lines,
            content_sha: "sha",
            mod_name: "A",
            dependencies: &dependencies,
            game: GameId::Stellaris,
            is_binary: false,
        })
    }

    #[test]
    fn objects_variables_and_namespaces() {
        let text = "namespace = test\n@cost = 10 # comment\nbuilding_1 = {\n\tcost = @cost\n}\nbuilding_2 = { cost = 1 }\n";
        let definitions = parse("common/buildings/b.txt", text);
        let kinds: Vec<(ValueType, &str)> = definitions
            .iter()
            .map(|definition| (definition.value_type, definition.id.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ValueType::Namespace, "test"),
                (ValueType::Variable, "@cost"),
                (ValueType::Object, "building_1"),
                (ValueType::Object, "building_2"),
            ]
        );
        let building = &definitions[2];
        assert_eq!(building.kind, "common/buildings");
        assert_eq!(building.code, "building_1 = {\n\tcost = @cost\n}");
        assert_eq!(building.order, 3);
        assert_eq!(building.variables.len(), 2);
        assert_eq!(building.dependencies, vec!["Base"]);
        assert!(!building.definition_sha.is_empty());
    }

    #[test]
    fn brace_on_following_line_joins_the_block() {
        let definitions = parse("common/buildings/b.txt", "building_1 =\n{\n\tx = 1\n}");
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].id, "building_1");
        assert_eq!(definitions[0].code, "building_1 =\n{\n\tx = 1\n}");
    }

    #[test]
    fn braces_inside_quotes_and_comments_are_ignored() {
        let definitions = parse(
            "common/buildings/b.txt",
            "a = {\n\tname = \"{x}\" # }\n}",
        );
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].value_type, ValueType::Object);
    }

    #[test]
    fn comment_only_file_is_empty() {
        let definitions = parse("common/buildings/b.txt", "# removed\n\n");
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].value_type, ValueType::EmptyFile);
        assert_eq!(definitions[0].id, "b.txt");
    }

    #[test]
    fn unbalanced_braces_are_invalid() {
        let open = parse("common/buildings/b.txt", "a = {\n\tx = 1\n");
        assert_eq!(open[0].value_type, ValueType::Invalid);
        let close = parse("common/buildings/b.txt", "a = 1\n}\n");
        assert_eq!(close[0].value_type, ValueType::Invalid);
    }

    #[test]
    fn overwritten_directories_produce_overwritten_objects() {
        let definitions = parse("gfx/sprites.gfx", "sprite_a = { name = a }");
        assert_eq!(definitions[0].value_type, ValueType::OverwrittenObject);
    }

    #[test]
    fn non_text_files_are_binary() {
        let definitions = parse("gfx/icon.dds", "");
        assert_eq!(definitions[0].value_type, ValueType::Binary);
        assert_eq!(definitions[0].definition_sha, "sha");
        assert_eq!(definitions[0].id, "icon.dds");
    }

    #[test]
    fn localisation_entries_are_tagged() {
        let definitions = parse(
            "localisation/english/a_l_english.yml",
            "\u{feff}l_english:\n key_a:0 \"A\"\n key_b:0 \"B\" # note\n",
        );
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].id, "key_a");
        assert_eq!(definitions[0].code_tag, "l_english");
        assert_eq!(definitions[0].code_separator, ":");
        assert_eq!(definitions[1].code, "key_b:0 \"B\"");
    }
}
