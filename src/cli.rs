use anyhow::{anyhow, bail, Result};
use patchsmith::{
    collaborators::Collaborators,
    collection::{CollectionContext, CollectionMod, ModCollection},
    config::EngineConfig,
    conflicts::{ConflictResult, PatchStateMode},
    error::EngineError,
    game::GameId,
    logging,
    merge::MergeService,
    patch_collection::PatchCollectionService,
    progress::{ProgressCallback, ProgressEvent},
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    collection: Option<PathBuf>,
    mode: Option<PatchStateMode>,
    game: Option<GameId>,
    verbose: bool,
}

enum CliCommand {
    Analyze,
    NeedsUpdate,
    MergeDefinitions(String),
    MergeFiles(String),
    IgnoreAdd(Vec<String>),
    IgnoreList,
    ToggleGameMods,
    ToggleSelfConflicts,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args)?;
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("patchsmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            logging::init(global.verbose);
            run_command(command, &global)
        }
    }
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions {
        format: OutputFormat::Text,
        collection: None,
        mode: None,
        game: None,
        verbose: false,
    };
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String> {
            match inline.clone().or_else(|| iter.next().cloned()) {
                Some(value) => Ok(value),
                None => bail!("{name} requires a value"),
            }
        };
        match flag {
            "--format" => {
                let raw = value("--format")?;
                global.format = OutputFormat::parse(&raw)
                    .ok_or_else(|| anyhow!("Unknown format: {raw} (use 'text' or 'json')"))?;
            }
            "--collection" => global.collection = Some(PathBuf::from(value("--collection")?)),
            "--mode" => {
                let raw = value("--mode")?;
                global.mode = Some(
                    PatchStateMode::parse(&raw)
                        .ok_or_else(|| anyhow!("Unknown mode: {raw} (use 'default' or 'advanced')"))?,
                );
            }
            "--game" => {
                let raw = value("--game")?;
                global.game = Some(GameId::parse(&raw).ok_or(EngineError::UnknownGame(raw))?);
            }
            "--verbose" | "-v" => global.verbose = true,
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "analyze" => Ok(CliCommand::Analyze),
        "needs-update" => Ok(CliCommand::NeedsUpdate),
        "merge" => {
            let strategy = rest.first().map(|value| value.as_str()).unwrap_or_default();
            let name = rest
                .get(1)
                .ok_or_else(|| anyhow!("merge {strategy} requires a mod name"))?
                .to_string();
            match strategy {
                "definitions" => Ok(CliCommand::MergeDefinitions(name)),
                "files" => Ok(CliCommand::MergeFiles(name)),
                _ => bail!("Unknown merge strategy: {strategy} (use 'definitions' or 'files')"),
            }
        }
        "ignore" => {
            let sub = rest.first().map(|value| value.as_str()).unwrap_or("list");
            match sub {
                "add" => {
                    let mods: Vec<String> = rest.iter().skip(1).cloned().collect();
                    if mods.is_empty() {
                        bail!("ignore add requires one or more mod names");
                    }
                    Ok(CliCommand::IgnoreAdd(mods))
                }
                "list" => Ok(CliCommand::IgnoreList),
                "show-game-mods" => Ok(CliCommand::ToggleGameMods),
                "show-self-conflicts" => Ok(CliCommand::ToggleSelfConflicts),
                _ => bail!(
                    "Unknown ignore command: {sub} (use 'add', 'list', 'show-game-mods', or 'show-self-conflicts')"
                ),
            }
        }
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        _ => bail!("Unknown command: {head} (see 'patchsmith help')"),
    }
}

struct Session {
    ctx: CollectionContext,
    mode: PatchStateMode,
    service: PatchCollectionService,
}

impl Session {
    fn open(global: &GlobalOptions) -> Result<Self> {
        let config = EngineConfig::load_or_create()?;
        let path = global
            .collection
            .as_ref()
            .ok_or_else(|| EngineError::MissingCollection("pass --collection <file.json>".to_string()))?;
        if !path.is_file() {
            return Err(EngineError::MissingCollection(path.display().to_string()).into());
        }
        let collection = ModCollection::load(path)?;
        let game = global.game.unwrap_or(config.game);
        if game != collection.game {
            return Err(EngineError::GameMismatch {
                game,
                expected: collection.game,
            }
            .into());
        }
        if config.user_dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidState(
                "user_dir is not set in the engine config".to_string(),
            )
            .into());
        }
        let ctx = CollectionContext::new(&collection, config.user_dir.clone(), &config.patch_prefix);
        debug!(collection = %ctx.collection_name, mods = ctx.mods.len(), "opened collection");
        Ok(Session {
            ctx,
            mode: global.mode.unwrap_or(config.mode),
            service: PatchCollectionService::new(Collaborators::filesystem()),
        })
    }

    /// Parses, detects and syncs the patch mod. `None` for a collection without mods.
    fn analyze(&self) -> Result<Option<ConflictResult>> {
        let progress = progress_logger();
        let Some(definitions) = self.service.get_mod_objects(&self.ctx, Some(progress.clone()))? else {
            return Ok(None);
        };
        let result = self
            .service
            .find_conflicts(&self.ctx, definitions, self.mode, Some(progress.clone()));
        let synced = self
            .service
            .initialize_patch_state(&self.ctx, result, Some(progress))?;
        Ok(Some(synced))
    }

    fn analyze_required(&self) -> Result<ConflictResult> {
        self.analyze()?.ok_or_else(|| {
            EngineError::InvalidState(format!("collection {} has no mods", self.ctx.collection_name))
                .into()
        })
    }
}

fn progress_logger() -> ProgressCallback {
    Arc::new(|event: ProgressEvent| {
        debug!(stage = ?event.stage, percentage = event.percentage, "progress");
    })
}

fn run_command(command: CliCommand, global: &GlobalOptions) -> Result<()> {
    let session = Session::open(global)?;
    match command {
        CliCommand::Analyze => analyze(&session, global.format),
        CliCommand::NeedsUpdate => needs_update(&session, global.format),
        CliCommand::MergeDefinitions(name) => {
            let mut result = session.analyze_required()?;
            let merged = MergeService::new(session.service.collaborators().clone())
                .merge_collection_by_definitions(&session.ctx, &mut result, &name, Some(progress_logger()))?;
            print_merge(merged, global.format)
        }
        CliCommand::MergeFiles(name) => {
            let merged = MergeService::new(session.service.collaborators().clone())
                .merge_collection_by_files(&session.ctx, &name, Some(progress_logger()))?;
            print_merge(merged, global.format)
        }
        CliCommand::IgnoreAdd(mods) => {
            let mut result = session.analyze_required()?;
            let mut ignored = session.service.get_ignored_mods(&result);
            for name in mods {
                if !ignored.contains(&name) {
                    ignored.push(name);
                }
            }
            session.service.add_mods_to_ignore_list(&mut result, &ignored);
            session.service.save_ignored_paths(&session.ctx, &mut result)?;
            print_ignore(&session, &result, global.format)
        }
        CliCommand::IgnoreList => {
            let result = session.analyze_required()?;
            print_ignore(&session, &result, global.format)
        }
        CliCommand::ToggleGameMods => {
            let mut result = session.analyze_required()?;
            session.service.toggle_ignore_game_mods(&mut result);
            session.service.save_ignored_paths(&session.ctx, &mut result)?;
            print_ignore(&session, &result, global.format)
        }
        CliCommand::ToggleSelfConflicts => {
            let mut result = session.analyze_required()?;
            session.service.toggle_self_mod_conflicts(&mut result);
            session.service.save_ignored_paths(&session.ctx, &mut result)?;
            print_ignore(&session, &result, global.format)
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize, Default)]
struct AnalysisSummary {
    collection: String,
    patch: String,
    mode: PatchStateMode,
    definitions: usize,
    conflicts: usize,
    orphans: usize,
    overwritten: usize,
    resolved: usize,
    ignored: usize,
    custom: usize,
}

fn analyze(session: &Session, format: OutputFormat) -> Result<()> {
    let mut summary = AnalysisSummary {
        collection: session.ctx.collection_name.clone(),
        patch: session.ctx.patch_name(),
        mode: session.mode,
        ..Default::default()
    };
    if let Some(result) = session.analyze()? {
        summary.definitions = result.all_conflicts.len();
        summary.conflicts = result.conflicts.get_all_type_and_id_keys().len();
        summary.orphans = result.orphan_conflicts.get_all_type_and_id_keys().len();
        summary.overwritten = result.overwritten_conflicts.len();
        summary.resolved = result.resolved_conflicts.len();
        summary.ignored = result.ignored_conflicts.len();
        summary.custom = result.custom_conflicts.len();
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("{} -> {}", summary.collection, summary.patch);
            println!("  definitions  {:>6}", summary.definitions);
            println!("  conflicts    {:>6}", summary.conflicts);
            println!("  orphans      {:>6}", summary.orphans);
            println!("  overwritten  {:>6}", summary.overwritten);
            println!("  resolved     {:>6}", summary.resolved);
            println!("  ignored      {:>6}", summary.ignored);
            println!("  custom       {:>6}", summary.custom);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct NeedsUpdateItem {
    patch: String,
    needs_update: bool,
}

fn needs_update(session: &Session, format: OutputFormat) -> Result<()> {
    let item = NeedsUpdateItem {
        patch: session.ctx.patch_name(),
        needs_update: session.service.patch_mod_needs_update(&session.ctx),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&item)?),
        OutputFormat::Text => {
            if item.needs_update {
                println!("{} needs an update", item.patch);
            } else {
                println!("{} is up to date", item.patch);
            }
        }
    }
    Ok(())
}

fn print_merge(merged: Option<CollectionMod>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&merged)?),
        OutputFormat::Text => match merged {
            Some(merged) => println!("Merged into {} ({})", merged.name, merged.full_path.display()),
            None => println!("Nothing to merge"),
        },
    }
    Ok(())
}

#[derive(Serialize)]
struct IgnoreItem {
    ignored_mods: Vec<String>,
    ignore_game_mods: bool,
    show_self_conflicts: bool,
    rules: String,
}

fn print_ignore(session: &Session, result: &ConflictResult, format: OutputFormat) -> Result<()> {
    let item = IgnoreItem {
        ignored_mods: session.service.get_ignored_mods(result),
        ignore_game_mods: session.service.should_ignore_game_mods(result),
        show_self_conflicts: session.service.should_show_self_conflicts(result),
        rules: result.ignored_paths.clone(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&item)?),
        OutputFormat::Text => {
            for name in &item.ignored_mods {
                println!("  {name}");
            }
            println!("ignore game mods: {}", yes_no(item.ignore_game_mods));
            println!("show self conflicts: {}", yes_no(item.show_self_conflicts));
        }
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_help() {
    println!("patchsmith {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: patchsmith [options] <command>");
    println!();
    println!("Commands:");
    println!("  analyze                      Detect conflicts and sync the patch mod");
    println!("  needs-update                 Check whether the patch mod is stale");
    println!("  merge definitions <name>     Merge the collection from resolved definitions");
    println!("  merge files <name>           Merge the collection file by file");
    println!("  ignore list                  Show the ignore rules");
    println!("  ignore add <mod>...          Ignore conflicts coming from the given mods");
    println!("  ignore show-game-mods        Toggle hiding of conflicts with game files");
    println!("  ignore show-self-conflicts   Toggle conflicts within a single mod");
    println!("  help | version");
    println!();
    println!("Options:");
    println!("  --collection <file.json>     Collection to work on");
    println!("  --format text|json           Output format (default text)");
    println!("  --mode default|advanced      Conflict detection mode");
    println!("  --game <id>                  Override the configured game");
    println!("  -v, --verbose                Debug logging (or set {})", logging::LOG_ENV);
}
