use patchsmith::{
    collaborators::Collaborators,
    collection::{CollectionContext, CollectionMod},
    conflicts::{ConflictResult, PatchStateMode},
    definition::Definition,
    game::GameId,
    merge::MergeService,
    patch_collection::PatchCollectionService,
    priority::PriorityType,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

const BUILDINGS: &str = "common/buildings/b.txt";

fn write(root: &Path, relative: &str, text: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn collection(dir: &TempDir, mods: &[&str]) -> CollectionContext {
    let mods = mods
        .iter()
        .map(|name| CollectionMod {
            name: name.to_string(),
            descriptor_file: format!("mod/{name}.mod"),
            full_path: dir.path().join("workshop").join(name),
            dependencies: Vec::new(),
            version: String::new(),
        })
        .collect();
    CollectionContext {
        game: GameId::Stellaris,
        collection_name: "Main".to_string(),
        mods,
        user_dir: dir.path().join("user"),
        patch_prefix: "patchsmith_".to_string(),
    }
}

fn mod_root(ctx: &CollectionContext, name: &str) -> PathBuf {
    ctx.find_mod(name).unwrap().full_path.clone()
}

fn analyze(service: &PatchCollectionService, ctx: &CollectionContext) -> ConflictResult {
    let definitions = service.get_mod_objects(ctx, None).unwrap().unwrap();
    let result = service.find_conflicts(ctx, definitions, PatchStateMode::Default, None);
    service.initialize_patch_state(ctx, result, None).unwrap()
}

fn from_mod(result: &ConflictResult, mod_name: &str) -> Definition {
    result
        .conflicts
        .get_all()
        .into_iter()
        .find(|definition| definition.mod_name == mod_name)
        .cloned()
        .unwrap()
}

fn three_mods(dir: &TempDir) -> CollectionContext {
    let ctx = collection(dir, &["A", "B", "C"]);
    for (name, value) in [("A", 1), ("B", 2), ("C", 3)] {
        write(
            &mod_root(&ctx, name),
            BUILDINGS,
            &format!("building_1 = {{ cost = {value} }}"),
        );
    }
    ctx
}

// --- resolution ---

#[test]
fn last_mod_wins_and_its_resolution_is_exported() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);

    let group = result.conflicts.get_by_type_and_id("common/buildings-building_1");
    assert_eq!(group.len(), 3);
    let priority = service.eval_definition_priority(&ctx, &group);
    let winner = priority.definition.unwrap();
    assert_eq!(winner.mod_name, "C");
    assert_eq!(priority.priority_type, PriorityType::ModOrder);

    let pick = from_mod(&result, "A");
    assert!(service.apply_mod_patch(&ctx, &mut result, pick).unwrap());
    let exported = ctx
        .patch_location()
        .patch_dir()
        .join("common/buildings/zzz_building_1.txt");
    assert_eq!(fs::read_to_string(exported).unwrap(), "building_1 = { cost = 1 }");
    assert_eq!(result.resolved_conflicts.len(), 1);
}

#[test]
fn ignore_rules_survive_reanalysis() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);
    service.add_mods_to_ignore_list(&mut result, &["A".to_string()]);
    service.save_ignored_paths(&ctx, &mut result).unwrap();

    let result = analyze(&service, &ctx);
    assert_eq!(service.get_ignored_mods(&result), vec!["A"]);
    assert!(service.should_ignore_game_mods(&result));
}

// --- patch state sync ---

#[test]
fn cold_then_warm_sync_keeps_resolutions() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);
    assert!(!ctx.patch_location().patch_dir().join("state.json").exists());

    let pick = from_mod(&result, "B");
    service.apply_mod_patch(&ctx, &mut result, pick).unwrap();
    let custom = {
        let mut definition = service
            .create_patch_definition(&ctx, &from_mod(&result, "C"))
            .unwrap();
        definition.code = "building_1 = { cost = 9 }".to_string();
        definition
    };
    service.add_custom_mod_patch(&ctx, &mut result, custom).unwrap();

    let warm = analyze(&service, &ctx);
    assert_eq!(warm.resolved_conflicts.len(), 1);
    assert_eq!(warm.resolved_conflicts.get_all()[0].mod_name, "B");
    assert_eq!(warm.custom_conflicts.len(), 1);
    assert_eq!(service.get_patch_state_mode(&ctx).unwrap(), PatchStateMode::Default);
}

#[test]
fn edited_mod_invalidates_resolution_on_next_sync() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);
    let pick = from_mod(&result, "B");
    service.apply_mod_patch(&ctx, &mut result, pick).unwrap();

    write(&mod_root(&ctx, "A"), BUILDINGS, "building_1 = { cost = 10 }");
    let synced = analyze(&service, &ctx);
    assert!(synced.resolved_conflicts.is_empty());
    assert!(!ctx
        .patch_location()
        .patch_dir()
        .join("common/buildings/zzz_building_1.txt")
        .exists());
}

// --- staleness ---

#[test]
fn reordered_collection_needs_update() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);
    let pick = from_mod(&result, "C");
    service.apply_mod_patch(&ctx, &mut result, pick).unwrap();
    assert!(!service.patch_mod_needs_update(&ctx));

    let mut reordered = ctx.clone();
    reordered.mods.reverse();
    let fresh = PatchCollectionService::new(Collaborators::filesystem());
    assert!(fresh.patch_mod_needs_update(&reordered));
}

#[test]
fn edited_file_needs_update_after_invalidation() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);
    let pick = from_mod(&result, "C");
    service.apply_mod_patch(&ctx, &mut result, pick).unwrap();
    assert!(!service.patch_mod_needs_update(&ctx));

    write(&mod_root(&ctx, "B"), BUILDINGS, "building_1 = { cost = 20 }");
    assert!(!service.patch_mod_needs_update(&ctx));
    assert!(service.invalidate_patch_mod_state(&ctx));
    assert!(service.patch_mod_needs_update(&ctx));
}

#[test]
fn collection_without_state_is_current() {
    let dir = TempDir::new().unwrap();
    let ctx = three_mods(&dir);
    let service = PatchCollectionService::new(Collaborators::filesystem());
    assert!(!service.patch_mod_needs_update(&ctx));
}

// --- merge ---

#[test]
fn merge_by_definitions_writes_winners() {
    let dir = TempDir::new().unwrap();
    let ctx = collection(&dir, &["A", "B"]);
    write(&mod_root(&ctx, "A"), BUILDINGS, "building_1 = { cost = 1 }");
    write(&mod_root(&ctx, "A"), "common/buildings/a.txt", "building_2 = { cost = 5 }");
    write(&mod_root(&ctx, "B"), BUILDINGS, "building_1 = { cost = 2 }");
    let service = PatchCollectionService::new(Collaborators::filesystem());
    let mut result = analyze(&service, &ctx);

    let merged = MergeService::new(service.collaborators().clone())
        .merge_collection_by_definitions(&ctx, &mut result, "Merged", None)
        .unwrap()
        .unwrap();
    assert_eq!(merged.name, "Merged");
    let buildings = fs::read_to_string(merged.full_path.join(BUILDINGS)).unwrap();
    assert!(buildings.contains("cost = 2"));
    assert!(!buildings.contains("cost = 1"));
    let other = fs::read_to_string(merged.full_path.join("common/buildings/a.txt")).unwrap();
    assert!(other.contains("cost = 5"));
    assert!(ctx.user_dir.join("mod/Merged.mod").is_file());
}

#[test]
fn merge_by_files_keeps_highest_priority_copy() {
    let dir = TempDir::new().unwrap();
    let ctx = collection(&dir, &["A", "B"]);
    write(&mod_root(&ctx, "A"), BUILDINGS, "building_1 = { cost = 1 }");
    write(&mod_root(&ctx, "A"), "events/a.txt", "namespace = a");
    write(&mod_root(&ctx, "B"), BUILDINGS, "building_1 = { cost = 2 }");
    let service = MergeService::new(Collaborators::filesystem());

    let merged = service
        .merge_collection_by_files(&ctx, "Flat", None)
        .unwrap()
        .unwrap();
    assert_eq!(
        fs::read_to_string(merged.full_path.join(BUILDINGS)).unwrap(),
        "building_1 = { cost = 2 }"
    );
    assert!(merged.full_path.join("events/a.txt").is_file());
}

#[test]
fn empty_collection_merges_nothing() {
    let dir = TempDir::new().unwrap();
    let ctx = collection(&dir, &[]);
    let service = MergeService::new(Collaborators::filesystem());
    assert!(service
        .merge_collection_by_files(&ctx, "Flat", None)
        .unwrap()
        .is_none());
}
