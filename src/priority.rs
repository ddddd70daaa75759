use crate::definition::{file_stem, Definition};
use crate::game::{GameId, REPLACE_DIR};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityType {
    None,
    ModOrder,
    ModOverride,
    Fios,
    Lios,
}

#[derive(Debug, Clone)]
pub struct PriorityResult<'a> {
    pub definition: Option<&'a Definition>,
    pub file_name: Option<String>,
    pub priority_type: PriorityType,
}

impl<'a> PriorityResult<'a> {
    fn none() -> Self {
        PriorityResult {
            definition: None,
            file_name: None,
            priority_type: PriorityType::None,
        }
    }

    fn pick(definition: &'a Definition, file_name: String, priority_type: PriorityType) -> Self {
        PriorityResult {
            definition: Some(definition),
            file_name: Some(file_name),
            priority_type,
        }
    }

    /// Position of the winner inside `candidates`, compared by address.
    pub fn position_in(&self, candidates: &[&Definition]) -> Option<usize> {
        let winner = self.definition?;
        candidates
            .iter()
            .position(|candidate| std::ptr::eq(*candidate, winner))
    }
}

/// Picks winning definitions for one game and one mod load order.
#[derive(Debug, Clone, Copy)]
pub struct PriorityResolver<'m> {
    game: GameId,
    mod_order: &'m [String],
}

impl<'m> PriorityResolver<'m> {
    pub fn new(game: GameId, mod_order: &'m [String]) -> Self {
        PriorityResolver { game, mod_order }
    }

    pub fn game(&self) -> GameId {
        self.game
    }

    pub fn mod_order(&self) -> &'m [String] {
        self.mod_order
    }

    /// Load order position; mods outside the collection sort first.
    pub fn mod_position(&self, mod_name: &str) -> i64 {
        self.mod_order
            .iter()
            .position(|name| name == mod_name)
            .map(|index| index as i64)
            .unwrap_or(-1)
    }

    /// Stable sort by load order position.
    pub fn sort_by_mod_order<'a>(&self, definitions: &mut [&'a Definition]) {
        definitions.sort_by_key(|definition| self.mod_position(&definition.mod_name));
    }

    pub fn eval<'a>(&self, definitions: &[&'a Definition]) -> PriorityResult<'a> {
        self.eval_with(definitions, false)
    }

    pub fn eval_with<'a>(
        &self,
        definitions: &[&'a Definition],
        force_fios: bool,
    ) -> PriorityResult<'a> {
        let mut ordered: Vec<&'a Definition> = definitions.to_vec();
        self.sort_by_mod_order(&mut ordered);

        let mut result = PriorityResult::none();
        if ordered.len() > 1 {
            result = if ordered[0].is_localisation() {
                self.eval_localisation(&ordered)
            } else {
                self.eval_script(&ordered, force_fios)
            };
        }
        if result.definition.is_none() {
            let fallback = ordered
                .iter()
                .copied()
                .find(|definition| !definition.is_from_game)
                .or_else(|| ordered.first().copied());
            if let Some(definition) = fallback {
                result.definition = Some(definition);
                result.file_name = Some(definition.file.clone());
            }
        }
        result
    }

    fn eval_localisation<'a>(&self, ordered: &[&'a Definition]) -> PriorityResult<'a> {
        let replaced: Vec<&'a Definition> = ordered
            .iter()
            .copied()
            .filter(|definition| in_replace_dir(definition))
            .collect();
        let candidates = if replaced.is_empty() {
            ordered.to_vec()
        } else {
            replaced
        };
        let top = candidates
            .iter()
            .map(|definition| definition.custom_priority_order)
            .max()
            .unwrap_or_default();
        let candidates: Vec<&'a Definition> = candidates
            .into_iter()
            .filter(|definition| definition.custom_priority_order == top)
            .collect();

        let mut unique: Vec<&'a Definition> = Vec::new();
        for group in group_by_mod(&candidates) {
            if let Some(last) = last_by(&group, |definition| file_stem(&definition.file)) {
                unique.push(*last);
            }
        }
        if unique.len() == 1 {
            let definition = unique
                .iter()
                .copied()
                .find(|definition| !definition.is_from_game)
                .unwrap_or(unique[0]);
            return PriorityResult::pick(definition, definition.file.clone(), PriorityType::None);
        }
        if unique.len() > 1 {
            let mods: Vec<&'a Definition> = unique
                .iter()
                .copied()
                .filter(|definition| !definition.is_from_game)
                .collect();
            let pool = if mods.is_empty() { &unique } else { &mods };
            if let Some(definition) = last_by(pool, |definition| file_stem(&definition.file)) {
                return PriorityResult::pick(
                    *definition,
                    definition.file.clone(),
                    PriorityType::None,
                );
            }
        }
        PriorityResult::none()
    }

    fn eval_script<'a>(&self, ordered: &[&'a Definition], force_fios: bool) -> PriorityResult<'a> {
        let mut valid: Vec<&'a Definition> = ordered
            .iter()
            .copied()
            .filter(|definition| definition.exists_in_last_file)
            .collect();
        if valid.iter().any(|definition| !definition.virtual_path.is_empty()) {
            valid = ordered
                .iter()
                .copied()
                .filter(|definition| !definition.virtual_path.is_empty())
                .collect();
        }

        if valid.len() == 1 {
            let definition = valid[0];
            return PriorityResult::pick(definition, definition.file.clone(), PriorityType::ModOrder);
        }
        if valid.len() < 2 {
            return PriorityResult::none();
        }

        let is_fios = force_fios || self.game.rules().uses_fios(valid[0]);
        let representative = |definition: &Definition| -> String {
            let names = definition.file_names();
            let picked = if is_fios {
                first_by(&names, |name| file_stem(name))
            } else {
                last_by(&names, |name| file_stem(name))
            };
            picked.cloned().unwrap_or_else(|| definition.file.clone())
        };

        let mut evals: Vec<(&'a Definition, String)> = Vec::new();
        let mut override_skipped = false;
        for &item in &valid {
            let file_name = representative(item);
            let has_overrides = valid.iter().any(|&other| {
                !other.is_custom_patch
                    && other.depends_on(&item.mod_name)
                    && representative(other) == file_name
            });
            if has_overrides {
                override_skipped = true;
                continue;
            }
            evals.push((item, file_name));
        }

        let mut unique: Vec<(&'a Definition, String)> = Vec::new();
        for group in group_evals_by_mod(&evals) {
            let picked = if is_fios {
                first_by(&group, |(_, name)| file_stem(name))
            } else {
                last_by(&group, |(_, name)| file_stem(name))
            };
            if let Some(picked) = picked {
                unique.push(picked.clone());
            }
        }

        let mut filtered_game = false;
        let shared_with_game: Vec<String> = {
            let mut names: Vec<String> = Vec::new();
            for (_, name) in &unique {
                let lower = name.to_lowercase();
                if names.contains(&lower) {
                    continue;
                }
                let sharing: Vec<&(&Definition, String)> = unique
                    .iter()
                    .filter(|(_, other)| other.to_lowercase() == lower)
                    .collect();
                if sharing.len() > 1 && sharing.iter().any(|(definition, _)| definition.is_from_game) {
                    names.push(lower);
                }
            }
            names
        };
        if !shared_with_game.is_empty() {
            unique.retain(|(definition, name)| {
                !(definition.is_from_game && shared_with_game.contains(&name.to_lowercase()))
            });
            filtered_game = true;
        }

        if unique.len() == 1 && (override_skipped || filtered_game) {
            let picked = evals
                .iter()
                .find(|(definition, _)| !definition.is_from_game)
                .or_else(|| evals.first());
            if let Some(&(definition, ref name)) = picked {
                let priority_type = if override_skipped {
                    PriorityType::ModOverride
                } else {
                    PriorityType::ModOrder
                };
                return PriorityResult::pick(definition, name.clone(), priority_type);
            }
        } else if unique.len() > 1 {
            let first_name = unique[0].1.to_lowercase();
            if unique
                .iter()
                .all(|(_, name)| name.to_lowercase() == first_name)
            {
                let picked = unique
                    .iter()
                    .find(|(definition, _)| definition.is_custom_patch)
                    .or_else(|| unique.last());
                if let Some(&(definition, ref name)) = picked {
                    return PriorityResult::pick(definition, name.clone(), PriorityType::ModOrder);
                }
            } else if is_fios {
                if let Some(&(definition, ref name)) = first_by(&unique, |(_, name)| file_stem(name)) {
                    return PriorityResult::pick(definition, name.clone(), PriorityType::Fios);
                }
            } else if let Some(&(definition, ref name)) = last_by(&unique, |(_, name)| file_stem(name))
            {
                return PriorityResult::pick(definition, name.clone(), PriorityType::Lios);
            }
        }
        PriorityResult::none()
    }
}

fn in_replace_dir(definition: &Definition) -> bool {
    definition
        .parent_directory_ci()
        .split('/')
        .any(|segment| segment == REPLACE_DIR)
}

/// Groups by mod in first-appearance order.
fn group_by_mod<'a>(definitions: &[&'a Definition]) -> Vec<Vec<&'a Definition>> {
    let mut groups: Vec<Vec<&'a Definition>> = Vec::new();
    for &definition in definitions {
        match groups
            .iter_mut()
            .find(|group| group[0].mod_name == definition.mod_name)
        {
            Some(group) => group.push(definition),
            None => groups.push(vec![definition]),
        }
    }
    groups
}

fn group_evals_by_mod<'a>(
    evals: &[(&'a Definition, String)],
) -> Vec<Vec<(&'a Definition, String)>> {
    let mut groups: Vec<Vec<(&'a Definition, String)>> = Vec::new();
    for eval in evals {
        match groups
            .iter_mut()
            .find(|group| group[0].0.mod_name == eval.0.mod_name)
        {
            Some(group) => group.push(eval.clone()),
            None => groups.push(vec![eval.clone()]),
        }
    }
    groups
}

/// Ordinal minimum; the earliest element wins ties.
fn first_by<T, F>(items: &[T], key: F) -> Option<&T>
where
    F: Fn(&T) -> &str,
{
    items.iter().reduce(|best, item| {
        if key(item).cmp(key(best)) == Ordering::Less {
            item
        } else {
            best
        }
    })
}

/// Ordinal maximum; the latest element wins ties.
fn last_by<T, F>(items: &[T], key: F) -> Option<&T>
where
    F: Fn(&T) -> &str,
{
    items.iter().reduce(|best, item| {
        if key(item).cmp(key(best)) != Ordering::Less {
            item
        } else {
            best
        }
    })
}
