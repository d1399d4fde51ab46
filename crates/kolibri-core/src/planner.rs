//! Goal decomposition: sentences become steps, steps get the best-matching
//! registered skill, and hints may impose an additional partial order.

use crate::skills::SkillManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Single action in a decomposed goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Ordered list of steps for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// True when `dependent` transitively depends on `dependency`.
    pub fn depends_transitively(&self, dependent: &str, dependency: &str) -> bool {
        let by_id: BTreeMap<&str, &PlanStep> = self
            .steps
            .iter()
            .map(|step| (step.id.as_str(), step))
            .collect();
        let mut frontier: Vec<&str> = vec![dependent];
        let mut seen: Vec<&str> = Vec::new();
        while let Some(current) = frontier.pop() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            let Some(step) = by_id.get(current) else {
                continue;
            };
            for parent in &step.dependencies {
                if parent == dependency {
                    return true;
                }
                frontier.push(parent);
            }
        }
        false
    }
}

/// Aligns free-text goals with available skill manifests.
#[derive(Default)]
pub struct Planner {
    skills: BTreeMap<String, SkillManifest>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_skills<'a>(&mut self, manifests: impl IntoIterator<Item = &'a SkillManifest>) {
        for manifest in manifests {
            self.skills.insert(manifest.name.clone(), manifest.clone());
        }
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    /// Splits the goal into sentence steps, assigns skills, chains each
    /// step on its predecessor, and applies hint sequences (`"a -> b"`) as
    /// extra dependencies between the steps those skills landed on.
    pub fn plan(&self, goal: &str, hints: &[String]) -> Plan {
        let sentences = split_goal(goal);
        let (sequences, name_hints) = partition_hints(hints);
        let mut steps: Vec<PlanStep> = Vec::new();
        for (index, sentence) in sentences.iter().enumerate() {
            let skill = self.match_skill(sentence, &name_hints);
            let step_id = format!(
                "step-{}-{}",
                index + 1,
                &Uuid::new_v4().simple().to_string()[..6]
            );
            let dependencies = steps
                .last()
                .map(|previous: &PlanStep| vec![previous.id.clone()])
                .unwrap_or_default();
            steps.push(PlanStep {
                id: step_id,
                description: sentence.clone(),
                skill,
                dependencies,
            });
        }
        apply_sequences(&mut steps, &sequences);
        Plan {
            goal: goal.to_string(),
            steps,
        }
    }

    /// Best-overlap match between sentence tokens and each manifest's
    /// name, inputs, and permissions. Name hints narrow the candidates.
    fn match_skill(&self, sentence: &str, name_hints: &[String]) -> Option<String> {
        let mut candidates: Vec<&SkillManifest> = self.skills.values().collect();
        if !name_hints.is_empty() {
            let hinted: Vec<&SkillManifest> = candidates
                .iter()
                .copied()
                .filter(|manifest| {
                    name_hints
                        .iter()
                        .any(|hint| hint.eq_ignore_ascii_case(&manifest.name))
                })
                .collect();
            if let Some(first) = hinted.first() {
                return Some(first.name.clone());
            }
        }
        let sentence_lower = sentence.to_lowercase();
        let mut best: Option<&SkillManifest> = None;
        let mut best_score = -1i64;
        for manifest in candidates.drain(..) {
            let keywords = std::iter::once(manifest.name.as_str())
                .chain(manifest.inputs.iter().map(String::as_str))
                .chain(manifest.permissions.iter().map(String::as_str));
            let score = keywords
                .filter(|keyword| {
                    !keyword.is_empty() && sentence_lower.contains(&keyword.to_lowercase())
                })
                .count() as i64;
            if score > best_score {
                best_score = score;
                best = Some(manifest);
            }
        }
        best.map(|manifest| manifest.name.clone())
    }
}

fn split_goal(goal: &str) -> Vec<String> {
    let sentences: Vec<String> = goal
        .replace('\n', " ")
        .split('.')
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(String::from)
        .collect();
    if sentences.is_empty() {
        vec![goal.trim().to_string()]
    } else {
        sentences
    }
}

/// Splits hints into `"a -> b"` sequence constraints and plain skill-name
/// hints.
fn partition_hints(hints: &[String]) -> (Vec<Vec<String>>, Vec<String>) {
    let mut sequences: Vec<Vec<String>> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    for hint in hints {
        if hint.contains("->") {
            let chain: Vec<String> = hint
                .split("->")
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect();
            if chain.len() >= 2 {
                sequences.push(chain);
            }
        } else if !hint.trim().is_empty() {
            names.push(hint.trim().to_string());
        }
    }
    (sequences, names)
}

/// For each consecutive `(earlier, later)` pair in a hint chain, makes the
/// step carrying `later` depend on the step carrying `earlier`.
fn apply_sequences(steps: &mut [PlanStep], sequences: &[Vec<String>]) {
    for chain in sequences {
        for pair in chain.windows(2) {
            let earlier_id = steps
                .iter()
                .find(|step| step.skill.as_deref() == Some(pair[0].as_str()))
                .map(|step| step.id.clone());
            let later = steps
                .iter_mut()
                .find(|step| step.skill.as_deref() == Some(pair[1].as_str()));
            if let (Some(earlier_id), Some(later)) = (earlier_id, later) {
                if later.id != earlier_id && !later.dependencies.contains(&earlier_id) {
                    later.dependencies.push(earlier_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, inputs: &[&str]) -> SkillManifest {
        SkillManifest::from_value(&serde_json::json!({
            "name": name,
            "version": "0.1.0",
            "inputs": inputs,
            "permissions": ["net.read:whitelist"],
            "billing": "per_call",
            "policy": {},
            "entry": format!("{name}.py"),
        }))
        .unwrap()
    }

    #[test]
    fn steps_form_a_linear_chain() {
        let planner = Planner::new();
        let plan = planner.plan("Collect sources. Draft the brief. Review wording.", &[]);
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps[0].dependencies.is_empty());
        assert_eq!(plan.steps[1].dependencies, vec![plan.steps[0].id.clone()]);
        assert_eq!(plan.steps[2].dependencies, vec![plan.steps[1].id.clone()]);
    }

    #[test]
    fn matches_best_overlapping_skill() {
        let mut planner = Planner::new();
        planner.register_skills(&[manifest("writer", &["text"]), manifest("scheduler", &["calendar"])]);
        let plan = planner.plan("Draft and refine the writer pitch deck", &[]);
        assert_eq!(plan.steps[0].skill.as_deref(), Some("writer"));
    }

    #[test]
    fn hint_sequences_impose_partial_order() {
        let mut planner = Planner::new();
        planner.register_skills(&[
            manifest("research", &["query"]),
            manifest("writer", &["text"]),
            manifest("reviewer", &["review"]),
        ]);
        let plan = planner.plan(
            "Run research on the market. Ask the writer for copy. Have the reviewer check tone.",
            &["research -> writer -> reviewer".to_string()],
        );
        let step_for = |skill: &str| {
            plan.steps
                .iter()
                .find(|step| step.skill.as_deref() == Some(skill))
                .map(|step| step.id.clone())
                .unwrap()
        };
        assert!(plan.depends_transitively(&step_for("writer"), &step_for("research")));
        assert!(plan.depends_transitively(&step_for("reviewer"), &step_for("writer")));
        assert!(plan.depends_transitively(&step_for("reviewer"), &step_for("research")));
    }

    #[test]
    fn name_hints_restrict_candidates() {
        let mut planner = Planner::new();
        planner.register_skills(&[manifest("writer", &["text"]), manifest("research", &["query"])]);
        let plan = planner.plan("Do something unrelated", &["research".to_string()]);
        assert_eq!(plan.steps[0].skill.as_deref(), Some("research"));
    }

    #[test]
    fn empty_goal_still_produces_one_step() {
        let planner = Planner::new();
        let plan = planner.plan("ship it", &[]);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].description, "ship it");
    }

    #[test]
    fn plan_round_trips_through_value() {
        let planner = Planner::new();
        let plan = planner.plan("First step. Second step.", &[]);
        let value = plan.to_value();
        let restored = Plan::from_value(&value).unwrap();
        assert_eq!(restored, plan);
    }
}
