//! Project-wide rules, run after a validation without errors.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::{
    codec::{
        diagnostic::{Diagnostic, DiagnosticCode},
        schema::Check,
    },
    properties::{canonicalize, BlockKey, Entity, SourceLocation},
};

/// A rule block as handed to a [`SpecRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBlock {
    pub key: BlockKey,
    pub name: String,
    pub body: String,
    pub location: SourceLocation,
}

/// Read-only view of a validated project.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    /// Entities in source order.
    pub entities: Vec<Entity>,
    pub rules: Vec<RuleBlock>,
    pub schema_names: BTreeSet<String>,
}

impl ProjectSnapshot {
    /// Resolved entities whose schema is `name`.
    pub fn instances_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities.iter().filter(move |entity| {
            entity.is_resolved()
                && entity
                    .schema_ref
                    .as_ref()
                    .map(|schema| schema.name == name)
                    .unwrap_or(entity.type_name == name)
        })
    }
}

pub trait SpecRunner: Send + Sync {
    fn run_specs(&self, snapshot: &ProjectSnapshot) -> Vec<Diagnostic>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    target: String,
    #[serde(default)]
    require: Vec<String>,
    #[serde(default)]
    unique: Vec<String>,
    #[serde(default)]
    assert: Vec<String>,
}

/// Declarative rules over all instances of one schema:
///
/// ```yaml
/// target: User
/// require: [email]
/// unique: [email]
/// assert:
///   - age >= 18
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleRunner;

impl RuleRunner {
    pub fn new() -> Self {
        RuleRunner
    }

    fn run_rule(&self, rule: &RuleBlock, snapshot: &ProjectSnapshot, out: &mut Vec<Diagnostic>) {
        let spec: RuleSpec = match serde_yaml::from_str(&rule.body) {
            Ok(spec) => spec,
            Err(e) => {
                out.push(
                    Diagnostic::new(DiagnosticCode::E0421, format!("rule '{}' is invalid: {e}", rule.name))
                        .at(rule.location.clone())
                        .with_detail("rule", &rule.name),
                );
                return;
            }
        };
        if !snapshot.schema_names.contains(&spec.target) {
            out.push(
                Diagnostic::new(
                    DiagnosticCode::E0423,
                    format!("rule '{}' targets unknown model '{}'", rule.name, spec.target),
                )
                .at(rule.location.clone())
                .with_detail("rule", &rule.name),
            );
            return;
        }
        let checks: Vec<Check> = match spec.assert.iter().map(|text| Check::parse(text)).collect() {
            Ok(checks) => checks,
            Err(e) => {
                out.push(
                    Diagnostic::new(DiagnosticCode::E0421, format!("rule '{}': {e}", rule.name))
                        .at(rule.location.clone())
                        .with_detail("rule", &rule.name),
                );
                return;
            }
        };

        let failure = |entity: &Entity, message: String| {
            Diagnostic::new(
                DiagnosticCode::E0424,
                format!("rule '{}' failed for '{}': {message}", rule.name, entity.handle),
            )
            .at(entity.location.clone())
            .with_detail("rule", &rule.name)
            .with_detail("entity", entity.id())
        };

        let mut seen: BTreeMap<(&str, String), &Entity> = BTreeMap::new();
        for entity in snapshot.instances_of(&spec.target) {
            for field in &spec.require {
                if entity.resolved_fields.get(field).map_or(true, |v| v.is_null()) {
                    out.push(failure(entity, format!("missing required field '{field}'")));
                }
            }
            for field in &spec.unique {
                let Some(value) = entity.resolved_fields.get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                match seen.get(&(field.as_str(), canonicalize(value))) {
                    Some(first) => out.push(failure(
                        entity,
                        format!("'{field}' duplicates the value of '{}'", first.handle),
                    )),
                    None => {
                        seen.insert((field.as_str(), canonicalize(value)), entity);
                    }
                }
            }
            for check in &checks {
                if let Err(e) = check.evaluate(&entity.resolved_fields) {
                    out.push(failure(entity, e));
                }
            }
        }
    }
}

impl SpecRunner for RuleRunner {
    fn run_specs(&self, snapshot: &ProjectSnapshot) -> Vec<Diagnostic> {
        let mut out = vec![];
        for rule in &snapshot.rules {
            self.run_rule(rule, snapshot, &mut out);
        }
        tracing::debug!(
            "[RuleRunner] {} rules over {} entities: {} findings",
            snapshot.rules.len(),
            snapshot.entities.len(),
            out.len()
        );
        out
    }
}
