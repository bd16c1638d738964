//! Schema engine interface and the built-in declarative engine.
//!
//! The built-in [`SchemaRegistry`] reads schema bodies as YAML maps from field name
//! to a type expression:
//!
//! ```yaml
//! name: str
//! age: int?
//! role: str = member
//! timeout: int = ${DEFAULT_TIMEOUT}
//! manager: Ref[User]?
//! reviewers: list[Ref[User|Bot]]
//! __aliases__: [nickname]
//! __validators__:
//!   - age >= 0
//!   - role in [admin, member]
//! ```
//!
//! Defaults may refer to variables inherited from scope configuration.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::{
    properties::{BlockKey, Fields, SchemaRef, SourceLocation, RESERVED_ID_KEY},
    reference::whole_reference,
};

static CHECK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([\w\.]+)\s*(==|!=|<=|>=|<|>|\bin\b)\s*(.+?)\s*$").expect("static regex")
});
static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{(\w+)\}$").expect("static regex"));

const NAME_DIRECTIVE: &str = "__name__";
const ALIASES_DIRECTIVE: &str = "__aliases__";
const VALIDATORS_DIRECTIVE: &str = "__validators__";

/// Everything the engine gets to know about a schema block.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    /// Handle of the block (`model:<Name>`).
    pub name: String,
    pub origin: BlockKey,
    pub body: String,
    /// Variables visible from the block's scope.
    pub vars: BTreeMap<String, Value>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid schema: {0}")]
    Invalid(String),
    #[error("schema declares name '{declared}' but its block is named '{handle}'")]
    NameMismatch { declared: String, handle: String },
    #[error("schema declares reserved field '{0}'")]
    ReservedField(String),
}

/// A problem with one field (or the entity as a whole when `field` is empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Checks field types and invariants of resolved entities.
///
/// Calls are blocking and may be expensive; the compiler only invokes them during
/// validation.
pub trait SchemaEngine: Send + Sync {
    /// Register (or replace, for the same origin block) a schema.
    fn register_schema(&self, definition: SchemaDefinition) -> Result<SchemaRef, SchemaError>;

    /// Apply defaults and check field types. Returns the instantiated fields and
    /// every per-field problem.
    fn instantiate(&self, schema: &SchemaRef, raw_fields: &Fields) -> (Fields, Vec<FieldError>);

    /// Entity level invariants on already instantiated fields.
    fn run_validators(&self, schema: &SchemaRef, resolved_fields: &Fields) -> Vec<FieldError>;

    /// Fields holding references, with the schema names they may point at. An empty
    /// list accepts any target.
    fn reference_fields(&self, _schema: &SchemaRef) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    /// Fields whose values are alternative names for fuzzy reference matching.
    fn alias_fields(&self, _schema: &SchemaRef) -> Vec<String> {
        vec![]
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Any,
    Map,
    List(Box<FieldType>),
    Ref(Vec<String>),
}

impl FieldType {
    fn parse(expr: &str) -> Result<FieldType, String> {
        let expr = expr.trim();
        if let Some(inner) = bracketed(expr, "list") {
            return Ok(FieldType::List(Box::new(FieldType::parse(inner)?)));
        }
        if let Some(inner) = bracketed(expr, "Ref") {
            let targets: Vec<String> = inner
                .split('|')
                .map(|t| t.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
                .filter(|t| !t.is_empty())
                .collect();
            return Ok(FieldType::Ref(targets));
        }
        match expr {
            "str" | "string" => Ok(FieldType::Str),
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "number" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "any" => Ok(FieldType::Any),
            "map" | "dict" | "object" => Ok(FieldType::Map),
            "list" => Ok(FieldType::List(Box::new(FieldType::Any))),
            other => Err(format!("unknown type '{other}'")),
        }
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        // unresolved references were already reported by the resolver
        if let Some(text) = value.as_str() {
            if whole_reference(text).is_some() {
                return Ok(());
            }
        }
        let ok = match self {
            FieldType::Str => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Any => true,
            FieldType::Map => value.is_object(),
            FieldType::Ref(_) => value.is_string(),
            FieldType::List(inner) => {
                let Some(items) = value.as_array() else {
                    return Err(format!("expected {self}, found {}", value_kind(value)));
                };
                for (i, item) in items.iter().enumerate() {
                    inner.check(item).map_err(|e| format!("[{i}] {e}"))?;
                }
                true
            }
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {self}, found {}", value_kind(value)))
        }
    }

    fn ref_targets(&self) -> Option<&[String]> {
        match self {
            FieldType::Ref(targets) => Some(targets),
            FieldType::List(inner) => inner.ref_targets(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Str => f.write_str("str"),
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::Any => f.write_str("any"),
            FieldType::Map => f.write_str("map"),
            FieldType::List(inner) => write!(f, "list[{inner}]"),
            FieldType::Ref(targets) => write!(f, "Ref[{}]", targets.join("|")),
        }
    }
}

fn bracketed<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    expr.strip_prefix(name)?
        .strip_prefix('[')?
        .strip_suffix(']')
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FieldSpec {
    ty: FieldType,
    optional: bool,
    default: Option<Value>,
}

impl FieldSpec {
    fn parse(spec: &str, vars: &BTreeMap<String, Value>) -> Result<FieldSpec, String> {
        let (ty, default) = match spec.split_once('=') {
            Some((ty, default)) => (ty.trim(), Some(parse_default(default.trim(), vars)?)),
            None => (spec.trim(), None),
        };
        let (ty, optional) = match ty.strip_suffix('?') {
            Some(ty) => (ty, true),
            None => (ty, false),
        };
        Ok(FieldSpec {
            ty: FieldType::parse(ty)?,
            optional: optional || default.is_some(),
            default,
        })
    }
}

fn parse_default(text: &str, vars: &BTreeMap<String, Value>) -> Result<Value, String> {
    if let Some(caps) = VAR_PATTERN.captures(text) {
        return vars
            .get(&caps[1])
            .cloned()
            .ok_or_else(|| format!("undefined variable '{}'", &caps[1]));
    }
    serde_yaml::from_str(text).map_err(|e| format!("invalid default '{text}': {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// A `field <op> literal` assertion over entity fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    field: String,
    op: CheckOp,
    literal: Value,
    source: String,
}

impl Check {
    pub fn parse(text: &str) -> Result<Check, String> {
        let caps = CHECK_PATTERN
            .captures(text)
            .ok_or_else(|| format!("cannot parse check '{text}'"))?;
        let op = match &caps[2] {
            "==" => CheckOp::Eq,
            "!=" => CheckOp::Ne,
            "<" => CheckOp::Lt,
            "<=" => CheckOp::Le,
            ">" => CheckOp::Gt,
            ">=" => CheckOp::Ge,
            _ => CheckOp::In,
        };
        let literal: Value = serde_yaml::from_str(&caps[3])
            .map_err(|e| format!("invalid literal in check '{text}': {e}"))?;
        if op == CheckOp::In && !literal.is_array() {
            return Err(format!("'in' needs a list in check '{text}'"));
        }
        Ok(Check {
            field: caps[1].to_string(),
            op,
            literal,
            source: text.trim().to_string(),
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Evaluate against `fields`; the error explains the failure.
    pub fn evaluate(&self, fields: &Fields) -> Result<(), String> {
        let value = self
            .field
            .split('.')
            .try_fold(None::<&Value>, |current, part| {
                let next = match current {
                    None => fields.get(part),
                    Some(value) => value.get(part),
                };
                next.map(Some).ok_or(())
            })
            .ok()
            .flatten()
            .ok_or_else(|| format!("`{}` failed: field is missing", self.source))?;
        let holds = match self.op {
            CheckOp::Eq => compare(value, &self.literal) == Some(Ordering::Equal),
            CheckOp::Ne => compare(value, &self.literal) != Some(Ordering::Equal),
            CheckOp::Lt => compare(value, &self.literal) == Some(Ordering::Less),
            CheckOp::Le => matches!(
                compare(value, &self.literal),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CheckOp::Gt => compare(value, &self.literal) == Some(Ordering::Greater),
            CheckOp::Ge => matches!(
                compare(value, &self.literal),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CheckOp::In => self
                .literal
                .as_array()
                .map(|items| items.iter().any(|item| compare(value, item) == Some(Ordering::Equal)))
                .unwrap_or(false),
        };
        if holds {
            Ok(())
        } else {
            Err(format!("`{}` failed (value is {value})", self.source))
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct CompiledSchema {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
    aliases: Vec<String>,
    validators: Vec<Check>,
}

impl CompiledSchema {
    fn compile(definition: &SchemaDefinition) -> Result<CompiledSchema, SchemaError> {
        let body: Value = if definition.body.trim().is_empty() {
            Value::Object(Fields::new())
        } else {
            serde_yaml::from_str(&definition.body)
                .map_err(|e| SchemaError::Invalid(format!("body is not valid YAML: {e}")))?
        };
        let Value::Object(map) = body else {
            return Err(SchemaError::Invalid(
                "body must be a map of field name to type".to_string(),
            ));
        };

        let mut schema = CompiledSchema {
            name: definition.name.clone(),
            fields: BTreeMap::new(),
            aliases: vec![],
            validators: vec![],
        };
        for (key, value) in map {
            match key.clone().as_str() {
                NAME_DIRECTIVE => {
                    let declared = value.as_str().unwrap_or_default().to_string();
                    if declared != definition.name {
                        return Err(SchemaError::NameMismatch {
                            declared,
                            handle: definition.name.clone(),
                        });
                    }
                }
                ALIASES_DIRECTIVE => schema.aliases = string_list(&value, ALIASES_DIRECTIVE)?,
                VALIDATORS_DIRECTIVE => {
                    schema.validators = string_list(&value, VALIDATORS_DIRECTIVE)?
                        .iter()
                        .map(|text| Check::parse(text))
                        .collect::<Result<_, _>>()
                        .map_err(SchemaError::Invalid)?;
                }
                RESERVED_ID_KEY => return Err(SchemaError::ReservedField(key)),
                _ => {
                    let spec = value.as_str().ok_or_else(|| {
                        SchemaError::Invalid(format!("type of field '{key}' must be a string"))
                    })?;
                    let spec = FieldSpec::parse(spec, &definition.vars)
                        .map_err(|e| SchemaError::Invalid(format!("field '{key}': {e}")))?;
                    schema.fields.insert(key, spec);
                }
            }
        }
        Ok(schema)
    }
}

fn string_list(value: &Value, directive: &str) -> Result<Vec<String>, SchemaError> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| SchemaError::Invalid(format!("{directive} must be a list of strings")))
}

/// Thread-safe registry of declarative schemas, keyed by origin block.
#[derive(Clone, Default)]
pub struct SchemaRegistry(Arc<RwLock<BTreeMap<BlockKey, Arc<CompiledSchema>>>>);

impl SchemaRegistry {
    pub fn create() -> Self {
        Self::default()
    }

    fn get(&self, schema: &SchemaRef) -> Option<Arc<CompiledSchema>> {
        self.0.read().get(&schema.origin).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.read().values().map(|s| s.name.clone()).collect();
        f.debug_tuple("SchemaRegistry").field(&names).finish()
    }
}

impl SchemaEngine for SchemaRegistry {
    fn register_schema(&self, definition: SchemaDefinition) -> Result<SchemaRef, SchemaError> {
        let compiled = CompiledSchema::compile(&definition)?;
        tracing::debug!(
            "[SchemaRegistry] registered {} ({} fields) from {}",
            compiled.name,
            compiled.fields.len(),
            definition.origin
        );
        let schema_ref = SchemaRef {
            name: compiled.name.clone(),
            origin: definition.origin.clone(),
        };
        self.0.write().insert(definition.origin, Arc::new(compiled));
        Ok(schema_ref)
    }

    fn instantiate(&self, schema: &SchemaRef, raw_fields: &Fields) -> (Fields, Vec<FieldError>) {
        let Some(compiled) = self.get(schema) else {
            return (
                raw_fields.clone(),
                vec![FieldError::new("", format!("schema '{}' is not registered", schema.name))],
            );
        };
        let mut fields = raw_fields.clone();
        let mut errors = vec![];
        for (name, spec) in &compiled.fields {
            match raw_fields.get(name) {
                None | Some(Value::Null) => {
                    if let Some(default) = &spec.default {
                        fields.insert(name.clone(), default.clone());
                    } else if spec.optional {
                        fields.insert(name.clone(), Value::Null);
                    } else {
                        errors.push(FieldError::new(name, "field required"));
                    }
                }
                Some(value) => {
                    if let Err(e) = spec.ty.check(value) {
                        errors.push(FieldError::new(name, e));
                    }
                }
            }
        }
        (fields, errors)
    }

    fn run_validators(&self, schema: &SchemaRef, resolved_fields: &Fields) -> Vec<FieldError> {
        let Some(compiled) = self.get(schema) else {
            return vec![];
        };
        compiled
            .validators
            .iter()
            .filter_map(|check| {
                check
                    .evaluate(resolved_fields)
                    .err()
                    .map(|e| FieldError::new(check.field(), e))
            })
            .collect()
    }

    fn reference_fields(&self, schema: &SchemaRef) -> BTreeMap<String, Vec<String>> {
        self.get(schema)
            .map(|compiled| {
                compiled
                    .fields
                    .iter()
                    .filter_map(|(name, spec)| {
                        spec.ty.ref_targets().map(|t| (name.clone(), t.to_vec()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn alias_fields(&self, schema: &SchemaRef) -> Vec<String> {
        self.get(schema)
            .map(|compiled| compiled.aliases.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn definition(name: &str, body: &str) -> SchemaDefinition {
        SchemaDefinition {
            name: name.to_string(),
            origin: BlockKey::new("models.td", 0),
            body: body.to_string(),
            vars: BTreeMap::from([("DEFAULT_ROLE".to_string(), json!("member"))]),
            location: SourceLocation::new("models.td", 1, 5),
        }
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_instantiate_defaults_and_types() {
        let registry = SchemaRegistry::create();
        let user = registry
            .register_schema(definition(
                "User",
                "name: str\nage: int?\nrole: str = ${DEFAULT_ROLE}\nscore: float = 1\n",
            ))
            .unwrap();

        let (out, errors) = registry.instantiate(&user, &fields(json!({"name": "Alice", "extra": 1})));
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(out["role"], json!("member"));
        assert_eq!(out["age"], Value::Null);
        assert_eq!(out["score"], json!(1));
        assert_eq!(out["extra"], json!(1));

        let (_, errors) = registry.instantiate(&user, &fields(json!({"age": "old"})));
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec!["age: expected int, found str", "name: field required"]
        );
    }

    #[test]
    fn test_placeholders_skip_type_checks() {
        let registry = SchemaRegistry::create();
        let schema = registry
            .register_schema(definition("Task", "owner: Ref[User]\nlevel: int\n"))
            .unwrap();
        let (_, errors) = registry.instantiate(
            &schema,
            &fields(json!({"owner": "people/alice", "level": "[[missing.level]]"})),
        );
        assert!(errors.is_empty());
        assert_eq!(
            registry.reference_fields(&schema),
            BTreeMap::from([("owner".to_string(), vec!["User".to_string()])])
        );
    }

    #[test]
    fn test_register_errors() {
        let registry = SchemaRegistry::create();
        assert_eq!(
            registry.register_schema(definition("User", "__name__: Person\n")),
            Err(SchemaError::NameMismatch {
                declared: "Person".to_string(),
                handle: "User".to_string()
            })
        );
        assert_eq!(
            registry.register_schema(definition("User", "id: str\n")),
            Err(SchemaError::ReservedField("id".to_string()))
        );
        assert!(matches!(
            registry.register_schema(definition("User", "name: text\n")),
            Err(SchemaError::Invalid(_))
        ));
        assert!(matches!(
            registry.register_schema(definition("User", "n: int = ${NOPE}\n")),
            Err(SchemaError::Invalid(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_validators() {
        let registry = SchemaRegistry::create();
        let schema = registry
            .register_schema(definition(
                "User",
                "age: int\nrole: str\n__validators__:\n  - age >= 0\n  - role in [admin, member]\n",
            ))
            .unwrap();
        assert!(registry
            .run_validators(&schema, &fields(json!({"age": 3, "role": "admin"})))
            .is_empty());
        let errors = registry.run_validators(&schema, &fields(json!({"age": -1, "role": "guest"})));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "age");
    }

    #[test]
    fn test_check_parse_and_evaluate() {
        let check = Check::parse("address.zip == 12345").unwrap();
        assert!(check
            .evaluate(&fields(json!({"address": {"zip": 12345}})))
            .is_ok());
        assert!(check.evaluate(&fields(json!({"address": {}}))).is_err());
        assert!(Check::parse("role in admin").is_err());
        assert!(Check::parse("no operator here").is_err());
    }

    #[test]
    fn test_reregistering_replaces() {
        let registry = SchemaRegistry::create();
        let first = registry.register_schema(definition("User", "name: str\n")).unwrap();
        let second = registry
            .register_schema(definition("User", "name: str\nrole: str\n"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        let (_, errors) = registry.instantiate(&second, &fields(json!({"name": "x"})));
        assert_eq!(errors.len(), 1);
    }
}
