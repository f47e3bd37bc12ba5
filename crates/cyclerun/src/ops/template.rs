use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::cycles::Cycle;
use crate::errors::{BindingError, OpError, ValueKind};
use crate::flow::DEFAULT_SPACE;

/// Named per-cycle values produced by a binding function.
pub type Bindings = BTreeMap<String, Value>;

/// Deterministic `cycle -> named values` generator attached to a template.
pub type BindingFn = Arc<dyn Fn(Cycle) -> Result<Bindings, OpError> + Send + Sync>;

/// Declared shape of one template field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub optional: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }
}

/// Cache key for anything prepared from a template. Derived only from the
/// template's configuration so every cycle shares the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey(String);

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pre-validated operation template as supplied by the workload loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpTemplate {
    pub name: String,
    pub space: Option<String>,
    pub statement: String,
    pub fields: Vec<FieldSpec>,
    pub ratio: u32,
}

impl OpTemplate {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            space: None,
            statement: statement.into(),
            fields: Vec::new(),
            ratio: 1,
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_ratio(mut self, ratio: u32) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn in_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn space(&self) -> &str {
        self.space.as_deref().unwrap_or(DEFAULT_SPACE)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn cache_key(&self) -> TemplateKey {
        TemplateKey(format!("{}/{}::{}", self.space(), self.name, self.statement))
    }
}

fn coerce(value: &Value, kind: ValueKind) -> Option<Value> {
    match (kind, value) {
        (ValueKind::Integer, Value::String(raw)) => raw.trim().parse::<i64>().ok().map(Value::from),
        (ValueKind::Integer, Value::Number(number)) => number
            .as_f64()
            .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
            .map(|float| Value::from(float as i64)),
        (ValueKind::Float, Value::String(raw)) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (ValueKind::Bool, Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (ValueKind::String, Value::Number(number)) => Some(Value::String(number.to_string())),
        (ValueKind::String, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
        _ => None,
    }
}

/// Per-field validation of `bindings` against the template's declared
/// fields. Convertible values are coerced and returned as corrected
/// bindings; the first field that cannot be made to fit is reported with
/// its name, value and expected type.
pub fn diagnose_bindings(template: &OpTemplate, bindings: &Bindings) -> Result<Bindings, BindingError> {
    if let Some(undeclared) = bindings
        .keys()
        .find(|name| !template.fields.is_empty() && template.field(name).is_none())
    {
        return Err(BindingError::UndeclaredField {
            template: template.name.clone(),
            field: undeclared.clone(),
        });
    }

    let mut corrected = bindings.clone();
    for field in &template.fields {
        match bindings.get(&field.name) {
            None | Some(Value::Null) if field.optional => {}
            None => {
                return Err(BindingError::MissingField {
                    template: template.name.clone(),
                    field: field.name.clone(),
                    expected: field.kind,
                });
            }
            Some(value) if field.kind.accepts(value) => {}
            Some(value) => match coerce(value, field.kind) {
                Some(fixed) => {
                    corrected.insert(field.name.clone(), fixed);
                }
                None => {
                    return Err(BindingError::TypeMismatch {
                        template: template.name.clone(),
                        field: field.name.clone(),
                        value: value.clone(),
                        expected: field.kind,
                        actual: ValueKind::of(value),
                    });
                }
            },
        }
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn insert_user() -> OpTemplate {
        OpTemplate::new("insert_user", "INSERT INTO users (id, name, score) VALUES (?, ?, ?)")
            .with_field(FieldSpec::required("id", ValueKind::Integer))
            .with_field(FieldSpec::required("name", ValueKind::String))
            .with_field(FieldSpec::optional("score", ValueKind::Float))
    }

    fn bindings(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn coerces_convertible_values() {
        let corrected = diagnose_bindings(
            &insert_user(),
            &bindings(&[("id", json!("42")), ("name", json!(7)), ("score", json!("1.5"))]),
        )
        .unwrap();
        assert_eq!(corrected["id"], json!(42));
        assert_eq!(corrected["name"], json!("7"));
        assert_eq!(corrected["score"], json!(1.5));
    }

    #[test]
    fn explains_unconvertible_value() {
        let error = diagnose_bindings(
            &insert_user(),
            &bindings(&[("id", json!("forty-two")), ("name", json!("ada"))]),
        )
        .unwrap_err();
        assert_eq!(error.field(), Some("id"));
        let message = error.to_string();
        assert!(message.contains("forty-two"), "{message}");
        assert!(message.contains("integer"), "{message}");
        assert!(message.contains("string"), "{message}");
    }

    #[test]
    fn reports_missing_and_undeclared_fields() {
        let missing = diagnose_bindings(&insert_user(), &bindings(&[("id", json!(1))])).unwrap_err();
        assert!(matches!(missing, BindingError::MissingField { ref field, .. } if field == "name"));

        let undeclared = diagnose_bindings(
            &insert_user(),
            &bindings(&[("id", json!(1)), ("name", json!("a")), ("email", json!("x"))]),
        )
        .unwrap_err();
        assert_eq!(undeclared.field(), Some("email"));
    }

    #[test]
    fn cache_key_depends_on_configuration_only() {
        let a = insert_user();
        let b = insert_user().with_ratio(5);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), a.clone().in_space("tenant").cache_key());
    }
}
