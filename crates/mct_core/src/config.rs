//! Hierarchical configuration reader consumed at model construction.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

/// Scoped key-value reader. Lookups are relative to the current scope;
/// `push_scope` descends into a nested group and `pop_scope` returns.
pub trait ParameterProvider {
    fn exists(&self, name: &str) -> bool;
    fn is_array(&self, name: &str) -> bool;
    fn get_double(&self, name: &str) -> Result<f64>;
    fn get_int(&self, name: &str) -> Result<i64>;
    fn get_bool(&self, name: &str) -> Result<bool>;
    fn get_string(&self, name: &str) -> Result<String>;
    fn get_double_array(&self, name: &str) -> Result<Vec<f64>>;
    fn get_int_array(&self, name: &str) -> Result<Vec<i64>>;
    fn push_scope(&mut self, scope: &str) -> Result<()>;
    fn pop_scope(&mut self) -> Result<()>;

    fn get_usize(&self, name: &str) -> Result<usize> {
        let value = self.get_int(name)?;
        usize::try_from(value).map_err(|_| anyhow!("{name} must be non-negative, got {value}"))
    }
}

/// [`ParameterProvider`] over an in-memory JSON document.
#[derive(Debug, Clone)]
pub struct JsonParameterProvider {
    root: Value,
    scope: Vec<String>,
}

impl JsonParameterProvider {
    pub fn new(root: Value) -> Self {
        Self {
            root,
            scope: Vec::new(),
        }
    }

    pub fn parse(json: &str) -> Result<Self> {
        let root = serde_json::from_str(json).context("Failed to parse configuration JSON.")?;
        Ok(Self::new(root))
    }

    pub fn current_scope(&self) -> String {
        if self.scope.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.scope.join("/"))
        }
    }

    fn node(&self) -> &Value {
        self.scope
            .iter()
            .fold(&self.root, |node, key| &node[key.as_str()])
    }

    fn lookup(&self, name: &str) -> Result<&Value> {
        self.node()
            .get(name)
            .ok_or_else(|| anyhow!("Missing required key {} in {}.", name, self.current_scope()))
    }

    /// Scalars may also be given as single-element arrays.
    fn scalar(&self, name: &str) -> Result<&Value> {
        match self.lookup(name)? {
            Value::Array(items) if items.len() == 1 => Ok(&items[0]),
            Value::Array(items) => bail!(
                "Expected scalar for {} in {}, got array of length {}.",
                name,
                self.current_scope(),
                items.len()
            ),
            value => Ok(value),
        }
    }

    fn array(&self, name: &str) -> Result<Vec<&Value>> {
        Ok(match self.lookup(name)? {
            Value::Array(items) => items.iter().collect(),
            value => vec![value],
        })
    }
}

fn as_f64(name: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => value
            .as_f64()
            .ok_or_else(|| anyhow!("Value of {name} is not a number: {value}")),
    }
}

fn as_i64(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => value
            .as_i64()
            .or_else(|| value.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64))
            .ok_or_else(|| anyhow!("Value of {name} is not an integer: {value}")),
    }
}

impl ParameterProvider for JsonParameterProvider {
    fn exists(&self, name: &str) -> bool {
        self.node().get(name).is_some()
    }

    fn is_array(&self, name: &str) -> bool {
        matches!(self.node().get(name), Some(Value::Array(_)))
    }

    fn get_double(&self, name: &str) -> Result<f64> {
        as_f64(name, self.scalar(name)?)
    }

    fn get_int(&self, name: &str) -> Result<i64> {
        as_i64(name, self.scalar(name)?)
    }

    fn get_bool(&self, name: &str) -> Result<bool> {
        match self.scalar(name)? {
            Value::Bool(b) => Ok(*b),
            value => Ok(as_i64(name, value)? != 0),
        }
    }

    fn get_string(&self, name: &str) -> Result<String> {
        self.scalar(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Value of {name} is not a string."))
    }

    fn get_double_array(&self, name: &str) -> Result<Vec<f64>> {
        self.array(name)?.into_iter().map(|v| as_f64(name, v)).collect()
    }

    fn get_int_array(&self, name: &str) -> Result<Vec<i64>> {
        self.array(name)?.into_iter().map(|v| as_i64(name, v)).collect()
    }

    fn push_scope(&mut self, scope: &str) -> Result<()> {
        match self.node().get(scope) {
            Some(Value::Object(_)) => {
                self.scope.push(scope.to_string());
                Ok(())
            }
            Some(_) => bail!("{} in {} is not a group.", scope, self.current_scope()),
            None => bail!("Missing group {} in {}.", scope, self.current_scope()),
        }
    }

    fn pop_scope(&mut self) -> Result<()> {
        self.scope
            .pop()
            .map(|_| ())
            .ok_or_else(|| anyhow!("Cannot pop the root scope."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn reads_typed_values_through_scopes() {
        let mut provider = JsonParameterProvider::new(json!({
            "NCOMP": 2,
            "COL_LENGTH": [0.5],
            "discretization": { "NCOL": 16, "USE_ANALYTIC_JACOBIAN": true, "weno": { "WENO_EPS": 1e-10 } }
        }));
        assert_eq!(provider.get_usize("NCOMP").unwrap(), 2);
        assert_eq!(provider.get_double("COL_LENGTH").unwrap(), 0.5);
        assert_eq!(provider.get_double_array("NCOMP").unwrap(), vec![2.0]);

        provider.push_scope("discretization").unwrap();
        assert_eq!(provider.get_int("NCOL").unwrap(), 16);
        assert!(provider.get_bool("USE_ANALYTIC_JACOBIAN").unwrap());
        provider.push_scope("weno").unwrap();
        assert_eq!(provider.current_scope(), "/discretization/weno");
        assert_eq!(provider.get_double("WENO_EPS").unwrap(), 1e-10);
        provider.pop_scope().unwrap();
        provider.pop_scope().unwrap();
        assert!(provider.pop_scope().is_err());
        assert!(provider.exists("NCOMP"));
        assert!(!provider.is_array("NCOMP"));
    }

    #[test]
    fn reports_missing_and_malformed_keys() {
        let mut provider = JsonParameterProvider::new(json!({ "A": [1.0, 2.0], "S": "x" }));
        assert_err_contains(provider.get_double("B"), "Missing required key B");
        assert_err_contains(provider.get_double("A"), "array of length 2");
        assert_err_contains(provider.get_int("S"), "not an integer");
        assert_err_contains(provider.push_scope("A"), "not a group");
        assert_err_contains(provider.get_usize("NOPE"), "Missing");
    }

    #[test]
    fn parses_from_text() {
        let provider = JsonParameterProvider::parse(r#"{"X": [1, 2.5]}"#).unwrap();
        assert_eq!(provider.get_double_array("X").unwrap(), vec![1.0, 2.5]);
        assert!(JsonParameterProvider::parse("{").is_err());
    }
}
