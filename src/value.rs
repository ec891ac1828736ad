//! Lazy text values: literals and variable references, resolved when a node
//! actually starts rather than when the pipeline is described.

use std::collections::BTreeMap;

use crate::env::Env;
use crate::error::{Error, Result};

/// A piece of argv, an emitted word or a redirect path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Fixed text, used as-is.
    Literal(String),
    /// The value of a variable at resolution time.
    Variable(String),
}

impl Value {
    pub fn literal(text: impl Into<String>) -> Value {
        Value::Literal(text.into())
    }

    /// Reference a variable by name.
    pub fn var(name: impl Into<String>) -> Value {
        Value::Variable(name.into())
    }

    /// Resolve against a live environment.
    pub fn resolve(&self, env: &Env) -> Result<String> {
        match self {
            Value::Literal(text) => Ok(text.clone()),
            Value::Variable(name) => env.lookup(name),
        }
    }

    /// Resolve against a plain snapshot, for use inside a forked child where
    /// the shared store must not be touched.
    pub(crate) fn resolve_with(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        match self {
            Value::Literal(text) => Ok(text.clone()),
            Value::Variable(name) => vars
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UndefinedVariable(name.clone())),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Value {
        Value::Literal(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Value {
        Value::Literal(text)
    }
}

impl From<&String> for Value {
    fn from(text: &String) -> Value {
        Value::Literal(text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_resolves_without_env_entries() {
        let env = Env::new();
        assert_eq!(Value::literal("plain").resolve(&env).unwrap(), "plain");
    }

    #[test]
    fn variable_resolves_current_value() {
        let env = Env::new();
        env.set("target", "/tmp/out", false).unwrap();
        assert_eq!(Value::var("target").resolve(&env).unwrap(), "/tmp/out");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let env = Env::new();
        assert!(matches!(
            Value::var("nope").resolve(&env),
            Err(Error::UndefinedVariable(name)) if name == "nope"
        ));
    }

    #[test]
    fn snapshot_resolution_matches_live_resolution() {
        let env = Env::new();
        env.set("word", "w", false).unwrap();
        let snapshot = env.values_snapshot();
        assert_eq!(
            Value::var("word").resolve_with(&snapshot).unwrap(),
            Value::var("word").resolve(&env).unwrap()
        );
    }
}
