//! Child environment derivation.
//!
//! The coordinator sends a YAML document such as:
//!
//! ```yaml
//! purge: true
//! removes: [LANG]
//! overrides:
//!   PATH: /usr/bin:/bin
//!   RETRIES: 3
//! ```
//!
//! Order is fixed: start from an empty or inherited base (`purge`), delete
//! `removes`, then apply `overrides`.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvSpecError {
    #[error("Invalid environment YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Override {0:?} must be a scalar value")]
    NonScalar(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEnvSpec {
    purge: bool,
    removes: Vec<String>,
    overrides: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSpec {
    pub purge: bool,
    pub removes: Vec<String>,
    pub overrides: BTreeMap<String, String>,
}

impl EnvSpec {
    /// Parse the coordinator's environment document. Blank input means "inherit unchanged".
    pub fn parse(text: &str) -> Result<Self, EnvSpecError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: Option<RawEnvSpec> = serde_yaml::from_str(text)?;
        let raw = raw.unwrap_or_default();

        let overrides = raw
            .overrides
            .into_iter()
            .map(|(key, value)| match scalar(&value) {
                Some(value) => Ok((key, value)),
                None => Err(EnvSpecError::NonScalar(key)),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            purge: raw.purge,
            removes: raw.removes,
            overrides,
        })
    }

    /// Derive the final environment from `base`.
    pub fn apply<I>(&self, base: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = if self.purge {
            BTreeMap::new()
        } else {
            base.into_iter().collect()
        };
        for key in &self.removes {
            env.remove(key);
        }
        env.extend(
            self.overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// The agent's own environment, skipping entries that are not valid UTF-8.
pub fn inherited() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}
