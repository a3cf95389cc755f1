//! Environment overlay entries.
//!
//! An [`EnvVar`] either sets a variable for every stage of a pipeline or,
//! with no value, removes it from the inherited environment. The
//! confidential flag only affects how the entry is displayed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::escape::simple_escape;

/// One environment overlay entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    /// `None` removes the variable from the child's environment.
    pub value: Option<String>,
    #[serde(default)]
    pub confidential: bool,
}

impl EnvVar {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            confidential: false,
        }
    }

    /// A variable whose value must never show up in logs or reports.
    pub fn secret(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            confidential: true,
        }
    }

    pub fn unset(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            confidential: false,
        }
    }

    /// Parse a `NAME=VALUE` assignment. The value may be empty or contain `=`.
    pub fn parse_assignment(input: &str, confidential: bool) -> Result<Self> {
        let (name, value) = input
            .split_once('=')
            .ok_or_else(|| Error::InvalidEnv(format!("expected NAME=VALUE, got {input:?}")))?;
        if name.is_empty() {
            return Err(Error::InvalidEnv(format!("empty variable name in {input:?}")));
        }
        Ok(Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            confidential,
        })
    }

    pub const fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = simple_escape(&self.name, true);
        match &self.value {
            None => write!(f, "{key} (cleared)"),
            Some(_) if self.confidential => write!(f, "{key} ***"),
            Some(value) => write!(f, "{key}=\"{}\"", simple_escape(value, false)),
        }
    }
}

/// Render a list of entries on one line, separated by spaces.
pub fn display_list(vars: &[EnvVar]) -> String {
    vars.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
