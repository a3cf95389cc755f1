//! Command-line argument shaping: stage splitting and env assignments.

use anyhow::{Result, bail};
use cmdpipe_core::EnvVar;

/// Word that separates stages on the command line.
pub const STAGE_SEPARATOR: &str = "|";

/// Split `a b | c d` into `[[a, b], [c, d]]`. Empty stages are rejected.
pub fn split_stages(words: &[String]) -> Result<Vec<Vec<String>>> {
    let stages: Vec<Vec<String>> = words
        .split(|w| w == STAGE_SEPARATOR)
        .map(<[String]>::to_vec)
        .collect();
    if let Some(index) = stages.iter().position(Vec::is_empty) {
        bail!("stage {index} of the pipeline is empty");
    }
    Ok(stages)
}

/// Build the environment overlay from `--env`, `--secret-env` and `--unset`.
pub fn parse_env(set: &[String], secret: &[String], unset: &[String]) -> Result<Vec<EnvVar>> {
    let mut vars = Vec::with_capacity(set.len() + secret.len() + unset.len());
    for assignment in set {
        vars.push(EnvVar::parse_assignment(assignment, false)?);
    }
    for assignment in secret {
        vars.push(EnvVar::parse_assignment(assignment, true)?);
    }
    for name in unset {
        if name.is_empty() || name.contains('=') {
            bail!("invalid variable name to unset: {name:?}");
        }
        vars.push(EnvVar::unset(name));
    }
    Ok(vars)
}
