//! Command specification: the stages of a pipeline plus the working
//! directory and environment overlay shared by all of them.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use cmdpipe_core::EnvVar;

use crate::error::{Error, Result};

/// One stage: a program and its arguments.
///
/// Stages converted from a [`std::process::Command`] also carry that
/// command's own working directory and environment edits; the pipeline-wide
/// overlay is applied on top of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSpec {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, Option<OsString>)>,
}

impl StageSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build from an argv-style list: the first element is the program.
    /// An empty list yields a stage with an empty program, which launch
    /// rejects as a configuration error.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().unwrap_or_default();
        Self {
            program,
            args: argv.collect(),
            ..Self::default()
        }
    }

    /// Capture a pre-built low-level descriptor. Program, arguments,
    /// working directory and environment edits are kept; stdio settings
    /// are replaced by the redirect policy at launch.
    pub fn from_command(command: &std::process::Command) -> Self {
        Self {
            program: command.get_program().to_os_string(),
            args: command.get_args().map(OsStr::to_os_string).collect(),
            current_dir: command.get_current_dir().map(Path::to_path_buf),
            envs: command
                .get_envs()
                .map(|(k, v)| (k.to_os_string(), v.map(OsStr::to_os_string)))
                .collect(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Program and arguments as display strings.
    pub fn argv_lossy(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    pub(crate) fn to_command(
        &self,
        working_dir: Option<&Path>,
        overlay: &[EnvVar],
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = working_dir.or(self.current_dir.as_deref()) {
            cmd.current_dir(dir);
        }
        for (name, value) in &self.envs {
            match value {
                Some(value) => cmd.env(name, value),
                None => cmd.env_remove(name),
            };
        }
        for var in overlay {
            match &var.value {
                Some(value) => cmd.env(&var.name, value),
                None => cmd.env_remove(&var.name),
            };
        }
        cmd
    }
}

/// Everything needed to launch one pipeline.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub stages: Vec<StageSpec>,
    /// `None` inherits the caller's working directory.
    pub working_dir: Option<PathBuf>,
    pub env: Vec<EnvVar>,
}

impl CommandSpec {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self {
            stages,
            ..Self::default()
        }
    }

    /// Reject specs that cannot be launched, before any OS call.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config("cmdline not set".to_string()));
        }
        if let Some(index) = self.stages.iter().position(|s| s.program.is_empty()) {
            return Err(Error::Config(format!("stage {index} has an empty program")));
        }
        if let Some(var) = self.env.iter().find(|v| v.name.is_empty() || v.name.contains('=')) {
            return Err(Error::Config(format!(
                "invalid environment variable name {:?}",
                var.name
            )));
        }
        Ok(())
    }

    /// The full command line for display, stages joined by `|`.
    pub fn command_line(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                out.push("|".to_string());
            }
            out.extend(stage.argv_lossy());
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn from_argv_splits_program() {
        let stage = StageSpec::from_argv(["grep", "-v", "x"]);
        assert_eq!(stage.program(), "grep");
        assert_eq!(stage.arguments(), &["-v", "x"]);
    }

    #[test]
    fn empty_argv_is_rejected_at_validation() {
        let spec = CommandSpec::new(vec![StageSpec::from_argv(Vec::<String>::new())]);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("stage 0 has an empty program"));
    }

    #[test]
    fn no_stages_is_rejected() {
        let err = CommandSpec::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_env_name_is_rejected() {
        let mut spec = CommandSpec::new(vec![StageSpec::new("true")]);
        spec.env.push(EnvVar::set("A=B", "x"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn from_command_keeps_descriptor_settings() {
        let mut cmd = std::process::Command::new("env");
        cmd.arg("-0").current_dir("/tmp").env("A", "1").env_remove("B");
        let stage = StageSpec::from_command(&cmd);
        assert_eq!(stage.program(), "env");
        assert_eq!(stage.arguments(), &["-0"]);
        assert_eq!(stage.current_dir.as_deref(), Some(Path::new("/tmp")));
        assert!(stage.envs.contains(&("A".into(), Some("1".into()))));
        assert!(stage.envs.contains(&("B".into(), None)));
    }

    #[test]
    fn command_line_joins_stages() {
        let spec = CommandSpec::new(vec![
            StageSpec::from_argv(["ls", "-l"]),
            StageSpec::from_argv(["wc", "-l"]),
        ]);
        assert_eq!(spec.command_line(), vec!["ls", "-l", "|", "wc", "-l"]);
    }
}
