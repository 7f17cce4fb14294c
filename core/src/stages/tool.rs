//! External tool invocation.

use crate::prelude::{StageError, StageResult};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One synchronous run of an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Files that must exist once the program exits.
    pub expected_outputs: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            expected_outputs: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn expect_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_outputs.push(path.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Fails with a tool error naming the first expected output that is missing.
    pub fn verify_outputs(&self) -> StageResult<()> {
        match self.expected_outputs.iter().find(|path| !path.is_file()) {
            Some(missing) => Err(StageError::Tool {
                tool: self.program.clone(),
                detail: format!("expected output {} was not produced", missing.display()),
            }),
            None => Ok(()),
        }
    }
}

/// Runs external programs for the stages.
pub trait ToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> StageResult<()>;
}

impl<F> ToolRunner for F
where
    F: Fn(&ToolInvocation) -> StageResult<()>,
{
    fn run(&self, invocation: &ToolInvocation) -> StageResult<()> {
        self(invocation)
    }
}

/// Runs programs as child processes and waits for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl ToolRunner for CommandRunner {
    fn run(&self, invocation: &ToolInvocation) -> StageResult<()> {
        info!("running {}", invocation.command_line());
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|err| StageError::Tool {
            tool: invocation.program.clone(),
            detail: format!("could not start: {}", err),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::Tool {
                tool: invocation.program.clone(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        debug!("{} finished", invocation.program);
        invocation.verify_outputs()
    }
}

/// Replaces every `{key}` in `template` with its value.
///
/// Unknown keys are left untouched so that literal braces survive.
pub fn expand_template(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    fn values() -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("input".to_string(), "a.mrc".to_string());
        values.insert("output".to_string(), "b.mrc".to_string());
        values
    }

    #[test]
    fn template_expansion() {
        assert_eq!(expand_template("{input}", &values()), "a.mrc");
        assert_eq!(expand_template("{output}.log", &values()), "b.mrc.log");
        assert_eq!(expand_template("-x {missing} {", &values()), "-x {missing} {");
    }

    #[test]
    fn missing_output_is_a_tool_error() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("present.mrc");
        std::fs::write(&present, b"x").unwrap();
        let invocation = ToolInvocation::new("newstack")
            .expect_output(&present)
            .expect_output(dir.path().join("absent.mrc"));
        assert!(matches!(
            invocation.verify_outputs(),
            Err(StageError::Tool { .. })
        ));
    }

    #[test]
    fn closures_act_as_runners() {
        let seen = RefCell::new(Vec::new());
        let runner = |invocation: &ToolInvocation| {
            seen.borrow_mut().push(invocation.command_line());
            Ok::<(), StageError>(())
        };
        let invocation = ToolInvocation::new("gctf").args(["--apix", "1.35"]);
        runner.run(&invocation).unwrap();
        assert_eq!(seen.into_inner(), vec!["gctf --apix 1.35".to_string()]);
    }

    #[test]
    fn unknown_program_cannot_start() {
        let invocation = ToolInvocation::new("definitely-not-an-installed-tool-4711");
        assert!(matches!(
            CommandRunner.run(&invocation),
            Err(StageError::Tool { .. })
        ));
    }
}
