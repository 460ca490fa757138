//! External command construction and execution.
//!
//! Every tool the deployment touches (`pio`, `mklittlefs`, `mkfatfs`,
//! `esptool`) goes through [`Cmd`] and a [`CommandRunner`]. The runner is the
//! seam between the pipeline and the host: [`SystemRunner`] spawns real
//! processes, [`ScriptedRunner`] records invocations and fakes outcomes.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::ui;

/// A command line waiting to be run.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    description: String,
    current_dir: Option<PathBuf>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let program = program.as_ref().to_os_string();
        Self {
            description: program.to_string_lossy().into_owned(),
            program,
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Human-readable label printed before the command runs and used in
    /// failure messages.
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// A non-zero exit becomes a warning instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_description(&self) -> &str {
        &self.description
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Shell-like rendering for logs. Arguments containing spaces are quoted.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                let part = part.to_string_lossy();
                if part.contains(' ') {
                    format!("\"{part}\"")
                } else {
                    part.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run through `runner`, echoing captured output.
    ///
    /// Returns an error when the process cannot be spawned, or when it exits
    /// non-zero and the command was not marked [`Cmd::allow_fail`].
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CmdResult> {
        ui::running(&self.description, &self.command_line());

        let result = runner
            .run(self)
            .with_context(|| format!("spawning '{}'", self.program.to_string_lossy()))?;

        if !result.stdout.trim().is_empty() {
            println!("{}", result.stdout.trim_end());
        }

        if !result.success() {
            if !result.stderr.trim().is_empty() {
                ui::error_output(result.stderr.trim_end());
            }
            if self.allow_fail {
                ui::warning(&format!(
                    "Command failed with exit code {}, continuing...",
                    result.code_display()
                ));
            } else {
                bail!(
                    "{} failed with exit code {}",
                    self.description,
                    result.code_display()
                );
            }
        }

        Ok(result)
    }
}

/// Captured outcome of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn code_display(&self) -> String {
        match self.code {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        }
    }
}

/// Executes a [`Cmd`] to completion.
///
/// Implementations only fail when the process could not be started; a
/// non-zero exit is reported through [`CmdResult::code`].
pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdResult>;
}

/// Spawns real host processes and blocks until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdResult> {
        let mut command = Command::new(cmd.program());
        command.args(cmd.get_args());
        if let Some(dir) = cmd.get_current_dir() {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .with_context(|| format!("Failed to execute {}", cmd.command_line()))?;

        Ok(CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

type Hook = Box<dyn Fn(&Cmd)>;

/// Runner that never spawns anything.
///
/// Every invocation is recorded as its [`Cmd::command_line`]. Hooks whose
/// pattern matches run first, which lets callers fake the files a tool would
/// have produced. Commands whose line contains a registered failure pattern
/// then exit with code 1; the others succeed, printing the first canned
/// stdout whose pattern matches.
#[derive(Default)]
pub struct ScriptedRunner {
    invocations: RefCell<Vec<String>>,
    failures: Vec<String>,
    hooks: Vec<(String, Hook)>,
    outputs: Vec<(String, String)>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose line contains `pattern`.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.failures.push(pattern.to_string());
        self
    }

    /// Answer commands whose line contains `pattern` with `stdout`.
    pub fn stdout_on(mut self, pattern: &str, stdout: &str) -> Self {
        self.outputs.push((pattern.to_string(), stdout.to_string()));
        self
    }

    /// Run `hook` for every command whose line contains `pattern`.
    pub fn on(mut self, pattern: &str, hook: impl Fn(&Cmd) + 'static) -> Self {
        self.hooks.push((pattern.to_string(), Box::new(hook)));
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.borrow().clone()
    }

    /// Number of recorded invocations whose line contains `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.invocations
            .borrow()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdResult> {
        let line = cmd.command_line();
        self.invocations.borrow_mut().push(line.clone());

        for (pattern, hook) in &self.hooks {
            if line.contains(pattern.as_str()) {
                hook(cmd);
            }
        }

        if self.failures.iter().any(|p| line.contains(p.as_str())) {
            return Ok(CmdResult::failed(1, "scripted failure"));
        }

        let stdout = self
            .outputs
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        Ok(CmdResult {
            stdout,
            ..CmdResult::ok()
        })
    }
}
