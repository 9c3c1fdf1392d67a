use std::path::{Path, PathBuf};

use crate::error::{Result, RevpoolError};

const ID_PLACEHOLDER: &str = "{id}";
const WORKSPACE_PLACEHOLDER: &str = "{workspace}";

pub const JOB_ID_ENV: &str = "REVPOOL_JOB_ID";
pub const WORKSPACE_ENV: &str = "REVPOOL_WORKSPACE";

/// Typed inputs for building one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvocationParams<'a> {
    pub job_id: &'a str,
    pub workspace: &'a Path,
}

/// A concrete process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Shell command template run once per job.
///
/// `{id}` and `{workspace}` are rewritten to the shell positional parameters
/// `${1}` and `${2}`, and the actual values travel as separate argv entries.
/// The job id is never spliced into the script text. A template without
/// `{id}` receives the id as its final argument.
///
/// Parameters are always expanded inside double quotes, so an id is never
/// word-split or glob-expanded. A bare placeholder becomes `"${1}"`, one
/// already inside double quotes becomes `${1}`, and one inside single quotes
/// closes the quote around `"${1}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
    shell: String,
    extra_args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(RevpoolError::Configuration(
                "command template is empty".to_string(),
            ));
        }
        Ok(Self {
            template,
            shell: "sh".to_string(),
            extra_args: Vec::new(),
        })
    }

    /// Forward `flag value` to the command, e.g. `--series <sha>`.
    pub fn with_flag(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_args.push(flag.into());
        self.extra_args.push(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.template.trim().is_empty()
    }

    /// The script handed to `sh -c`.
    pub fn script(&self) -> String {
        let mut script = bind_placeholders(&self.template);
        if !self.template.contains(ID_PLACEHOLDER) {
            script.push_str(" \"${1}\"");
        }
        for n in 0..self.extra_args.len() {
            script.push_str(&format!(" \"${{{}}}\"", n + 3));
        }
        script
    }

    pub fn build(&self, params: &InvocationParams<'_>) -> Invocation {
        let workspace = params.workspace.to_string_lossy().into_owned();
        let mut args = vec![
            "-c".to_string(),
            self.script(),
            "revpool".to_string(),
            params.job_id.to_string(),
            workspace.clone(),
        ];
        args.extend(self.extra_args.iter().cloned());

        Invocation {
            program: self.shell.clone(),
            args,
            env: vec![
                (JOB_ID_ENV.to_string(), params.job_id.to_string()),
                (WORKSPACE_ENV.to_string(), workspace),
            ],
            cwd: params.workspace.to_path_buf(),
        }
    }
}

fn placeholder_at(text: &str) -> Option<(usize, &'static str)> {
    if text.starts_with(ID_PLACEHOLDER) {
        Some((ID_PLACEHOLDER.len(), "${1}"))
    } else if text.starts_with(WORKSPACE_PLACEHOLDER) {
        Some((WORKSPACE_PLACEHOLDER.len(), "${2}"))
    } else {
        None
    }
}

/// Replace placeholders with positional parameters, quoted for the shell
/// context they appear in.
fn bind_placeholders(template: &str) -> String {
    let mut script = String::with_capacity(template.len() + 16);
    let mut quote: Option<char> = None;
    let mut chars = template.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if let Some((len, param)) = placeholder_at(&template[idx..]) {
            match quote {
                None => {
                    script.push('"');
                    script.push_str(param);
                    script.push('"');
                }
                Some('"') => script.push_str(param),
                Some(_) => {
                    script.push_str("'\"");
                    script.push_str(param);
                    script.push_str("\"'");
                }
            }
            while chars.peek().is_some_and(|(next, _)| *next < idx + len) {
                chars.next();
            }
            continue;
        }

        script.push(c);
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => {
                if let Some((_, escaped)) = chars.next() {
                    script.push(escaped);
                }
            }
            (None, '\'' | '"') => quote = Some(c),
            (Some('"'), '"') => quote = None,
            _ => {}
        }
    }
    script
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.template)?;
        for arg in &self.extra_args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
