//! Structured builders for shell text sent to the guest.
//!
//! Nothing is ever spliced into remote command text without passing through
//! [`quote`], which rejects control characters and applies POSIX
//! single-quote rules.

use color_eyre::eyre::{eyre, Result};

use crate::error::BootstrapError;

/// Quote a value for embedding in POSIX shell text.
///
/// Control characters other than tab are refused outright; even quoted they
/// would be interpreted by the console line discipline before the shell
/// ever sees them.
pub(crate) fn quote(value: &str) -> Result<String> {
    if let Some(c) = value.chars().find(|c| c.is_control() && *c != '\t') {
        return Err(BootstrapError::precondition(format!(
            "value contains control character {:?}",
            c
        ))
        .into());
    }
    let quoted = shlex::try_quote(value).map_err(|e| eyre!("Failed to quote value: {e}"))?;
    Ok(quoted.into_owned())
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a hostname against RFC 1123 label rules.
pub(crate) fn validate_hostname(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if ok {
        Ok(())
    } else {
        Err(BootstrapError::precondition(format!("invalid hostname: {name:?}")).into())
    }
}

/// A `KEY='value'` file sourced by the guest before running units.
#[derive(Debug, Default)]
pub(crate) struct EnvFile {
    vars: Vec<(String, String)>,
}

impl EnvFile {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add an assignment. Names must be shell identifiers; values are quoted.
    pub(crate) fn set(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        if !is_valid_var_name(name) {
            return Err(BootstrapError::precondition(format!(
                "invalid variable name: {name:?}"
            ))
            .into());
        }
        let quoted = quote(value)?;
        self.vars.retain(|(k, _)| k != name);
        self.vars.push((name.to_owned(), quoted));
        Ok(self)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(k, _)| k.as_str())
    }

    pub(crate) fn render(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.vars {
            s.push_str(k);
            s.push('=');
            s.push_str(v);
            s.push('\n');
        }
        s
    }
}

/// An ordered sequence of single-line shell commands.
///
/// Each command is one console line; multi-line constructs are never sent
/// interactively. Files are materialized on the guest one quoted `printf`
/// per source line so no line exceeds the tty canonical-mode limit unless
/// the source line itself does.
#[derive(Debug, Default)]
pub(crate) struct ShellScript {
    lines: Vec<String>,
}

impl ShellScript {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a literal command. Must not contain a newline.
    pub(crate) fn raw(&mut self, cmd: impl Into<String>) -> &mut Self {
        let cmd = cmd.into();
        debug_assert!(!cmd.contains('\n'));
        self.lines.push(cmd);
        self
    }

    /// Append a command built from a program and arguments, all quoted.
    pub(crate) fn cmd<I, S>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let quoted = args
            .into_iter()
            .map(|a| quote(a.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if quoted.is_empty() {
            return Err(eyre!("empty command"));
        }
        self.lines.push(quoted.join(" "));
        Ok(self)
    }

    /// Append commands that recreate `content` at `path` on the guest.
    pub(crate) fn write_file(&mut self, path: &str, content: &str) -> Result<&mut Self> {
        let path = quote(path)?;
        let mut redirect = ">";
        for line in content.lines() {
            let line = quote(line)?;
            self.lines
                .push(format!("printf '%s\\n' {line} {redirect} {path}"));
            redirect = ">>";
        }
        if redirect == ">" {
            self.lines.push(format!(": > {path}"));
        }
        Ok(self)
    }

    pub(crate) fn len(&self) -> usize {
        self.lines.len()
    }

    /// Render as newline-terminated console input.
    pub(crate) fn render(&self) -> String {
        let mut s = String::new();
        for line in &self.lines {
            s.push_str(line);
            s.push('\n');
        }
        s
    }
}
