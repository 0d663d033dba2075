//! Password sourcing for CLI commands: inline flag, file, or interactive
//! prompt. Exactly one source must be selected.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub struct PasswordSource {
    pub inline: Option<String>,
    pub file: Option<PathBuf>,
    pub prompt: bool,
}

impl PasswordSource {
    pub fn resolve(&self, prompt_label: &str) -> Result<String> {
        let selected = usize::from(self.inline.is_some())
            + usize::from(self.file.is_some())
            + usize::from(self.prompt);
        if selected == 0 {
            bail!("no password given; use -w, --pw-file or -W");
        }
        if selected > 1 {
            bail!("more than one password source given");
        }

        if let Some(pw) = &self.inline {
            return Ok(pw.clone());
        }

        if let Some(path) = &self.file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading password file {}", path.display()))?;
            let first_line = contents.lines().next().unwrap_or("").to_string();
            if first_line.is_empty() {
                bail!("password file {} is empty", path.display());
            }
            return Ok(first_line);
        }

        let pw = rpassword::prompt_password(format!("{prompt_label}: "))
            .context("reading password from terminal")?;
        if pw.is_empty() {
            bail!("empty password");
        }
        Ok(pw)
    }
}
