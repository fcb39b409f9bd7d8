//! Reusable operator commands with `<placeholder>` arguments.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub title: String,
    pub command: String,
}

impl CommandTemplate {
    pub fn placeholders(&self) -> Vec<String> {
        placeholders(&self.command)
    }
}

/// Templates persisted as a pretty-printed JSON array.
#[derive(Debug)]
pub struct TemplateStore {
    path: PathBuf,
    templates: Vec<CommandTemplate>,
}

impl TemplateStore {
    /// A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let templates = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read templates from {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse templates in {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self { path, templates })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[CommandTemplate] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// 1-based, as shown to the operator.
    pub fn get(&self, index: usize) -> Option<&CommandTemplate> {
        index
            .checked_sub(1)
            .and_then(|index| self.templates.get(index))
    }

    pub fn add(&mut self, title: &str, command: &str) -> Result<()> {
        let title = title.trim();
        let command = command.trim();
        if title.is_empty() || command.is_empty() {
            bail!("title and command are required");
        }
        self.templates.push(CommandTemplate {
            title: title.to_string(),
            command: command.to_string(),
        });
        self.save()
    }

    /// Removes the template at the 1-based `index`, if there is one.
    pub fn remove(&mut self, index: usize) -> Result<Option<CommandTemplate>> {
        if index == 0 || index > self.templates.len() {
            return Ok(None);
        }
        let removed = self.templates.remove(index - 1);
        self.save()?;
        Ok(Some(removed))
    }

    fn save(&self) -> Result<()> {
        let body = serde_json::to_string_pretty(&self.templates)?;
        fs::write(&self.path, body)
            .with_context(|| format!("failed to write templates to {}", self.path.display()))
    }
}

/// Distinct `<name>` placeholders in order of first appearance.
pub fn placeholders(command: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = command;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            break;
        };
        if close == 0 {
            rest = after;
            continue;
        }
        let name = &after[..close];
        if !found.iter().any(|existing| existing == name) {
            found.push(name.to_string());
        }
        rest = &after[close + 1..];
    }
    found
}

/// Replaces every `<name>` with its value.
pub fn fill(command: &str, values: &[(String, String)]) -> String {
    values
        .iter()
        .fold(command.to_string(), |command, (name, value)| {
            command.replace(&format!("<{}>", name), value)
        })
}
