use anyhow::{Context, Result};
use std::path::Path;

use crate::prompts::HOUSE_PERSONA;

/// System prompt for one agent: the shared house character plus the
/// agent's role instructions.
#[derive(Debug, Clone)]
pub struct Persona {
    pub agent_id: String,
    /// Shared voice every agent speaks in.
    pub character: String,
    /// What this agent is for and how it should answer.
    pub role: String,
}

impl Persona {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            character: HOUSE_PERSONA.to_string(),
            role: role.into(),
        }
    }

    /// Internal agents (classifier, planner) that need no house voice.
    pub fn bare(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            character: String::new(),
            role: role.into(),
        }
    }

    /// Swap the role text, keeping the character.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn assembled_system_prompt(&self) -> String {
        let mut parts = Vec::new();
        if !self.character.is_empty() {
            parts.push(self.character.clone());
        }
        if !self.role.is_empty() {
            parts.push(format!("## Role\n{}", self.role));
        }
        parts.join("\n\n")
    }
}

/// Reads `{root}/prompts/{agent_id}.md` when present; its content replaces
/// the built-in role text.
pub fn load_role_override(root: &Path, agent_id: &str) -> Result<Option<String>> {
    let path = root.join("prompts").join(format!("{agent_id}.md"));
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("loading persona override for {agent_id}"))?;
    let trimmed = content.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn assembled_prompt_joins_character_and_role() {
        let persona = Persona::new("COUNSELOR", "Listen first.");
        let prompt = persona.assembled_system_prompt();
        assert!(prompt.starts_with(HOUSE_PERSONA));
        assert!(prompt.ends_with("## Role\nListen first."));

        let bare = Persona::bare("CLASSIFIER", "Label the intent.");
        assert_eq!(bare.assembled_system_prompt(), "## Role\nLabel the intent.");
    }

    #[test]
    fn role_override_is_read_from_prompts_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(load_role_override(tmp.path(), "CODER").unwrap().is_none());

        let prompts = tmp.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("CODER.md"), "  Answer in Rust.\n").unwrap();
        std::fs::write(prompts.join("NEWS.md"), "   \n").unwrap();

        assert_eq!(
            load_role_override(tmp.path(), "CODER").unwrap().as_deref(),
            Some("Answer in Rust.")
        );
        assert!(load_role_override(tmp.path(), "NEWS").unwrap().is_none());
    }
}
