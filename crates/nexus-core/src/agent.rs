use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use nexus_schema::ConversationTurn;

use crate::config::AgentsConfig;
use crate::persona::{load_role_override, Persona};
use crate::router::{LlmRouter, ModelTarget};

/// A persona bound to the model it talks to.
#[derive(Clone)]
pub struct LlmAgent {
    persona: Persona,
    router: Arc<LlmRouter>,
    target: ModelTarget,
}

impl LlmAgent {
    pub fn new(persona: Persona, router: Arc<LlmRouter>, target: ModelTarget) -> Self {
        Self {
            persona,
            router,
            target,
        }
    }

    pub fn id(&self) -> &str {
        &self.persona.agent_id
    }

    pub fn system_prompt(&self) -> String {
        self.persona.assembled_system_prompt()
    }

    pub async fn ask(&self, prompt: impl Into<String>) -> Result<String> {
        self.ask_with_system(self.system_prompt(), prompt).await
    }

    pub async fn ask_with_system(&self, system: String, prompt: impl Into<String>) -> Result<String> {
        tracing::debug!("agent {} calling {}/{}", self.id(), self.target.pool, self.target.model);
        self.router
            .complete_text(&self.target, Some(system), prompt)
            .await
    }
}

/// Builds agents from the `agents` config section. Role text comes from, in
/// order: the config `persona`, `{root}/prompts/{ID}.md`, the built-in text.
#[derive(Clone)]
pub struct AgentFactory {
    router: Arc<LlmRouter>,
    agents: AgentsConfig,
    root: Option<PathBuf>,
}

impl AgentFactory {
    pub fn new(router: Arc<LlmRouter>, agents: AgentsConfig, root: Option<PathBuf>) -> Self {
        Self {
            router,
            agents,
            root,
        }
    }

    pub fn router(&self) -> &Arc<LlmRouter> {
        &self.router
    }

    /// Agent speaking in the house voice.
    pub fn agent(&self, id: &str, default_role: &str) -> LlmAgent {
        let persona = Persona::new(id, self.role_for(id, default_role));
        LlmAgent::new(persona, Arc::clone(&self.router), self.agents.target_for(id))
    }

    /// Agent with no house voice, for internal steps like routing and planning.
    pub fn internal(&self, id: &str, default_role: &str) -> LlmAgent {
        let persona = Persona::bare(id, self.role_for(id, default_role));
        LlmAgent::new(persona, Arc::clone(&self.router), self.agents.target_for(id))
    }

    fn role_for(&self, id: &str, default_role: &str) -> String {
        if let Some(role) = self.agents.persona_for(id) {
            return role.to_string();
        }
        if let Some(root) = &self.root {
            match load_role_override(root, id) {
                Ok(Some(role)) => return role,
                Ok(None) => {}
                Err(e) => tracing::warn!("ignoring persona override for {id}: {e:#}"),
            }
        }
        default_role.to_string()
    }
}

/// One `role: content` line per turn, oldest first.
pub fn render_history(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return "(no previous conversation)".to_string();
    }
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use nexus_schema::Role;

    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn render_history_lists_turns_in_order() {
        let turn = |role, content: &str| ConversationTurn {
            id: 0,
            session_id: "s".into(),
            role,
            content: content.into(),
            agent_used: None,
            timestamp: Utc::now(),
        };
        let rendered = render_history(&[turn(Role::User, "hi"), turn(Role::Model, "hello")]);
        assert_eq!(rendered, "user: hi\nmodel: hello");
        assert_eq!(render_history(&[]), "(no previous conversation)");
    }

    #[test]
    fn factory_prefers_config_then_file_then_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = tmp.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("CODER.md"), "file role").unwrap();
        std::fs::write(prompts.join("NEWS.md"), "file news").unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "NEWS".to_string(),
            AgentConfig {
                persona: Some("config news".into()),
                model: Some("fast".into()),
                ..AgentConfig::default()
            },
        );
        let factory = AgentFactory::new(
            Arc::new(LlmRouter::new()),
            AgentsConfig {
                default: ModelTarget::default(),
                overrides,
            },
            Some(tmp.path().to_path_buf()),
        );

        assert!(factory.agent("NEWS", "builtin").system_prompt().ends_with("config news"));
        assert!(factory.agent("CODER", "builtin").system_prompt().ends_with("file role"));
        assert!(factory.agent("LISTENER", "builtin").system_prompt().ends_with("builtin"));
        assert_eq!(factory.internal("PLANNER", "plan").system_prompt(), "## Role\nplan");
    }
}
