//! Project configuration loading (`spec.md` §6), expanded from the
//! teacher's single-field `CloudLLMConfig` into the four-file schema this
//! system actually needs: `config.json`, `agents.json`, `llms.json`, and
//! one `agents/<slug>.json` per agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::conclave::agent::PubKey;
use crate::conclave::error::{EngineError, EngineResult};

/// `config.json`: project-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_name: String,
    /// Pubkeys whose events the adapter accepts without an explicit
    /// `is_explicitly_public` kind (`spec.md` §4.1 step 2).
    #[serde(default)]
    pub whitelisted_pubkeys: Vec<String>,
}

/// One entry of `agents.json`: maps a slug to its identity and whether it's
/// the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentityEntry {
    pub slug: String,
    pub pubkey_hex: String,
    #[serde(default)]
    pub is_orchestrator: bool,
}

/// `llms.json`: named presets plus which one is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPreset {
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// One provider's credentials in `llms.json.auth` (`spec.md` §6:
/// "auth: provider → credentials"). Shape is provider-agnostic: either an
/// env var name to read the key from, or (less commonly) a literal key
/// checked into a non-committed local config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAuth {
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmsConfig {
    pub presets: Vec<LlmPreset>,
    pub default_preset: String,
    /// `spec.md` §6: "selection: agent-slug-or-default → preset-name".
    #[serde(default)]
    pub selection: HashMap<String, String>,
    /// `spec.md` §6: "auth: provider → credentials".
    #[serde(default)]
    pub auth: HashMap<String, ProviderAuth>,
}

/// `agents/<slug>.json`: one agent's role, instructions, and tool/llm
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinitionFile {
    pub role: String,
    pub description: String,
    pub instructions: String,
    #[serde(default)]
    pub tool_allow_list: Vec<String>,
    #[serde(default)]
    pub llm_preset: Option<String>,
}

/// Parsed, validated configuration for one run. Loading is fatal-on-error
/// at startup (`spec.md` §6): any malformed or missing required file aborts
/// the process rather than degrading silently.
pub struct ConfigService {
    pub project: ProjectConfig,
    pub llms: LlmsConfig,
    pub agent_identities: Vec<AgentIdentityEntry>,
    pub agent_definitions: HashMap<String, AgentDefinitionFile>,
}

impl ConfigService {
    /// Loads and validates all four files rooted at `project_dir`.
    pub async fn load(project_dir: impl AsRef<Path>) -> EngineResult<Self> {
        let project_dir = project_dir.as_ref();

        let project = Self::read_json::<ProjectConfig>(&project_dir.join("config.json")).await?;
        let llms = Self::read_json::<LlmsConfig>(&project_dir.join("llms.json")).await?;
        let agent_identities =
            Self::read_json::<Vec<AgentIdentityEntry>>(&project_dir.join("agents.json")).await?;

        if !llms.presets.iter().any(|p| p.name == llms.default_preset) {
            return Err(EngineError::ConfigError(format!(
                "default_preset `{}` is not among llms.json presets",
                llms.default_preset
            )));
        }

        let mut seen_slugs = std::collections::HashSet::new();
        for identity in &agent_identities {
            if !seen_slugs.insert(identity.slug.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "duplicate agent slug `{}` in agents.json",
                    identity.slug
                )));
            }
        }

        for (selector, preset_name) in &llms.selection {
            if !llms.presets.iter().any(|p| &p.name == preset_name) {
                return Err(EngineError::ConfigError(format!(
                    "llms.json selection `{selector}` refers to unknown preset `{preset_name}`"
                )));
            }
            if selector != "default" && !agent_identities.iter().any(|a| &a.slug == selector) {
                return Err(EngineError::ConfigError(format!(
                    "llms.json selection references unknown agent slug `{selector}`"
                )));
            }
        }

        let mut agent_definitions = HashMap::new();
        for identity in &agent_identities {
            let path = project_dir.join("agents").join(format!("{}.json", identity.slug));
            let definition = Self::read_json::<AgentDefinitionFile>(&path).await?;
            agent_definitions.insert(identity.slug.clone(), definition);
        }

        Ok(Self {
            project,
            llms,
            agent_identities,
            agent_definitions,
        })
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> EngineResult<T> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|err| EngineError::ConfigError(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| EngineError::ConfigError(format!("{}: {err}", path.display())))
    }

    /// Parses a hex pubkey from `agents.json`, fatal at startup on failure.
    pub fn parse_pubkey(hex: &str) -> EngineResult<PubKey> {
        if hex.len() != 64 {
            return Err(EngineError::ConfigError(format!(
                "pubkey `{hex}` must be 64 hex characters"
            )));
        }
        let mut bytes = [0u8; 32];
        for i in 0..32 {
            bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| EngineError::ConfigError(format!("pubkey `{hex}` is not valid hex")))?;
        }
        Ok(PubKey::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn write_file(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn loads_a_complete_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write_file(root, "config.json", r#"{"project_name":"demo","whitelisted_pubkeys":[]}"#).await;
        write_file(
            root,
            "llms.json",
            r#"{"presets":[{"name":"default","provider":"openai","model":"gpt-4"}],"default_preset":"default","selection":{"default":"default","orchestrator":"default"},"auth":{"openai":{"api_key_env":"OPENAI_API_KEY"}}}"#,
        )
        .await;
        write_file(
            root,
            "agents.json",
            r#"[{"slug":"orchestrator","pubkey_hex":"0000000000000000000000000000000000000000000000000000000000000000","is_orchestrator":true}]"#,
        )
        .await;
        write_file(
            root,
            "agents/orchestrator.json",
            r#"{"role":"lead","description":"leads","instructions":"lead the team","tool_allow_list":[]}"#,
        )
        .await;

        let config = ConfigService::load(root).await.unwrap();
        assert_eq!(config.project.project_name, "demo");
        assert_eq!(config.agent_definitions.len(), 1);
        assert_eq!(config.llms.selection.get("orchestrator").unwrap(), "default");
        assert_eq!(
            config.llms.auth.get("openai").unwrap().api_key_env.as_deref(),
            Some("OPENAI_API_KEY")
        );
    }

    #[tokio::test]
    async fn rejects_duplicate_agent_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "config.json", r#"{"project_name":"demo"}"#).await;
        write_file(
            root,
            "llms.json",
            r#"{"presets":[{"name":"default","provider":"openai","model":"gpt-4"}],"default_preset":"default"}"#,
        )
        .await;
        write_file(
            root,
            "agents.json",
            r#"[
                {"slug":"orchestrator","pubkey_hex":"0000000000000000000000000000000000000000000000000000000000000000"},
                {"slug":"orchestrator","pubkey_hex":"1111111111111111111111111111111111111111111111111111111111111111"}
            ]"#,
        )
        .await;

        let result = ConfigService::load(root).await;
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn rejects_selection_referencing_unknown_preset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "config.json", r#"{"project_name":"demo"}"#).await;
        write_file(
            root,
            "llms.json",
            r#"{"presets":[{"name":"default","provider":"openai","model":"gpt-4"}],"default_preset":"default","selection":{"default":"nope"}}"#,
        )
        .await;
        write_file(root, "agents.json", r#"[]"#).await;

        let result = ConfigService::load(root).await;
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn rejects_selection_referencing_unknown_agent_slug() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "config.json", r#"{"project_name":"demo"}"#).await;
        write_file(
            root,
            "llms.json",
            r#"{"presets":[{"name":"default","provider":"openai","model":"gpt-4"}],"default_preset":"default","selection":{"ghost-agent":"default"}}"#,
        )
        .await;
        write_file(root, "agents.json", r#"[]"#).await;

        let result = ConfigService::load(root).await;
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn rejects_unknown_default_preset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "config.json", r#"{"project_name":"demo"}"#).await;
        write_file(
            root,
            "llms.json",
            r#"{"presets":[{"name":"a","provider":"openai","model":"gpt-4"}],"default_preset":"missing"}"#,
        )
        .await;
        write_file(root, "agents.json", r#"[]"#).await;

        let result = ConfigService::load(root).await;
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn parses_valid_hex_pubkey() {
        let hex = "a".repeat(64);
        assert!(ConfigService::parse_pubkey(&hex).is_ok());
    }

    #[test]
    fn rejects_wrong_length_pubkey() {
        assert!(ConfigService::parse_pubkey("abc").is_err());
    }
}
