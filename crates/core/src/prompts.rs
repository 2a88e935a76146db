//! Prompt templates loaded from a directory of Markdown files.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Loads every `*.md` file in `prompts_path`, keyed by file stem.
pub fn load_prompts(prompts_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = fs::read_dir(prompts_path)
        .with_context(|| format!("Could not read prompts directory {:?}", prompts_path))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

/// The prompts the tutor needs.
#[derive(Debug, Clone)]
pub struct PromptSet {
    /// Persona shared by chat, analysis and live conversation.
    pub system: String,
    /// Live-conversation rules; `{history}` expands to the grounding context.
    pub live: String,
    /// Instruction sent with a freshly uploaded page.
    pub analyze: String,
}

impl PromptSet {
    pub fn from_map(prompts: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            prompts
                .get(key)
                .cloned()
                .with_context(|| format!("{}.md not found in prompts directory", key))
        };
        Ok(Self {
            system: get("system_prompt")?,
            live: get("live_prompt")?,
            analyze: get("analyze_prompt")?,
        })
    }

    pub fn load(prompts_path: &Path) -> Result<Self> {
        Self::from_map(&load_prompts(prompts_path)?)
    }
}
