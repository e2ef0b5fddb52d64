//! Skill documents: operator-authored playbooks the model can consult.
//!
//! A skill is a directory containing a `SKILL.md` whose YAML front matter
//! declares `name` and `description`. The body is free-form markdown.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: String,
    #[serde(default)]
    description: String,
}

/// Loads and serves skills from a configured directory.
pub struct SkillsManager {
    skills: Vec<Skill>,
}

impl SkillsManager {
    /// Scan `dir` for skill directories. A missing directory yields an empty
    /// manager rather than an error.
    pub fn load(dir: &Path) -> Self {
        let mut skills = Vec::new();

        if dir.is_dir() {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    match load_skill(&path) {
                        Ok(skill) => {
                            tracing::debug!(skill = %skill.name, "loaded skill");
                            skills.push(skill);
                        }
                        Err(e) => {
                            tracing::debug!(path = ?path, "skipping skill: {e}");
                        }
                    }
                }
            }
        }

        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Self { skills }
    }

    pub fn empty() -> Self {
        Self { skills: Vec::new() }
    }

    pub fn list(&self) -> &[Skill] {
        &self.skills
    }

    /// Read the full SKILL.md body for a named skill.
    pub fn read(&self, name: &str) -> Result<String> {
        let skill = self
            .skills
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow!("skill not found: {name}"))?;
        fs::read_to_string(skill.path.join("SKILL.md"))
            .map_err(|e| anyhow!("failed to read skill {name}: {e}"))
    }
}

fn load_skill(path: &Path) -> Result<Skill> {
    let skill_file = path.join("SKILL.md");
    if !skill_file.is_file() {
        return Err(anyhow!("no SKILL.md in {path:?}"));
    }
    let content = fs::read_to_string(&skill_file)?;
    let front = parse_front_matter(&content)
        .ok_or_else(|| anyhow!("missing front matter in {skill_file:?}"))?;

    Ok(Skill {
        name: front.name,
        description: front.description,
        path: path.to_path_buf(),
    })
}

fn parse_front_matter(content: &str) -> Option<FrontMatter> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    serde_yaml::from_str(&rest[..end]).ok()
}
