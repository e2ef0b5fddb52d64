//! Builtin meta-tools handled in-process by the registry.
//!
//! `query_execution_result` pages, searches, and filters stored tool output;
//! `list_skills` and `read_skill` expose operator-authored skill documents.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde_json::{json, Value};

use crate::skills::SkillsManager;
use crate::storage::FileResultStore;

use super::command::ToolOutput;

pub const QUERY_EXECUTION_RESULT: &str = "query_execution_result";
pub const LIST_SKILLS: &str = "list_skills";
pub const READ_SKILL: &str = "read_skill";

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Definitions of the builtin tools, in catalogue form.
pub fn builtin_definitions() -> Vec<(String, String, Value)> {
    vec![
        (
            QUERY_EXECUTION_RESULT.to_string(),
            "Query a stored tool execution result by page, keyword search, or filter"
                .to_string(),
            json!({
                "type": "object",
                "properties": {
                    "execution_id": {
                        "type": "string",
                        "description": "Execution ID of the stored result"
                    },
                    "page": {
                        "type": "number",
                        "description": "Page number, starting at 1"
                    },
                    "limit": {
                        "type": "number",
                        "description": "Lines per page (default 100)"
                    },
                    "search": {
                        "type": "string",
                        "description": "Return only lines containing this keyword"
                    },
                    "filter": {
                        "type": "string",
                        "description": "Return only lines containing this predicate"
                    }
                },
                "required": ["execution_id"]
            }),
        ),
        (
            LIST_SKILLS.to_string(),
            "List the available skill documents".to_string(),
            json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        ),
        (
            READ_SKILL.to_string(),
            "Read a skill document by name".to_string(),
            json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Skill name as returned by list_skills"
                    }
                },
                "required": ["name"]
            }),
        ),
    ]
}

/// Dispatch a builtin call. Returns None when `name` is not a builtin.
pub fn call_builtin(
    name: &str,
    args: &HashMap<String, Value>,
    store: &FileResultStore,
    skills: &SkillsManager,
) -> Option<ToolOutput> {
    match name {
        QUERY_EXECUTION_RESULT => Some(query_execution_result(store, args)),
        LIST_SKILLS => Some(list_skills(skills)),
        READ_SKILL => Some(read_skill(skills, args)),
        _ => None,
    }
}

fn query_execution_result(store: &FileResultStore, args: &HashMap<String, Value>) -> ToolOutput {
    let Some(execution_id) = args.get("execution_id").and_then(|v| v.as_str()) else {
        return ToolOutput {
            text: "error: missing execution_id argument".to_string(),
            is_error: true,
        };
    };

    if let Some(keyword) = args.get("search").and_then(|v| v.as_str()) {
        return match store.search(execution_id, keyword) {
            Ok(lines) => ToolOutput {
                text: format_matches(execution_id, "search", keyword, &lines),
                is_error: false,
            },
            Err(e) => not_found(execution_id, e),
        };
    }

    if let Some(predicate) = args.get("filter").and_then(|v| v.as_str()) {
        return match store.filter(execution_id, predicate) {
            Ok(lines) => ToolOutput {
                text: format_matches(execution_id, "filter", predicate, &lines),
                is_error: false,
            },
            Err(e) => not_found(execution_id, e),
        };
    }

    let page = args
        .get("page")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(1);
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_PAGE_LIMIT);

    match store.get_page(execution_id, page, limit) {
        Ok(result_page) => {
            let mut text = format!(
                "Execution {execution_id}, page {}/{} ({} lines total):\n",
                result_page.page, result_page.total_pages, result_page.total_lines
            );
            text.push_str(&result_page.lines.join("\n"));
            if result_page.page < result_page.total_pages {
                let _ = write!(
                    text,
                    "\n\nNext page: query_execution_result(execution_id=\"{execution_id}\", page={}, limit={})",
                    result_page.page + 1,
                    result_page.limit
                );
            }
            ToolOutput {
                text,
                is_error: false,
            }
        }
        Err(e) => not_found(execution_id, e),
    }
}

fn format_matches(execution_id: &str, mode: &str, needle: &str, lines: &[String]) -> String {
    if lines.is_empty() {
        return format!("No lines matching {mode} \"{needle}\" in execution {execution_id}.");
    }
    let mut text = format!(
        "{} line(s) matching {mode} \"{needle}\" in execution {execution_id}:\n",
        lines.len()
    );
    text.push_str(&lines.join("\n"));
    text
}

fn not_found(execution_id: &str, err: anyhow::Error) -> ToolOutput {
    ToolOutput {
        text: format!("error: {err:#} (execution_id: {execution_id})"),
        is_error: true,
    }
}

fn list_skills(skills: &SkillsManager) -> ToolOutput {
    let list = skills.list();
    if list.is_empty() {
        return ToolOutput {
            text: "No skills are available.".to_string(),
            is_error: false,
        };
    }

    let mut text = format!("{} skill(s) available:\n", list.len());
    for skill in list {
        let _ = writeln!(text, "- {}: {}", skill.name, skill.description);
    }
    text.push_str("\nUse read_skill(name=\"...\") to read one.");
    ToolOutput {
        text,
        is_error: false,
    }
}

fn read_skill(skills: &SkillsManager, args: &HashMap<String, Value>) -> ToolOutput {
    let Some(name) = args.get("name").and_then(|v| v.as_str()) else {
        return ToolOutput {
            text: "error: missing name argument".to_string(),
            is_error: true,
        };
    };
    match skills.read(name) {
        Ok(content) => ToolOutput {
            text: content,
            is_error: false,
        },
        Err(e) => ToolOutput {
            text: format!("error: {e:#}"),
            is_error: true,
        },
    }
}
