//! Conversation and message persistence.
//!
//! The agent engine only knows this layer through "append message / load
//! messages / update message content"; the HTTP layer additionally exposes
//! CRUD over conversations and replayable per-message process details.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::database::Database;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    /// Execution IDs of the tool invocations made while producing this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_ids: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessDetail {
    pub id: i64,
    pub message_id: String,
    pub event_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: String,
}

/// Persistence for conversations, messages, and process details.
pub struct ConversationStore {
    db: Arc<Database>,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let now = Utc::now().to_rfc3339();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.db.conn().execute(
            "INSERT INTO conversations (id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.id,
                conversation.title,
                conversation.created_at,
                conversation.updated_at
            ],
        )?;
        Ok(conversation)
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM conversations
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.db
            .conn()
            .query_row(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                [id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let affected = self
            .db
            .conn()
            .execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// Append a message to a conversation and bump its updated_at.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        execution_ids: &[String],
    ) -> Result<Message> {
        let now = Utc::now().to_rfc3339();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            execution_ids: execution_ids.to_vec(),
            created_at: now.clone(),
        };
        let ids_json = if execution_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(execution_ids)?)
        };

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, execution_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.conversation_id,
                message.role,
                message.content,
                ids_json,
                message.created_at
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        Ok(message)
    }

    /// Replace a message's content (and optionally its execution-ID list).
    ///
    /// Used to fill the placeholder assistant message with the terminal
    /// outcome of a turn.
    pub fn update_message(
        &self,
        message_id: &str,
        content: &str,
        execution_ids: Option<&[String]>,
    ) -> Result<()> {
        let affected = match execution_ids {
            Some(ids) => {
                let ids_json = if ids.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(ids)?)
                };
                self.db.conn().execute(
                    "UPDATE messages SET content = ?1, execution_ids = ?2 WHERE id = ?3",
                    params![content, ids_json, message_id],
                )?
            }
            None => self.db.conn().execute(
                "UPDATE messages SET content = ?1 WHERE id = ?2",
                params![content, message_id],
            )?,
        };
        if affected == 0 {
            return Err(anyhow!("message not found: {message_id}"));
        }
        Ok(())
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, execution_ids, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let ids_json: Option<String> = row.get(4)?;
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                execution_ids: ids_json
                    .and_then(|j| serde_json::from_str(&j).ok())
                    .unwrap_or_default(),
                created_at: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Record a stream event against its placeholder message so clients can
    /// replay turn progress after a reconnect.
    pub fn add_process_detail(
        &self,
        message_id: &str,
        conversation_id: &str,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        self.db.conn().execute(
            "INSERT INTO process_details
                 (message_id, conversation_id, event_type, message, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message_id,
                conversation_id,
                event_type,
                message,
                payload_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_process_details(&self, message_id: &str) -> Result<Vec<ProcessDetail>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, event_type, message, payload, created_at
             FROM process_details WHERE message_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([message_id], |row| {
            let payload_json: Option<String> = row.get(4)?;
            Ok(ProcessDetail {
                id: row.get(0)?,
                message_id: row.get(1)?,
                event_type: row.get(2)?,
                message: row.get(3)?,
                payload: payload_json.and_then(|j| serde_json::from_str(&j).ok()),
                created_at: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (ConversationStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (ConversationStore::new(Arc::new(db)), dir)
    }

    #[test]
    fn create_and_fetch_conversation() {
        let (store, _dir) = test_store();
        let conv = store.create_conversation("scan 10.0.0.1").unwrap();

        let fetched = store.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(fetched.title, "scan 10.0.0.1");
        assert!(store.get_conversation("missing").unwrap().is_none());
    }

    #[test]
    fn messages_round_trip_with_execution_ids() {
        let (store, _dir) = test_store();
        let conv = store.create_conversation("t").unwrap();

        store
            .add_message(&conv.id, "user", "scan the host", &[])
            .unwrap();
        let ids = vec!["exec-a".to_string(), "exec-b".to_string()];
        store
            .add_message(&conv.id, "assistant", "two open ports", &ids)
            .unwrap();

        let messages = store.get_messages(&conv.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert!(messages[0].execution_ids.is_empty());
        assert_eq!(messages[1].execution_ids, ids);
    }

    #[test]
    fn update_message_replaces_content() {
        let (store, _dir) = test_store();
        let conv = store.create_conversation("t").unwrap();
        let msg = store
            .add_message(&conv.id, "assistant", "Processing...", &[])
            .unwrap();

        store
            .update_message(&msg.id, "final answer", Some(&["exec-1".to_string()]))
            .unwrap();

        let messages = store.get_messages(&conv.id).unwrap();
        assert_eq!(messages[0].content, "final answer");
        assert_eq!(messages[0].execution_ids, vec!["exec-1"]);

        assert!(store.update_message("missing", "x", None).is_err());
    }

    #[test]
    fn delete_cascades_messages() {
        let (store, _dir) = test_store();
        let conv = store.create_conversation("t").unwrap();
        store.add_message(&conv.id, "user", "hi", &[]).unwrap();

        assert!(store.delete_conversation(&conv.id).unwrap());
        assert!(!store.delete_conversation(&conv.id).unwrap());
        assert!(store.get_messages(&conv.id).unwrap().is_empty());
    }

    #[test]
    fn process_details_replay_in_order() {
        let (store, _dir) = test_store();
        let conv = store.create_conversation("t").unwrap();
        let msg = store
            .add_message(&conv.id, "assistant", "Processing...", &[])
            .unwrap();

        store
            .add_process_detail(&msg.id, &conv.id, "iteration", "iteration 1", None)
            .unwrap();
        store
            .add_process_detail(
                &msg.id,
                &conv.id,
                "tool_call",
                "calling port_scan",
                Some(&serde_json::json!({"toolName": "port_scan"})),
            )
            .unwrap();

        let details = store.get_process_details(&msg.id).unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].event_type, "iteration");
        assert_eq!(
            details[1].payload.as_ref().unwrap()["toolName"],
            "port_scan"
        );
    }
}
