//! Chat store
//!
//! Durable chats and their ordered messages. Messages live in a normalized
//! table keyed by `(chat_id, sequence_num)`; parts are stored as JSON so a
//! persisted assistant turn replays exactly as it streamed. Every access
//! checks ownership, and externally a foreign chat is indistinguishable
//! from a missing one.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};
use crate::types::{Message, Part, Role, Timestamp};

/// Title used until the async title generation completes.
pub const PROVISIONAL_TITLE: &str = "Analyzing…";

/// A chat with its messages in insertion order.
#[derive(Debug, Serialize)]
pub struct ChatDetail {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Chat list item (no messages).
#[derive(Debug, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub message_count: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Inputs to [`upsert_chat`].
#[derive(Debug)]
pub struct UpsertChat<'a> {
    pub user_id: &'a str,
    pub chat_id: &'a str,
    /// `None` keeps the existing title (or the provisional one on create)
    pub title: Option<&'a str>,
    pub messages: &'a [Message],
}

fn parse_message_row(row: &sqlx::sqlite::SqliteRow) -> Option<Message> {
    let id: String = row.get("id");
    let role_raw: String = row.get("role");
    let parts_raw: String = row.get("parts");

    let role: Role = match role_raw.parse() {
        Ok(role) => role,
        Err(e) => {
            tracing::warn!(message_id = %id, error = %e, "Skipping message with unknown role");
            return None;
        }
    };
    let parts: Vec<Part> = match serde_json::from_str(&parts_raw) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(message_id = %id, error = %e, "Skipping message with undecodable parts");
            return None;
        }
    };

    Some(Message { id, role, parts })
}

/// Who owns a chat, if it exists. Internal; handlers use this to tell
/// "new chat" apart from "someone else's chat id".
pub async fn fetch_owner(pool: &SqlitePool, chat_id: &str) -> Result<Option<String>> {
    let owner: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM app_chats WHERE id = $1")
            .bind(chat_id)
            .fetch_optional(pool)
            .await?;
    Ok(owner)
}

/// Create a chat with the provisional title unless it already exists.
/// Returns true when this call created it.
pub async fn create_chat_if_absent(
    pool: &SqlitePool,
    user_id: &str,
    chat_id: &str,
) -> Result<bool> {
    let result =
        sqlx::query("INSERT OR IGNORE INTO app_chats (id, user_id, title) VALUES ($1, $2, $3)")
            .bind(chat_id)
            .bind(user_id)
            .bind(PROVISIONAL_TITLE)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Create or replace a chat's content atomically.
///
/// - Owner mismatch fails with [`Error::AccessDenied`]; nothing changes.
/// - An existing chat gets its title updated (when one is given and
///   differs) and its message list replaced.
/// - A missing chat is created, with the provisional title when none is
///   given, and the messages inserted in the given order.
pub async fn upsert_chat(pool: &SqlitePool, input: UpsertChat<'_>) -> Result<()> {
    let mut tx = pool.begin().await?;

    let existing_owner: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM app_chats WHERE id = $1")
            .bind(input.chat_id)
            .fetch_optional(&mut *tx)
            .await?;

    match existing_owner {
        Some(owner) if owner != input.user_id => {
            return Err(Error::AccessDenied(format!(
                "chat {} belongs to another user",
                input.chat_id
            )));
        }
        Some(_) => {
            if let Some(title) = input.title {
                sqlx::query(
                    "UPDATE app_chats SET title = $1, updated_at = datetime('now') \
                     WHERE id = $2 AND title != $1",
                )
                .bind(title)
                .bind(input.chat_id)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE app_chats SET updated_at = datetime('now') WHERE id = $1")
                .bind(input.chat_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM app_chat_messages WHERE chat_id = $1")
                .bind(input.chat_id)
                .execute(&mut *tx)
                .await?;
        }
        None => {
            sqlx::query("INSERT INTO app_chats (id, user_id, title) VALUES ($1, $2, $3)")
                .bind(input.chat_id)
                .bind(input.user_id)
                .bind(input.title.unwrap_or(PROVISIONAL_TITLE))
                .execute(&mut *tx)
                .await?;
        }
    }

    for (idx, message) in input.messages.iter().enumerate() {
        let parts_json = serde_json::to_string(&message.parts)?;
        sqlx::query(
            r#"
            INSERT INTO app_chat_messages (id, chat_id, role, parts, sequence_num)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&message.id)
        .bind(input.chat_id)
        .bind(message.role.as_str())
        .bind(parts_json)
        .bind((idx + 1) as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// A chat with messages in insertion order, or `None` when it is missing
/// or owned by another user.
pub async fn get_chat(
    pool: &SqlitePool,
    chat_id: &str,
    user_id: &str,
) -> Result<Option<ChatDetail>> {
    let chat_row = sqlx::query(
        "SELECT id, title, created_at, updated_at FROM app_chats \
         WHERE id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some(chat_row) = chat_row else {
        return Ok(None);
    };

    let message_rows = sqlx::query(
        "SELECT id, role, parts FROM app_chat_messages \
         WHERE chat_id = $1 ORDER BY sequence_num ASC",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;

    let messages = message_rows
        .iter()
        .filter_map(parse_message_row)
        .collect();

    Ok(Some(ChatDetail {
        id: chat_row.get("id"),
        title: chat_row.get("title"),
        messages,
        created_at: chat_row.get("created_at"),
        updated_at: chat_row.get("updated_at"),
    }))
}

/// The user's chats, most recently updated first.
pub async fn list_chats(pool: &SqlitePool, user_id: &str) -> Result<Vec<ChatSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT
            c.id,
            c.title,
            c.created_at,
            c.updated_at,
            (SELECT COUNT(*) FROM app_chat_messages m WHERE m.chat_id = c.id) AS message_count
        FROM app_chats c
        WHERE c.user_id = $1
        ORDER BY c.updated_at DESC, c.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ChatSummary {
            id: row.get("id"),
            title: row.get("title"),
            message_count: row.get("message_count"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
        .collect())
}

/// Delete a chat and its messages. A missing chat and a foreign chat fail
/// the same way.
pub async fn delete_chat(pool: &SqlitePool, chat_id: &str, user_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    let owned: Option<String> =
        sqlx::query_scalar("SELECT id FROM app_chats WHERE id = $1 AND user_id = $2")
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

    if owned.is_none() {
        return Err(Error::NotFound("chat not found".into()));
    }

    sqlx::query("DELETE FROM app_chat_messages WHERE chat_id = $1")
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM app_chats WHERE id = $1")
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Generate a short title from the opening user message(s).
///
/// Races the research loop by design; when it loses or fails, the
/// provisional title simply stays.
pub async fn generate_title(
    gateway: Arc<dyn ModelGateway>,
    messages: &[Message],
) -> Result<String> {
    let conversation_summary: String = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .take(3)
        .map(|m| {
            let text = m.flattened_text();
            text.chars().take(200).collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        "Based on this conversation, generate a very short title (3-6 words \
         maximum) that captures the main topic. Only return the title, \
         nothing else.\n\nConversation:\n{}",
        conversation_summary
    );

    let response = gateway
        .generate_text(
            GenerateRequest::new(ModelRole::Utility, prompt)
                .with_trace_id(crate::gateway::new_trace_id()),
        )
        .await?;

    let mut title = response.text.trim().to_string();
    title = title.trim_matches(|c| c == '"' || c == '\'').to_string();

    if title.chars().count() > 60 {
        title = format!("{}...", title.chars().take(57).collect::<String>());
    }

    if title.is_empty() {
        return Err(Error::Gateway("Empty title".into()));
    }

    Ok(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::types::Message;

    async fn pool_with_users() -> SqlitePool {
        let pool = memory_pool().await.unwrap();
        for user in ["user_a", "user_b"] {
            sqlx::query("INSERT INTO app_users (id, email) VALUES ($1, $2)")
                .bind(user)
                .bind(format!("{}@example.com", user))
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::text("msg_1", Role::User, "What is Rust?"),
            Message::text("msg_2", Role::Assistant, "A systems language."),
        ]
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trip() {
        let pool = pool_with_users().await;
        let messages = sample_messages();

        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: Some("Rust basics"),
                messages: &messages,
            },
        )
        .await
        .unwrap();

        let chat = get_chat(&pool, "chat_1", "user_a").await.unwrap().unwrap();
        assert_eq!(chat.title, "Rust basics");
        let ids: Vec<&str> = chat.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg_1", "msg_2"]);
    }

    #[tokio::test]
    async fn test_cross_user_access_is_hidden() {
        let pool = pool_with_users().await;
        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: None,
                messages: &sample_messages(),
            },
        )
        .await
        .unwrap();

        assert!(get_chat(&pool, "chat_1", "user_b").await.unwrap().is_none());
        assert!(matches!(
            delete_chat(&pool, "chat_1", "user_b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_user_upsert_denied_and_atomic() {
        let pool = pool_with_users().await;
        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: Some("Original"),
                messages: &sample_messages(),
            },
        )
        .await
        .unwrap();

        let result = upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_b",
                chat_id: "chat_1",
                title: Some("Hijacked"),
                messages: &[Message::text("msg_x", Role::User, "mine now")],
            },
        )
        .await;
        assert!(matches!(result, Err(Error::AccessDenied(_))));

        // Nothing changed
        let chat = get_chat(&pool, "chat_1", "user_a").await.unwrap().unwrap();
        assert_eq!(chat.title, "Original");
        assert_eq!(chat.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_message_list() {
        let pool = pool_with_users().await;
        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: None,
                messages: &sample_messages(),
            },
        )
        .await
        .unwrap();

        let replacement = vec![
            Message::text("msg_1", Role::User, "What is Rust?"),
            Message::text("msg_2", Role::Assistant, "A systems language."),
            Message::text("msg_3", Role::User, "And Cargo?"),
        ];
        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: None,
                messages: &replacement,
            },
        )
        .await
        .unwrap();

        let chat = get_chat(&pool, "chat_1", "user_a").await.unwrap().unwrap();
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.title, PROVISIONAL_TITLE);
    }

    #[tokio::test]
    async fn test_list_chats_ordered_by_update() {
        let pool = pool_with_users().await;
        for (chat_id, updated) in [("chat_old", "2024-01-01 00:00:00"), ("chat_new", "2024-06-01 00:00:00")] {
            upsert_chat(
                &pool,
                UpsertChat {
                    user_id: "user_a",
                    chat_id,
                    title: None,
                    messages: &sample_messages(),
                },
            )
            .await
            .unwrap();
            sqlx::query("UPDATE app_chats SET updated_at = $1 WHERE id = $2")
                .bind(updated)
                .bind(chat_id)
                .execute(&pool)
                .await
                .unwrap();
        }

        let chats = list_chats(&pool, "user_a").await.unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].id, "chat_new");
        assert_eq!(chats[0].message_count, 2);

        assert!(list_chats(&pool, "user_b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let pool = pool_with_users().await;
        upsert_chat(
            &pool,
            UpsertChat {
                user_id: "user_a",
                chat_id: "chat_1",
                title: None,
                messages: &sample_messages(),
            },
        )
        .await
        .unwrap();

        delete_chat(&pool, "chat_1", "user_a").await.unwrap();

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM app_chat_messages WHERE chat_id = 'chat_1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(remaining, 0);
        assert!(get_chat(&pool, "chat_1", "user_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_chat_if_absent_is_idempotent() {
        let pool = pool_with_users().await;
        assert!(create_chat_if_absent(&pool, "user_a", "chat_1").await.unwrap());
        assert!(!create_chat_if_absent(&pool, "user_a", "chat_1").await.unwrap());

        assert_eq!(
            fetch_owner(&pool, "chat_1").await.unwrap().as_deref(),
            Some("user_a")
        );
        assert_eq!(fetch_owner(&pool, "chat_missing").await.unwrap(), None);
    }
}
