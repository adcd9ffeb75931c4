//! Wiki Q&A chat: context selection, transcript persistence and the
//! question/answer round-trip against the chat model.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::agent::{ChatMessage, ChatModel};
use crate::context::select_context_pages;
use crate::db::Db;
use crate::directives::QA_DIRECTIVE;
use crate::error::FalconError;
use crate::types::ConversationMessage;
use crate::wiki::WikiService;

const MAX_CONTEXT_PAGES: usize = 5;
/// Per-page byte cap on context markdown injected into the model prompt.
const MAX_CONTEXT_BYTES: usize = 12_000;

/// One SSE event of a wiki chat exchange.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Thinking {
        context_pages: Vec<String>,
    },
    Complete {
        response: String,
        sources: Vec<String>,
        conversation_id: String,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Thinking { context_pages } => json!({ "context_pages": context_pages }),
            Self::Complete {
                response,
                sources,
                conversation_id,
            } => json!({
                "response": response,
                "sources": sources,
                "conversation_id": conversation_id,
            }),
            Self::Error { message } => json!({ "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Db>,
    wikis: WikiService,
    model: Arc<dyn ChatModel>,
}

impl ChatService {
    pub fn new(db: Arc<Db>, wikis: WikiService, model: Arc<dyn ChatModel>) -> Self {
        Self { db, wikis, model }
    }

    /// Answer one chat message, pushing `thinking` / `complete` / `error`
    /// events as they occur. All failures become an `error` event; the
    /// stream always terminates.
    pub async fn handle_message(
        &self,
        wiki_id: &str,
        message: &str,
        conversation_id: Option<String>,
        tx: &UnboundedSender<ChatEvent>,
    ) {
        if let Err(e) = self
            .handle_inner(wiki_id, message, conversation_id, tx)
            .await
        {
            let _ = tx.send(ChatEvent::Error {
                message: e.to_string(),
            });
        }
    }

    async fn handle_inner(
        &self,
        wiki_id: &str,
        message: &str,
        conversation_id: Option<String>,
        tx: &UnboundedSender<ChatEvent>,
    ) -> Result<(), FalconError> {
        if self.wikis.get_wiki(wiki_id)?.is_none() {
            let _ = tx.send(ChatEvent::Error {
                message: "Wiki not found".into(),
            });
            return Ok(());
        }

        let conversation_id = match conversation_id {
            Some(id) => {
                if !self.db.conversation_belongs(&id, wiki_id)? {
                    let _ = tx.send(ChatEvent::Error {
                        message: "Conversation not found".into(),
                    });
                    return Ok(());
                }
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.db.create_conversation(&id, wiki_id)?;
                id
            }
        };

        self.db
            .insert_conversation_message(&conversation_id, "user", message, None)?;

        let manifest = self.wikis.get_manifest(wiki_id).await?;
        let context_slugs = manifest
            .as_ref()
            .map(|m| select_context_pages(m, message, MAX_CONTEXT_PAGES))
            .unwrap_or_default();

        let _ = tx.send(ChatEvent::Thinking {
            context_pages: context_slugs.clone(),
        });

        let response = self
            .answer(wiki_id, message, &conversation_id, &context_slugs)
            .await?;

        let _ = tx.send(ChatEvent::Complete {
            response: response.clone(),
            sources: context_slugs.clone(),
            conversation_id: conversation_id.clone(),
        });

        self.db.insert_conversation_message(
            &conversation_id,
            "assistant",
            &response,
            Some(&context_slugs),
        )?;
        Ok(())
    }

    /// Compose the QA transcript: directive, prior turns, selected wiki
    /// pages, then the question.
    async fn answer(
        &self,
        wiki_id: &str,
        message: &str,
        conversation_id: &str,
        context_slugs: &[String],
    ) -> Result<String, FalconError> {
        let mut messages = vec![ChatMessage::system(QA_DIRECTIVE)];

        for prior in self.db.get_conversation_messages(conversation_id)? {
            // The just-saved user message is appended below with context.
            if prior.role == "user" && prior.content == message {
                continue;
            }
            match prior.role.as_str() {
                "user" => messages.push(ChatMessage::user(prior.content)),
                "assistant" => messages.push(ChatMessage::assistant(prior.content)),
                _ => {}
            }
        }

        let mut context = String::new();
        for slug in context_slugs {
            match self.wikis.read_page_markdown(wiki_id, slug).await? {
                Some(mut page) => {
                    truncate_on_char_boundary(&mut page, MAX_CONTEXT_BYTES);
                    context.push_str(&format!("## Wiki page: {slug}\n\n{page}\n\n"));
                }
                None => warn!(wiki_id, slug, "context page missing from storage"),
            }
        }

        let question = if context.is_empty() {
            message.to_string()
        } else {
            format!("{context}---\n\nQuestion: {message}")
        };
        messages.push(ChatMessage::user(question));

        self.model.complete(messages).await
    }

    pub fn get_conversation(
        &self,
        wiki_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Vec<ConversationMessage>>, FalconError> {
        if !self.db.conversation_belongs(conversation_id, wiki_id)? {
            return Ok(None);
        }
        Ok(Some(self.db.get_conversation_messages(conversation_id)?))
    }
}

/// Shorten a page to at most `max_bytes`, backing up to the nearest UTF-8
/// char boundary so multibyte content never splits.
fn truncate_on_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut n = max_bytes;
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    s.truncate(n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_backs_up_to_a_char_boundary() {
        // Two-byte chars: byte 5 falls mid-char, so the cut lands at 4.
        let mut s = "é".repeat(10);
        truncate_on_char_boundary(&mut s, 5);
        assert_eq!(s, "é".repeat(2));

        let mut dashed = "a — b — c".to_string();
        let cap = 4; // inside the first em-dash
        truncate_on_char_boundary(&mut dashed, cap);
        assert!(dashed.len() <= cap);
        assert_eq!(dashed, "a ");
    }

    #[test]
    fn short_strings_are_untouched() {
        let mut s = "short".to_string();
        truncate_on_char_boundary(&mut s, 12_000);
        assert_eq!(s, "short");
    }
}
