//! Streaming bridge between the model driver and HTTP responses.
//!
//! One [`ChatService::send_message`] call drives a complete exchange:
//! validate the message, snapshot the conversation, open the upstream
//! stream, forward each fragment to the client while accumulating the full
//! reply, and commit exactly one user/assistant pair to the store on every
//! exit path, including client disconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::conversation::{ConversationStore, Message};
use crate::error::ApiError;
use crate::llm::LlmDriver;
use crate::prompt;

/// Reply substituted when the model produced no text at all.
pub const FALLBACK_REPLY: &str =
    "I encountered an issue generating a response. Please try again.";

/// Chat service owning the model driver and the conversation store.
#[derive(Debug)]
pub struct ChatService {
    driver: Arc<dyn LlmDriver>,
    store: Arc<dyn ConversationStore>,
    /// One async mutex per conversation id, held for a full exchange so
    /// concurrent sends on the same conversation cannot interleave their
    /// read-assemble-commit cycles. Entries are created lazily and kept for
    /// the process lifetime, like the store's key set.
    exchange_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatService {
    /// Create a chat service over a driver and a store.
    #[must_use]
    pub fn new(driver: Arc<dyn LlmDriver>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            driver,
            store,
            exchange_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The exchange lock for a conversation.
    fn exchange_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.exchange_locks.lock().unwrap();
        Arc::clone(guard.entry(conversation_id.to_string()).or_default())
    }

    /// Run one exchange and return the reply as a plain-text fragment stream.
    ///
    /// The returned stream never fails: upstream errors surface as in-band
    /// text (when nothing has been emitted yet) or leave the partial reply
    /// standing. Whether the stream is consumed to the end or dropped early,
    /// the exchange pair is committed exactly once.
    ///
    /// Sends on the same conversation are serialized; this call waits until
    /// the previous exchange for the id has committed. Sends on different
    /// conversations proceed concurrently.
    ///
    /// # Errors
    ///
    /// [`ApiError::EmptyMessage`] when the message is blank; nothing is
    /// locked, stored, or sent upstream in that case.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<impl Stream<Item = String> + Send + 'static, ApiError> {
        prompt::validate(content)?;

        let permit = self.exchange_lock(conversation_id).lock_owned().await;
        let history = self.store.get_or_create(conversation_id);
        let request = prompt::assemble(&history, content);

        let request_id = Uuid::new_v4().to_string();
        debug!(
            name: "chat.exchange.started",
            request_id = %request_id,
            conversation_id = %conversation_id,
            history_len = history.len(),
            content_length = content.len(),
            "Exchange started"
        );

        let driver = Arc::clone(&self.driver);
        let mut commit = ExchangeCommit {
            store: Arc::clone(&self.store),
            conversation_id: conversation_id.to_string(),
            request_id: request_id.clone(),
            user: content.to_string(),
            reply: String::new(),
            committed: false,
            _permit: permit,
        };

        Ok(async_stream::stream! {
            let mut upstream = match driver.stream(request).await {
                Ok(s) => s,
                Err(e) => {
                    error!(
                        name: "chat.upstream.refused",
                        request_id = %request_id,
                        error = %e,
                        "Failed to open upstream stream"
                    );
                    yield commit.absorb(format!("Error: {e}"));
                    commit.commit();
                    return;
                }
            };

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(fragment) => {
                        if fragment.is_empty() {
                            continue;
                        }
                        trace!(request_id = %request_id, fragment_length = fragment.len(), "Reply fragment");
                        yield commit.absorb(fragment);
                    }
                    Err(e) => {
                        error!(
                            name: "chat.upstream.interrupted",
                            request_id = %request_id,
                            error = %e,
                            reply_length = commit.reply.len(),
                            "Upstream stream failed mid-reply"
                        );
                        // A partial reply stands as the response; only a
                        // failure that produced nothing surfaces as in-band
                        // error text.
                        if commit.is_unanswered() {
                            yield commit.absorb(format!("Error: {e}"));
                        }
                        commit.commit();
                        return;
                    }
                }
            }

            if commit.is_unanswered() {
                yield commit.absorb(FALLBACK_REPLY.to_string());
            }
            commit.commit();
        })
    }
}

/// Commit guard for an in-flight exchange.
///
/// The guard lives inside the response stream and writes the user message
/// plus the accumulated reply to the store as one pair. The stream commits
/// explicitly when it finishes or fails; `Drop` covers abandonment, so a
/// client disconnect still persists whatever had arrived. An exchange that
/// absorbed nothing commits [`FALLBACK_REPLY`] instead of an empty message.
struct ExchangeCommit {
    store: Arc<dyn ConversationStore>,
    conversation_id: String,
    request_id: String,
    user: String,
    reply: String,
    committed: bool,
    /// Held until the commit lands so a queued exchange on the same
    /// conversation observes this one's pair.
    _permit: OwnedMutexGuard<()>,
}

impl ExchangeCommit {
    /// Append a fragment to the pending reply and hand it back for the
    /// client, so the streamed text and the stored text cannot diverge.
    fn absorb(&mut self, fragment: String) -> String {
        self.reply.push_str(&fragment);
        fragment
    }

    /// Whether no reply text has been absorbed yet.
    fn is_unanswered(&self) -> bool {
        self.reply.is_empty()
    }

    /// Write the pair to the store. The first call wins; later calls and
    /// the `Drop` backstop are no-ops.
    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        let user = std::mem::take(&mut self.user);
        let mut reply = std::mem::take(&mut self.reply);
        if reply.is_empty() {
            // Dropped before any fragment arrived; keep the invariant that
            // every committed pair carries a non-empty reply.
            reply.push_str(FALLBACK_REPLY);
        }

        debug!(
            name: "chat.exchange.committed",
            request_id = %self.request_id,
            conversation_id = %self.conversation_id,
            reply_length = reply.len(),
            "Exchange committed"
        );
        self.store.append_exchange(
            &self.conversation_id,
            Message::user(user),
            Message::assistant(reply),
        );
    }
}

impl Drop for ExchangeCommit {
    fn drop(&mut self) {
        self.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{MemoryStore, MessageRole, RetentionPolicy};
    use crate::llm::LlmRequest;
    use std::pin::Pin;

    /// Driver that replays a fixed script instead of calling the hosted API.
    #[derive(Debug, Clone)]
    enum ScriptedDriver {
        Fragments(Vec<&'static str>),
        Empty,
        FailToOpen,
        FailAfter(Vec<&'static str>),
    }

    #[async_trait::async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn stream(
            &self,
            _req: LlmRequest,
        ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>>
        {
            match self {
                Self::FailToOpen => anyhow::bail!("connection refused"),
                Self::Empty => Ok(Box::pin(futures::stream::empty())),
                Self::Fragments(parts) => {
                    let items: Vec<anyhow::Result<String>> =
                        parts.iter().map(|s| Ok((*s).to_string())).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Self::FailAfter(parts) => {
                    let mut items: Vec<anyhow::Result<String>> =
                        parts.iter().map(|s| Ok((*s).to_string())).collect();
                    items.push(Err(anyhow::anyhow!("connection reset")));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
            }
        }
    }

    /// Driver that records every request and replies with one fragment.
    #[derive(Debug, Default)]
    struct RecordingDriver {
        requests: Mutex<Vec<LlmRequest>>,
    }

    #[async_trait::async_trait]
    impl LlmDriver for RecordingDriver {
        async fn stream(
            &self,
            req: LlmRequest,
        ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>>
        {
            self.requests.lock().unwrap().push(req);
            Ok(Box::pin(futures::stream::iter(vec![Ok(
                "Reply".to_string()
            )])))
        }
    }

    fn service(driver: impl LlmDriver + 'static) -> (ChatService, Arc<dyn ConversationStore>) {
        let store: Arc<dyn ConversationStore> =
            Arc::new(MemoryStore::new(RetentionPolicy::default()));
        (
            ChatService::new(Arc::new(driver), Arc::clone(&store)),
            store,
        )
    }

    #[tokio::test]
    async fn test_fragments_stream_and_commit_as_pair() {
        let (service, store) =
            service(ScriptedDriver::Fragments(vec!["Tokyo ", "in ", "spring"]));

        let stream = service.send_message("trip1", "Plan a trip").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["Tokyo ", "in ", "spring"]);

        let messages = store.get("trip1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("Plan a trip"));
        assert_eq!(messages[1], Message::assistant("Tokyo in spring"));
    }

    #[tokio::test]
    async fn test_blank_message_rejected_without_side_effects() {
        let (service, store) = service(ScriptedDriver::Fragments(vec!["unused"]));

        let result = service.send_message("trip1", "   ").await;
        assert!(matches!(result.err(), Some(ApiError::EmptyMessage)));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_empty_upstream_yields_fallback() {
        let (service, store) = service(ScriptedDriver::Empty);

        let stream = service.send_message("trip1", "Hello").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec![FALLBACK_REPLY.to_string()]);

        let messages = store.get("trip1");
        assert_eq!(messages[1], Message::assistant(FALLBACK_REPLY));
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_in_band() {
        let (service, store) = service(ScriptedDriver::FailToOpen);

        let stream = service.send_message("trip1", "Hello").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with("Error:"));

        let messages = store.get("trip1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, fragments[0]);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_reply() {
        let (service, store) = service(ScriptedDriver::FailAfter(vec!["Day 1: Asakusa. "]));

        let stream = service.send_message("trip1", "Hello").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["Day 1: Asakusa. "]);

        let messages = store.get("trip1");
        assert_eq!(messages[1], Message::assistant("Day 1: Asakusa. "));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_with_nothing_emitted() {
        let (service, store) = service(ScriptedDriver::FailAfter(vec![]));

        let stream = service.send_message("trip1", "Hello").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with("Error:"));
        assert_eq!(store.get("trip1")[1].content, fragments[0]);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_commits_partial() {
        let (service, store) = service(ScriptedDriver::Fragments(vec!["First ", "second"]));

        let mut stream = Box::pin(service.send_message("trip1", "Hello").await.unwrap());
        let first = stream.next().await.unwrap();
        assert_eq!(first, "First ");
        drop(stream);

        let messages = store.get("trip1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], Message::assistant("First "));
    }

    #[tokio::test]
    async fn test_unpolled_drop_commits_fallback() {
        let (service, store) = service(ScriptedDriver::Fragments(vec!["never sent"]));

        let stream = service.send_message("trip1", "Hello").await.unwrap();
        drop(stream);

        let messages = store.get("trip1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("Hello"));
        assert_eq!(messages[1], Message::assistant(FALLBACK_REPLY));
    }

    #[tokio::test]
    async fn test_second_send_carries_prior_turns() {
        let driver = Arc::new(RecordingDriver::default());
        let store: Arc<dyn ConversationStore> =
            Arc::new(MemoryStore::new(RetentionPolicy::default()));
        let service = ChatService::new(
            Arc::clone(&driver) as Arc<dyn LlmDriver>,
            Arc::clone(&store),
        );

        let first = service.send_message("trip1", "Hi").await.unwrap();
        let _: Vec<String> = first.collect().await;
        let second = service.send_message("trip1", "And then?").await.unwrap();
        let _: Vec<String> = second.collect().await;

        let requests = driver.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].turns.len(), 1);

        let turns = &requests[1].turns;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "Hi");
        assert_eq!(turns[1].text, "Reply");
        assert_eq!(turns[2].text, "And then?");
        assert!(!requests[1].system_instruction.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_on_one_id_serialize() {
        let (service, store) = service(ScriptedDriver::Fragments(vec!["Reply"]));
        let service = Arc::new(service);

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let stream = service.send_message("trip1", "First").await.unwrap();
                let _: Vec<String> = stream.collect().await;
            })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let stream = service.send_message("trip1", "Second").await.unwrap();
                let _: Vec<String> = stream.collect().await;
            })
        };

        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();

        let messages = store.get("trip1");
        assert_eq!(messages.len(), 4);
        // Pairs stay contiguous regardless of which send won the lock.
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1], Message::assistant("Reply"));
        assert_eq!(messages[2].role, MessageRole::User);
        assert_eq!(messages[3], Message::assistant("Reply"));
    }
}
