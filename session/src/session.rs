//! One request/stream/finalize cycle, plus resume after interruption.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{AbortHandle, AbortRegistration, Abortable, join_all};
use murmur_gateway::cache::apply_cache_strategy;
use murmur_gateway::sse::{StreamItem, relay_stream};
use murmur_gateway::{GatewayClient, GatewayError};
use murmur_types::{ChatId, CompletionRequest, GenerationId, MessageId};
use tokio::sync::mpsc;

use crate::buffer::{ChunkBuffer, FlushPolicy};
use crate::persist::{MessagePatch, PersistenceSink, ResumableMessage};

/// Pushed to the UI channel on every accepted delta, independent of the
/// persistence flush cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkNotification {
    pub message_id: MessageId,
    /// Full accumulated content, not just the new fragment.
    pub content: String,
    pub is_complete: bool,
}

/// Errors a session surfaces to its caller. Cancellation is not an error;
/// it arrives as [`SessionOutcome::Cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),

    /// The stream broke before a terminal event. Content flushed before
    /// the failure is retained and the message stays resumable.
    #[error("stream failed: {0}")]
    Stream(String),
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed {
        generation_id: Option<GenerationId>,
    },
    Cancelled,
}

/// Drives one completion for one message id.
///
/// The gateway-assigned generation id is persisted as soon as the first
/// chunk carries it, so an interrupted session can be resumed later even
/// if the process dies mid-stream.
pub struct GenerationSession<S> {
    client: GatewayClient,
    sink: Arc<S>,
    notifier: mpsc::Sender<ChunkNotification>,
    policy: FlushPolicy,
    message_id: MessageId,
    chat_id: ChatId,
    abort_handle: AbortHandle,
    abort_registration: Option<AbortRegistration>,
}

impl<S: PersistenceSink> GenerationSession<S> {
    #[must_use]
    pub fn new(
        client: GatewayClient,
        sink: Arc<S>,
        notifier: mpsc::Sender<ChunkNotification>,
        policy: FlushPolicy,
        message_id: MessageId,
        chat_id: ChatId,
    ) -> Self {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        Self {
            client,
            sink,
            notifier,
            policy,
            message_id,
            chat_id,
            abort_handle,
            abort_registration: Some(abort_registration),
        }
    }

    /// Handle that cancels the session's stream read. Cancellation drops
    /// the buffer without a terminal flush; the caller decides whether to
    /// mark the message failed.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[must_use]
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Run a fresh completion to its terminal event.
    pub async fn complete(
        mut self,
        request: CompletionRequest,
    ) -> Result<SessionOutcome, SessionError> {
        let messages = apply_cache_strategy(&request.model, &request.messages);
        let request = request.with_messages(messages);
        let response = self
            .open_with_retry(|| self.client.chat_completion(&request))
            .await?;
        self.run_stream(response, None, None).await
    }

    /// Re-open an interrupted generation and continue accumulating from
    /// the already-persisted content.
    pub async fn resume(
        mut self,
        message: ResumableMessage,
    ) -> Result<SessionOutcome, SessionError> {
        let response = self
            .open_with_retry(|| self.client.resume_generation(&message.generation_id))
            .await?;
        self.run_stream(response, Some(message.content), Some(message.generation_id))
            .await
    }

    /// Gate on the governor, send, and retry rate-limit errors with
    /// backoff. Each attempt re-checks server state first so a long
    /// retry-after is respected instead of retried pointlessly fast.
    async fn open_with_retry<F, Fut>(&self, mut send: F) -> Result<reqwest::Response, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            if let Some(wait) = self.client.required_wait() {
                tracing::debug!(message_id = %self.message_id, ?wait, "Waiting before request");
                tokio::time::sleep(wait).await;
            }
            match send().await {
                Ok(response) => return Ok(response),
                Err(GatewayError::RateLimited { retry_after, .. })
                    if attempt + 1 < self.client.max_attempts() =>
                {
                    let delay = retry_after.unwrap_or_else(|| self.client.backoff_delay(attempt));
                    tracing::warn!(
                        message_id = %self.message_id,
                        attempt,
                        ?delay,
                        "Rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_stream(
        &mut self,
        response: reqwest::Response,
        seed: Option<String>,
        mut generation_id: Option<GenerationId>,
    ) -> Result<SessionOutcome, SessionError> {
        let (tx, mut rx) = mpsc::channel(64);
        let registration = match self.abort_registration.take() {
            Some(registration) => registration,
            None => AbortHandle::new_pair().1,
        };
        tokio::spawn(Abortable::new(relay_stream(response, tx), registration));

        let mut buffer = ChunkBuffer::new(self.policy);
        if let Some(seed) = seed {
            buffer.seed(self.message_id, seed, Instant::now());
        }

        loop {
            let item = match buffer.next_deadline(self.message_id) {
                Some(deadline) => tokio::select! {
                    item = rx.recv() => item,
                    () = tokio::time::sleep_until(deadline.into()) => {
                        self.flush(&mut buffer).await?;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match item {
                // Channel closed without a terminal item: the relay was
                // aborted. Drop the buffer; no terminal flush.
                None => {
                    buffer.discard(self.message_id);
                    tracing::debug!(message_id = %self.message_id, "Stream cancelled");
                    return Ok(SessionOutcome::Cancelled);
                }
                Some(StreamItem::Chunk(chunk)) => {
                    if generation_id.is_none()
                        && let Some(id) = chunk.id.clone()
                    {
                        let id = GenerationId::new(id);
                        self.sink
                            .update_message(self.message_id, MessagePatch::generation(id.clone()))
                            .await
                            .map_err(SessionError::Persistence)?;
                        generation_id = Some(id);
                    }

                    let now = Instant::now();
                    let finished = chunk.finish_reason().is_some();
                    if let Some(choice) = chunk.first_choice()
                        && let Some(content) = buffer.accept(self.message_id, &choice.delta, now)
                    {
                        let _ = self
                            .notifier
                            .send(ChunkNotification {
                                message_id: self.message_id,
                                content,
                                is_complete: false,
                            })
                            .await;
                    }

                    if finished {
                        return self.finalize(&mut buffer, generation_id).await;
                    }
                    if buffer.should_flush(self.message_id, now) {
                        self.flush(&mut buffer).await?;
                    }
                }
                Some(StreamItem::End) => {
                    return self.finalize(&mut buffer, generation_id).await;
                }
                Some(StreamItem::Failed(message)) => {
                    // Keep whatever already accumulated; the message stays
                    // incomplete and resumable.
                    if let Some(patch) = buffer.take_patch(self.message_id, Instant::now())
                        && let Err(e) = self.sink.update_message(self.message_id, patch).await
                    {
                        tracing::warn!(%e, "Flush after stream failure also failed");
                    }
                    buffer.discard(self.message_id);
                    return Err(SessionError::Stream(message));
                }
            }
        }
    }

    /// Throttled flush. A mid-stream persistence failure triggers one
    /// best-effort forced terminal flush before the error propagates.
    async fn flush(&self, buffer: &mut ChunkBuffer) -> Result<(), SessionError> {
        let Some(patch) = buffer.take_patch(self.message_id, Instant::now()) else {
            return Ok(());
        };
        if let Err(e) = self.sink.update_message(self.message_id, patch).await {
            tracing::error!(message_id = %self.message_id, %e, "Persistence failed mid-stream");
            let terminal = buffer.finalize(self.message_id);
            if let Err(forced) = self.sink.update_message(self.message_id, terminal).await {
                tracing::warn!(%forced, "Forced terminal flush failed");
            }
            return Err(SessionError::Persistence(e));
        }
        Ok(())
    }

    /// Terminal flush: persist the complete flag, notify the UI once with
    /// the final content, and stop the relay task.
    async fn finalize(
        &self,
        buffer: &mut ChunkBuffer,
        generation_id: Option<GenerationId>,
    ) -> Result<SessionOutcome, SessionError> {
        let content = buffer
            .content(self.message_id)
            .unwrap_or_default()
            .to_string();
        let patch = buffer.finalize(self.message_id);
        self.sink
            .update_message(self.message_id, patch)
            .await
            .map_err(SessionError::Persistence)?;
        let _ = self
            .notifier
            .send(ChunkNotification {
                message_id: self.message_id,
                content,
                is_complete: true,
            })
            .await;
        self.abort_handle.abort();
        Ok(SessionOutcome::Completed { generation_id })
    }
}

/// Final state of one resume attempt.
#[derive(Debug)]
pub enum ResumeOutcome {
    Complete,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub struct ResumeReport {
    pub message_id: MessageId,
    pub outcome: ResumeOutcome,
}

/// Resume every persisted message that was interrupted mid-stream.
///
/// Each message goes through its own pending → resuming → complete|failed
/// cycle independently and concurrently; one failure never blocks the
/// others.
pub async fn resume_incomplete<S: PersistenceSink>(
    client: &GatewayClient,
    sink: &Arc<S>,
    notifier: &mpsc::Sender<ChunkNotification>,
    policy: FlushPolicy,
) -> Vec<ResumeReport> {
    let pending = match sink.load_incomplete().await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::warn!(%e, "Failed to load interrupted messages");
            return Vec::new();
        }
    };

    let resumes = pending.into_iter().map(|message| {
        let session = GenerationSession::new(
            client.clone(),
            Arc::clone(sink),
            notifier.clone(),
            policy,
            message.message_id,
            message.chat_id,
        );
        async move {
            let message_id = message.message_id;
            let outcome = match session.resume(message).await {
                Ok(SessionOutcome::Completed { .. }) => ResumeOutcome::Complete,
                Ok(SessionOutcome::Cancelled) => ResumeOutcome::Cancelled,
                Err(e) => {
                    tracing::warn!(message_id = %message_id, %e, "Resume failed");
                    ResumeOutcome::Failed(e.to_string())
                }
            };
            ResumeReport {
                message_id,
                outcome,
            }
        }
    });

    join_all(resumes).await
}
