//! Scripted provider for tests.
//!
//! Behaves like a real adapter but plays back a queue of scripted
//! outcomes, so gateway fall-through, breaker bookkeeping, and streaming
//! peek logic can be exercised without a network.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{ChatMessage, CompletionParams, ProviderClient, StreamEvent};

/// One scripted outcome for a chat or stream call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// chat returns this text; stream yields it as one token per word.
    Reply(String),
    /// chat errors with this message; stream errors before the first token.
    Fail(String),
    /// stream opens but produces no tokens (chat treats this as an error).
    EmptyStream,
}

pub struct MockProvider {
    name: &'static str,
    available: AtomicBool,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            available: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_reply(&self, text: &str) {
        self.push(MockOutcome::Reply(text.to_string()));
    }

    pub fn push_failure(&self, error: &str) {
        self.push(MockOutcome::Fail(error.to_string()));
    }

    /// Number of chat/stream calls dispatched to this provider.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            // Default keeps simple tests short: echo provider name
            .unwrap_or_else(|| MockOutcome::Reply(format!("{} reply", self.name)))
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn model(&self) -> String {
        format!("mock-{}", self.name)
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _system: Option<&str>,
        _params: &CompletionParams,
    ) -> Result<String> {
        match self.next_outcome() {
            MockOutcome::Reply(text) => Ok(text),
            MockOutcome::Fail(error) => Err(anyhow::anyhow!(error)),
            MockOutcome::EmptyStream => Err(anyhow::anyhow!("empty response")),
        }
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        _system: Option<&str>,
        _params: &CompletionParams,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let outcome = self.next_outcome();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            match outcome {
                MockOutcome::Reply(text) => {
                    for word in text.split_whitespace() {
                        if tx.send(StreamEvent::Token(format!("{word} "))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(StreamEvent::Done).await;
                }
                MockOutcome::Fail(error) => {
                    let _ = tx.send(StreamEvent::Error(error)).await;
                }
                MockOutcome::EmptyStream => {
                    let _ = tx.send(StreamEvent::Done).await;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockProvider::new("local");
        mock.push_reply("first");
        mock.push_failure("timeout");

        let msgs = vec![ChatMessage::user("hi")];
        let params = CompletionParams::default();

        assert_eq!(mock.chat(&msgs, None, &params).await.unwrap(), "first");
        assert!(mock.chat(&msgs, None, &params).await.is_err());
        // Script exhausted: default echo
        assert_eq!(mock.chat(&msgs, None, &params).await.unwrap(), "local reply");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_tokens() {
        let mock = MockProvider::new("local");
        mock.push_reply("one two three");

        let mut rx = mock
            .chat_stream(&[ChatMessage::user("hi")], None, &CompletionParams::default())
            .await
            .unwrap();

        let mut tokens = Vec::new();
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Token(t) => tokens.push(t),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(tokens.len(), 3);
    }
}
