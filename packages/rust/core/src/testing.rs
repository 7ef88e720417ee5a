//! In-crate test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use partgen_ollama::{ChatBackend, ChatMessage, GenerationOptions};
use partgen_shared::{PartGenError, Result};

type Responder = dyn Fn(usize, &[ChatMessage]) -> Result<String> + Send + Sync;

/// Scripted [`ChatBackend`]: the responder sees the zero-based call index
/// and the messages of each call.
pub(crate) struct MockBackend {
    responder: Box<Responder>,
    calls: AtomicUsize,
    reachable: bool,
}

impl MockBackend {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, &[ChatMessage]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            reachable: true,
        }
    }

    /// Always answers `text`.
    pub(crate) fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Every call fails as if the service were down.
    pub(crate) fn unreachable() -> Self {
        let mut backend = Self::new(|_, _| Err(PartGenError::Connectivity("connection refused".into())));
        backend.reachable = false;
        backend
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn chat(&self, _model: &str, messages: &[ChatMessage], _options: &GenerationOptions) -> Result<String> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(index, messages)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mock:latest".to_string()])
    }

    async fn pull_model(&self, _name: &str) -> bool {
        self.reachable
    }

    async fn test_connection(&self) -> bool {
        self.reachable
    }
}

/// Extract the `Part Number: ...` value from a generation request.
pub(crate) fn requested_part_number(messages: &[ChatMessage]) -> Option<String> {
    messages.iter().rev().find_map(|m| {
        m.content
            .lines()
            .find_map(|line| line.strip_prefix("Part Number: "))
            .map(str::to_string)
    })
}

/// A well-formed reply for `part_number`.
pub(crate) fn reply_for(part_number: &str) -> String {
    format!("Title: {part_number} - Acme 100A Breaker\nDescription: Details about {part_number}.")
}
