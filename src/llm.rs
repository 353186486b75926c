//! LLM collaborator: structured generation for alignment, metadata and tagging
//!
//! Defines the client trait the aligner consumes. Two implementations:
//! - `SubprocessClient`: pipes the prompt into a configured command and
//!   reads the raw reply from stdout (production)
//! - `MockClient`: replays scripted responses and records prompts (testing)
//!
//! Transport mechanics (HTTP, provider SDKs, rate limiting) live behind the
//! command; this crate only needs `generate_structured(prompt) -> text`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Errors from LLM client operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM not available: {0}")]
    Unavailable(String),
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
}

/// Client trait for structured generation.
///
/// The reply is raw text that should contain JSON; it may be malformed.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Send a prompt and return the raw reply.
    async fn generate_structured(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Client that runs an external command per call.
///
/// The prompt is written to the command's stdin; stdout is the reply.
pub struct SubprocessClient {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessClient {
    /// Build from an argv list (`["llm", "--json"]`).
    pub fn from_command(command: &[String], timeout: Duration) -> Result<Self, LlmError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| LlmError::Unavailable("no LLM command configured".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    async fn run(&self, prompt: &str) -> Result<String, LlmError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Unavailable(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| LlmError::InvocationFailed(format!("writing prompt: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LlmError::InvocationFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::InvocationFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl LlmClient for SubprocessClient {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate_structured(&self, prompt: &str) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.run(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }
}

/// Mock client for testing. Replays scripted responses in order.
///
/// When the script runs out, the fallback response (if any) is returned;
/// otherwise calls fail with `Unavailable`.
pub struct MockClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful reply.
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.script.lock().unwrap().push_back(Ok(response.into()));
        self
    }

    /// Queue a failed call.
    pub fn with_failure(self, error: LlmError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    /// Reply returned once the script is exhausted.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_structured(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self.fallback.clone().ok_or_else(|| {
                LlmError::Unavailable("mock client script exhausted".to_string())
            }),
        }
    }
}
