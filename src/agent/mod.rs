//! Agent pipeline: orchestrator, policy engine, draft generation, due-case
//! poller, and the interactive chat loop.

pub mod chat;
pub mod draft;
pub mod orchestrator;
pub mod policy;
pub mod poller;

use std::sync::Arc;
use thiserror::Error;

use crate::config::AppConfig;
use crate::extract::PdfTextExtractor;
use crate::extract::llm::{LlmClient, LlmError};
use crate::mail::{MailError, MailProvider};
use crate::store::{Store, StoreError};
use crate::transitions::TransitionError;

/// Everything the agent pipeline needs, constructed once at startup and
/// managed as Rocket state. No process-wide singletons.
#[derive(Clone)]
pub struct AgentContext {
    pub store: Store,
    pub mail: Arc<dyn MailProvider>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub pdf: Arc<dyn PdfTextExtractor>,
    pub config: AppConfig,
}

impl AgentContext {
    pub fn llm_client(&self) -> Option<&dyn LlmClient> {
        self.llm.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("case '{0}' not found")]
    CaseNotFound(String),
    #[error("bad input: {0}")]
    BadInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}
