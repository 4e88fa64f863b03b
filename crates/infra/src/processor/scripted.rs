//! Processor double driven by a script of outcomes.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{ProcessRequest, Processor, ProcessorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Accept,
    /// Reply `accepted = false`.
    Reject,
    /// Fail as if the service were down.
    Unreachable,
    /// Never reply; only a caller-side timeout ends the call.
    Hang,
}

/// Replays scripted outcomes in order, then `fallback` forever. Every call
/// is recorded.
#[derive(Debug)]
pub struct ScriptedProcessor {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    calls: Mutex<Vec<ProcessRequest>>,
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::accepting()
    }
}

impl ScriptedProcessor {
    pub fn new(script: impl IntoIterator<Item = ScriptedOutcome>, fallback: ScriptedOutcome) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new([], ScriptedOutcome::Accept)
    }

    /// Fail `failures` times, then accept.
    pub fn failing_then_accepting(failures: usize) -> Self {
        Self::new(
            std::iter::repeat_n(ScriptedOutcome::Unreachable, failures),
            ScriptedOutcome::Accept,
        )
    }

    pub fn calls(&self) -> Vec<ProcessRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<bool, ProcessorError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let outcome = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback);

        match outcome {
            ScriptedOutcome::Accept => Ok(true),
            ScriptedOutcome::Reject => Ok(false),
            ScriptedOutcome::Unreachable => {
                Err(ProcessorError::Unreachable("scripted outage".to_string()))
            }
            ScriptedOutcome::Hang => std::future::pending().await,
        }
    }
}
