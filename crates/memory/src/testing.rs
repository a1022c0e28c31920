//! Deterministic oracle for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use awareness_llm::{OracleRequest, OracleTask, ReasoningOracle};

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(String),
}

#[derive(Debug, Default)]
pub struct CallCounts {
    classify: AtomicUsize,
    synthesize: AtomicUsize,
}

impl CallCounts {
    pub fn classify(&self) -> usize {
        self.classify.load(Ordering::SeqCst)
    }

    pub fn synthesize(&self) -> usize {
        self.synthesize.load(Ordering::SeqCst)
    }
}

/// Scripted replies per task.  Queued replies are served in order; the last
/// one repeats once the queue is down to a single entry.  An empty script
/// answers with an error.
#[derive(Default)]
pub struct StubOracle {
    classify: Mutex<VecDeque<Reply>>,
    synthesize: Mutex<VecDeque<Reply>>,
    delays: HashMap<OracleTask, Duration>,
    calls: Arc<CallCounts>,
    prompts: Mutex<Vec<String>>,
}

impl StubOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classify(self, reply: impl Into<String>) -> Self {
        self.push(OracleTask::Classify, Reply::Text(reply.into()))
    }

    pub fn with_classify_error(self, message: impl Into<String>) -> Self {
        self.push(OracleTask::Classify, Reply::Error(message.into()))
    }

    pub fn with_synthesize(self, reply: impl Into<String>) -> Self {
        self.push(OracleTask::Synthesize, Reply::Text(reply.into()))
    }

    pub fn with_synthesize_error(self, message: impl Into<String>) -> Self {
        self.push(OracleTask::Synthesize, Reply::Error(message.into()))
    }

    /// Delay every call for `task`.
    pub fn with_delay(mut self, task: OracleTask, delay: Duration) -> Self {
        self.delays.insert(task, delay);
        self
    }

    pub fn calls(&self) -> Arc<CallCounts> {
        self.calls.clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    fn push(self, task: OracleTask, reply: Reply) -> Self {
        self.queue(task).lock().unwrap().push_back(reply);
        self
    }

    fn queue(&self, task: OracleTask) -> &Mutex<VecDeque<Reply>> {
        match task {
            OracleTask::Classify => &self.classify,
            OracleTask::Synthesize => &self.synthesize,
        }
    }
}

#[async_trait]
impl ReasoningOracle for StubOracle {
    async fn complete(&self, request: &OracleRequest) -> Result<String> {
        match request.task {
            OracleTask::Classify => self.calls.classify.fetch_add(1, Ordering::SeqCst),
            OracleTask::Synthesize => self.calls.synthesize.fetch_add(1, Ordering::SeqCst),
        };
        self.prompts.lock().unwrap().push(request.prompt.clone());

        if let Some(delay) = self.delays.get(&request.task) {
            tokio::time::sleep(*delay).await;
        }

        let reply = {
            let mut queue = self.queue(request.task).lock().unwrap();
            if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
        };
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Error(message)) => bail!("{message}"),
            None => bail!("stub oracle has no scripted reply"),
        }
    }
}

/// A six-axis classification reply with every axis at `value`.
pub fn uniform_axes_reply(value: f32) -> String {
    let body: Vec<String> = crate::axis::Axis::ALL
        .iter()
        .map(|a| format!("\"{}\": {value}", a.key()))
        .collect();
    format!("{{\"input_axes\": {{{}}}}}", body.join(", "))
}

/// A well-formed synthesis reply nudging `analysis_overview`.
pub fn insight_reply() -> String {
    serde_json::json!({
        "corrective": [
            {"text": "Zoom out sooner when the user asks for direction", "axis": "analysis_overview", "shift": 1.0}
        ],
        "reinforcing": [
            {"text": "Gentle tone keeps the user engaged", "axis": "empathy_responsibility", "shift": -0.5}
        ],
        "emergent": ["The user plans in the evening"]
    })
    .to_string()
}
