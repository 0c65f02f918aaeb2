//! Fan-out / fan-in and parallel execution.
//!
//! Both patterns invoke several services under one group cid on a pattern
//! channel. Every invocation reports its outcome to the [`PatternRegistry`],
//! success or failure, and the registry runs the group's callbacks: once for
//! the whole group with fan-out, once per completion with parallel execution.

use std::sync::Arc;

use busline_core::{new_cid, ChannelType, Payload};
use dashmap::DashMap;
use serde_json::{json, Map, Value};

use super::error::InvocationError;
use super::invoker::{InvokeOptions, Invoker};
use super::runtime::RuntimeContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    FanOut,
    ParallelExec,
}

impl PatternKind {
    fn channel(self) -> ChannelType {
        match self {
            Self::FanOut => ChannelType::FanoutCall,
            Self::ParallelExec => ChannelType::ParallelExecCall,
        }
    }
}

/// Outcome of one invocation inside a pattern group.
#[derive(Debug, Clone)]
pub struct PatternCompletion {
    pub group_cid: String,
    pub service: String,
    /// The response payload, or the error text.
    pub outcome: Result<Payload, String>,
}

impl PatternCompletion {
    fn to_value(&self) -> Value {
        match &self.outcome {
            Ok(payload) => json!({"ok": true, "response": payload.to_json_value()}),
            Err(message) => json!({"ok": false, "error": message}),
        }
    }
}

#[derive(Debug)]
struct Group {
    kind: PatternKind,
    pending: usize,
    results: Map<String, Value>,
    callbacks: Vec<String>,
}

/// Open pattern groups keyed by group cid.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    groups: DashMap<String, Group>,
}

impl PatternRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, group_cid: &str, kind: PatternKind, expected: usize, callbacks: Vec<String>) {
        self.groups.insert(
            group_cid.to_string(),
            Group {
                kind,
                pending: expected,
                results: Map::new(),
                callbacks,
            },
        );
    }

    /// Number of invocations still outstanding in a group.
    #[must_use]
    pub fn pending(&self, group_cid: &str) -> Option<usize> {
        self.groups.get(group_cid).map(|g| g.pending)
    }

    /// Records a completion and runs whatever callbacks it releases.
    pub async fn on_call_finished(&self, runtime: Arc<RuntimeContext>, completion: PatternCompletion) {
        let value = completion.to_value();

        // Decide under the map guard; invoke after releasing it.
        let release = {
            let Some(mut group) = self.groups.get_mut(&completion.group_cid) else {
                tracing::warn!(
                    group_cid = %completion.group_cid,
                    service = %completion.service,
                    "completion for unknown pattern group"
                );
                return;
            };
            group.pending = group.pending.saturating_sub(1);
            match group.kind {
                PatternKind::FanOut => {
                    group.results.insert(completion.service.clone(), value);
                    (group.pending == 0)
                        .then(|| (group.callbacks.clone(), Value::Object(group.results.clone())))
                }
                PatternKind::ParallelExec => {
                    let mut single = Map::new();
                    single.insert(completion.service.clone(), value);
                    Some((group.callbacks.clone(), Value::Object(single)))
                }
            }
        };
        self.groups
            .remove_if(&completion.group_cid, |_, g| g.pending == 0);

        let Some((callbacks, payload)) = release else {
            return;
        };
        let invoker = Invoker::new(runtime);
        for callback in callbacks {
            let opts = InvokeOptions::new(payload.clone())
                .cid(new_cid())
                .in_reply_to(completion.group_cid.clone());
            if let Err(err) = invoker.invoke(&callback, opts).await {
                tracing::error!(
                    group_cid = %completion.group_cid,
                    callback = %callback,
                    error = %err,
                    "pattern callback failed"
                );
            }
        }
    }
}

/// Starts a pattern group: one invocation per target, all detached.
fn start(
    invoker: &Invoker,
    kind: PatternKind,
    targets: Vec<(String, Payload)>,
    callbacks: Vec<String>,
) -> Result<String, InvocationError> {
    if targets.is_empty() {
        return Err(InvocationError::Configuration(
            "pattern call needs at least one target".to_string(),
        ));
    }
    let group_cid = new_cid();
    invoker
        .runtime()
        .patterns
        .open(&group_cid, kind, targets.len(), callbacks);

    for (name, payload) in targets {
        let opts = InvokeOptions::new(payload)
            .channel(kind.channel())
            .cid(new_cid())
            .in_reply_to(group_cid.clone());
        let call = invoker.invoke(&name, opts);
        tokio::spawn(async move {
            // Outcome is reported to the registry by the invoker.
            let _ = call.await;
        });
    }
    Ok(group_cid)
}

/// Invokes every target and, once all have completed, calls each callback
/// with a mapping of service name to outcome.
#[derive(Debug, Clone)]
pub struct FanOut {
    invoker: Invoker,
}

impl FanOut {
    #[must_use]
    pub fn new(invoker: Invoker) -> Self {
        Self { invoker }
    }

    /// Returns the group cid.
    ///
    /// # Errors
    ///
    /// Fails if `targets` is empty.
    pub fn invoke(
        &self,
        targets: Vec<(String, Payload)>,
        callbacks: Vec<String>,
    ) -> Result<String, InvocationError> {
        start(&self.invoker, PatternKind::FanOut, targets, callbacks)
    }
}

/// Invokes every target and calls each callback once per completion.
#[derive(Debug, Clone)]
pub struct ParallelExec {
    invoker: Invoker,
}

impl ParallelExec {
    #[must_use]
    pub fn new(invoker: Invoker) -> Self {
        Self { invoker }
    }

    /// Returns the group cid.
    ///
    /// # Errors
    ///
    /// Fails if `targets` is empty.
    pub fn invoke(
        &self,
        targets: Vec<(String, Payload)>,
        callbacks: Vec<String>,
    ) -> Result<String, InvocationError> {
        start(&self.invoker, PatternKind::ParallelExec, targets, callbacks)
    }
}
