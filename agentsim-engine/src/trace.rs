// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tool-event tracing for the agent under test
//!
//! Each conversation owns one [`TraceRecorder`]. While the agent is being
//! invoked the recorder is installed as a task-local, so agent code can call
//! [`record`], [`start`] and [`traced`] from anywhere in the same task
//! without threading a context object through. Work spawned onto other tasks
//! does not inherit the recorder; pass it explicitly with
//! [`TraceRecorder::scope`].
//!
//! ```rust,ignore
//! let handle = trace::start("database_query", json!("SELECT * FROM users"), vec![]);
//! let rows = db.query().await;
//! handle.finish(Ok(json!(rows.len())));
//! ```

use agentsim_core::{Rule, ToolEvent, ToolEventStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: TraceRecorder;
}

/// Collects tool events for one conversation
#[derive(Debug, Clone, Default)]
pub struct TraceRecorder {
    events: Arc<Mutex<Vec<ToolEvent>>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tool event; close it with [`TraceHandle::finish`]
    pub fn start(&self, name: &str, input: serde_json::Value, rules: Vec<Rule>) -> TraceHandle {
        let id = Uuid::new_v4();
        self.events.lock().push(ToolEvent {
            id,
            name: name.to_string(),
            input,
            output: None,
            error: None,
            status: ToolEventStatus::Open,
            started_at: Utc::now(),
            finished_at: None,
            rules,
            verdicts: Vec::new(),
        });
        TraceHandle {
            id,
            recorder: Some(self.clone()),
        }
    }

    /// Record a completed call in one step
    pub fn record(
        &self,
        name: &str,
        input: serde_json::Value,
        result: Result<serde_json::Value, String>,
        rules: Vec<Rule>,
    ) {
        self.start(name, input, rules).finish(result);
    }

    fn close(&self, id: Uuid, result: Result<serde_json::Value, String>) {
        let mut events = self.events.lock();
        let Some(event) = events.iter_mut().find(|e| e.id == id) else {
            tracing::warn!(event_id = %id, "tool event finished after its turn was collected");
            return;
        };
        if event.status != ToolEventStatus::Open {
            tracing::warn!(event_id = %id, name = %event.name, "tool event finished twice");
            return;
        }
        event.finished_at = Some(Utc::now());
        match result {
            Ok(output) => {
                event.output = Some(output);
                event.status = ToolEventStatus::Succeeded;
            }
            Err(error) => {
                event.error = Some(error);
                event.status = ToolEventStatus::Failed;
            }
        }
    }

    /// Take every event recorded so far, in start order
    pub fn drain(&self) -> Vec<ToolEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `fut` with this recorder installed as the task-local current one
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        CURRENT.scope(self.clone(), fut).await
    }
}

/// Open tool event. Consumed by `finish`, so it cannot be closed twice or
/// shared between callers.
#[derive(Debug)]
#[must_use = "an unfinished tool event stays open in the trace"]
pub struct TraceHandle {
    id: Uuid,
    recorder: Option<TraceRecorder>,
}

impl TraceHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn finish(self, result: Result<serde_json::Value, String>) {
        if let Some(recorder) = &self.recorder {
            recorder.close(self.id, result);
        }
    }
}

/// Recorder installed for the current task, if any
pub fn current() -> Option<TraceRecorder> {
    CURRENT.try_with(|r| r.clone()).ok()
}

/// Open a tool event on the current recorder. Outside a conversation the
/// returned handle is inert.
pub fn start(name: &str, input: serde_json::Value, rules: Vec<Rule>) -> TraceHandle {
    match current() {
        Some(recorder) => recorder.start(name, input, rules),
        None => TraceHandle {
            id: Uuid::new_v4(),
            recorder: None,
        },
    }
}

/// One-shot event on the current recorder; no-op outside a conversation
pub fn record(
    name: &str,
    input: serde_json::Value,
    result: Result<serde_json::Value, String>,
    rules: Vec<Rule>,
) {
    if let Some(recorder) = current() {
        recorder.record(name, input, result, rules);
    }
}

/// Await `f` inside a tool event capturing its input, output, timing and error
pub async fn traced<F, Fut, T, E>(name: &str, input: serde_json::Value, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: Display,
{
    let handle = start(name, input, Vec::new());
    let result = f().await;
    handle.finish(match &result {
        Ok(value) => Ok(serde_json::to_value(value).unwrap_or(serde_json::Value::Null)),
        Err(e) => Err(e.to_string()),
    });
    result
}

/// Synchronous helper traced as a tool event
pub fn track<T: Serialize>(name: &str, input: serde_json::Value, f: impl FnOnce() -> T) -> T {
    let handle = start(name, input, Vec::new());
    let value = f();
    handle.finish(Ok(
        serde_json::to_value(&value).unwrap_or(serde_json::Value::Null)
    ));
    value
}

/// Step hooks exposed by agent frameworks
pub trait StepCallbacks: Send + Sync {
    fn on_step_start(&self, step_id: &str, name: &str, input: serde_json::Value);

    fn on_step_end(&self, step_id: &str, result: Result<serde_json::Value, String>);
}

/// Forwards framework step hooks into a recorder's start/finish contract
pub struct RecorderCallbacks {
    recorder: TraceRecorder,
    open: Mutex<HashMap<String, TraceHandle>>,
}

impl RecorderCallbacks {
    pub fn new(recorder: TraceRecorder) -> Self {
        Self {
            recorder,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Adapter bound to the current task's recorder
    pub fn for_current() -> Option<Self> {
        current().map(Self::new)
    }
}

impl StepCallbacks for RecorderCallbacks {
    fn on_step_start(&self, step_id: &str, name: &str, input: serde_json::Value) {
        let handle = self.recorder.start(name, input, Vec::new());
        if let Some(stale) = self.open.lock().insert(step_id.to_string(), handle) {
            stale.finish(Err(format!("step {} restarted before it ended", step_id)));
        }
    }

    fn on_step_end(&self, step_id: &str, result: Result<serde_json::Value, String>) {
        match self.open.lock().remove(step_id) {
            Some(handle) => handle.finish(result),
            None => tracing::warn!(step_id, "step ended without a matching start"),
        }
    }
}
