//! End-to-end runs of the Kubernetes crew against a scripted backend.
//!
//! The backend routes each prompt by the worker named on its first line
//! (`Role: ... (DevAgent)`), replays canned replies per worker and records
//! every prompt it sees.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use kube_crew::agent::{CheckpointDecision, Crew, RunStatus, kubernetes};
use kube_crew::config::{CrewConfig, ProcessMode};
use kube_crew::error::{ErrorKind, LlmError};
use kube_crew::llm::{CompletionBackend, GenerateRequest, GenerateResponse};
use kube_crew::retry::RetryPolicy;
use kube_crew::tools::ToolRegistry;
use kube_crew::worker::TaskStatus;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const QUERY: &str = "Deploy an Nginx app with 2 replicas and a service.";

/// Route key used for manager decisions.
const MANAGER: &str = "Manager";

enum Reply {
    Json(&'static str),
    /// Answers after a short pause, so calls overlap.
    Slow(&'static str),
    Fail(LlmError),
    /// Never answers within the test's lifetime.
    Hang,
}

#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    prompts: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a call as in flight until dropped, including when cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, route: &str, replies: Vec<Reply>) {
        self.script
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .extend(replies);
    }

    fn prompts_for(&self, route: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == route)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

fn route(prompt: &str) -> String {
    if prompt.contains("You are managing the crew") {
        return MANAGER.to_string();
    }
    let first = prompt.lines().next().unwrap_or_default();
    first
        .rsplit_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .unwrap_or(first)
        .to_string()
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let key = route(&request.prompt);
        self.prompts
            .lock()
            .unwrap()
            .push((key.clone(), request.prompt));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        match reply {
            Some(Reply::Json(text)) => Ok(GenerateResponse::text(text)),
            Some(Reply::Slow(text)) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(GenerateResponse::text(text))
            }
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(GenerateResponse::text("{}"))
            }
            None => Ok(GenerateResponse::text(r#"{"summary": "ok"}"#)),
        }
    }
}

fn config(process: ProcessMode, concurrency: usize) -> CrewConfig {
    CrewConfig {
        process,
        max_concurrent_workers: concurrency,
        worker_timeout: Duration::from_secs(120),
        tool_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        kubectl_binary: "echo".to_string(),
        ..CrewConfig::default()
    }
}

fn crew_with(
    backend: &Arc<ScriptedBackend>,
    config: CrewConfig,
    definition: kube_crew::agent::CrewDefinition,
) -> Crew {
    let tools = ToolRegistry::with_builtin_tools(&config).unwrap();
    Crew::new(definition, config, backend.clone(), Arc::new(tools)).unwrap()
}

fn crew(backend: &Arc<ScriptedBackend>, process: ProcessMode, concurrency: usize) -> Crew {
    crew_with(backend, config(process, concurrency), kubernetes::definition())
}

/// The built-in crew with a human checkpoint on `dev_task`.
fn checkpointed_dev_definition() -> kube_crew::agent::CrewDefinition {
    let mut definition = kubernetes::definition();
    for task in &mut definition.tasks {
        if task.id == "dev_task" {
            task.requires_checkpoint = true;
        }
    }
    definition
}

#[tokio::test]
async fn runs_exactly_the_classified_tasks() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent", "SecAgent"]"#)]);
    backend.script(
        "DevAgent",
        vec![Reply::Json(
            r#"{"yaml": "kind: Deployment", "validation": "YAML is valid.", "summary": "nginx x2"}"#,
        )],
    );
    backend.script("SecAgent", vec![Reply::Json(r#"{"review": "add limits"}"#)]);

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.selected_workers, vec!["DevAgent", "SecAgent"]);
    let ids: Vec<_> = result.results.keys().cloned().collect();
    assert_eq!(ids, vec!["dev_task", "sec_task"]);
    assert!(result.results.values().all(|r| r.status == TaskStatus::Succeeded));
    assert_eq!(result.classifier.status, TaskStatus::Succeeded);

    assert!(backend.prompts_for("OpsAgent").is_empty());
    assert!(backend.prompts_for("AdminAgent").is_empty());

    // The security review sees the developer's output.
    let sec_prompt = &backend.prompts_for("SecAgent")[0];
    assert!(sec_prompt.contains("\"dependencies\":{\"dev_task\""));
    assert!(sec_prompt.contains("nginx x2"));

    assert_eq!(result.context["user_input"], QUERY);
    let seqs: Vec<_> = result.events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..result.events.len() as u64).collect::<Vec<_>>());
    assert_eq!(result.events[0].task_id, "classify_task");
    assert_eq!(result.context["dev_task"]["summary"], "nginx x2");
}

#[tokio::test]
async fn unknown_workers_are_dropped_not_run() {
    let backend = ScriptedBackend::new();
    backend.script(
        "ClassifierAgent",
        vec![Reply::Json(r#"{"agents": ["DevAgent", "HelmAgent"]}"#)],
    );

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.selected_workers, vec!["DevAgent"]);
    assert_eq!(result.dropped_workers, vec!["HelmAgent"]);
    assert_eq!(result.results.len(), 1);
    assert!(result.results.contains_key("dev_task"));
}

#[tokio::test]
async fn malformed_classification_aborts_the_run() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json("I think DevAgent should do it")]);

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::RunAborted);
    assert_eq!(result.abort.as_ref().unwrap().kind, ErrorKind::ClassificationFailed);
    assert_eq!(result.classifier.status, TaskStatus::Failed);
    assert!(result.results.is_empty());
    assert!(backend.prompts_for("DevAgent").is_empty());
}

#[tokio::test]
async fn classification_with_no_known_worker_aborts() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["HelmAgent"]"#)]);

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::RunAborted);
    let error = result.classifier.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ClassificationFailed);
    assert_eq!(result.failures()[0].0, "classify_task");
}

#[tokio::test]
async fn rejected_checkpoint_reruns_with_feedback() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent"]"#)]);
    backend.script(
        "DevAgent",
        vec![
            Reply::Json(r#"{"yaml": "kind: Deployment"}"#),
            Reply::Json(r#"{"yaml": "kind: Deployment\nresources: {}"}"#),
        ],
    );

    let crew = crew_with(
        &backend,
        config(ProcessMode::Sequential, 1),
        checkpointed_dev_definition(),
    );

    let gate = Arc::clone(crew.checkpoints());
    let mut requests = gate.subscribe();
    let reviewer = tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            let decision = if request.task_id == "dev_task" && request.round == 1 {
                CheckpointDecision::Reject {
                    feedback: "add resource limits".to_string(),
                }
            } else {
                CheckpointDecision::Approve { feedback: None }
            };
            gate.resolve(request.id, decision).await.unwrap();
        }
    });

    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();
    reviewer.abort();

    assert_eq!(result.status, RunStatus::Success);
    let dev = &result.results["dev_task"];
    assert_eq!(dev.status, TaskStatus::Succeeded);
    assert_eq!(dev.attempts, 2);
    assert!(dev.transitions.iter().any(|t| {
        t.from == TaskStatus::AwaitingCheckpoint && t.to == TaskStatus::Pending
    }));

    let prompts = backend.prompts_for("DevAgent");
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("add resource limits"));
    assert!(prompts[1].contains("\"feedback\":[\"add resource limits\"]"));
    assert_eq!(result.context["feedback:dev_task"][0], "add resource limits");
}

#[tokio::test]
async fn cancellation_keeps_committed_context() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent", "OpsAgent"]"#)]);
    backend.script("DevAgent", vec![Reply::Json(r#"{"yaml": "kind: Service"}"#)]);
    backend.script("OpsAgent", vec![Reply::Hang]);

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let cancel = CancellationToken::new();
    {
        let backend = Arc::clone(&backend);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while backend.prompts_for("OpsAgent").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        });
    }

    let result = timeout(TEST_TIMEOUT, crew.run_with_cancel(QUERY, cancel))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::RunCancelled);
    assert_eq!(result.results["dev_task"].status, TaskStatus::Succeeded);
    let ops = &result.results["ops_task"];
    assert_eq!(ops.status, TaskStatus::Cancelled);
    assert_eq!(ops.error.as_ref().unwrap().kind, ErrorKind::RunCancelled);
    assert_eq!(result.context["dev_task"]["yaml"], "kind: Service");
    assert!(result.context.get("ops_task").is_none());
}

#[tokio::test]
async fn cancelling_during_checkpoint_withdraws_the_request() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent", "OpsAgent"]"#)]);
    backend.script("DevAgent", vec![Reply::Json(r#"{"yaml": "kind: Deployment"}"#)]);

    let crew = crew_with(
        &backend,
        config(ProcessMode::Sequential, 1),
        checkpointed_dev_definition(),
    );
    let cancel = CancellationToken::new();
    let gate = Arc::clone(crew.checkpoints());
    let mut requests = gate.subscribe();
    let reviewer = {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                if request.task_id == "dev_task" {
                    // Walk away from the review instead of answering.
                    cancel.cancel();
                } else {
                    gate.approve(request.id).await.unwrap();
                }
            }
        })
    };

    let result = timeout(TEST_TIMEOUT, crew.run_with_cancel(QUERY, cancel))
        .await
        .unwrap();
    reviewer.abort();

    assert_eq!(result.status, RunStatus::RunCancelled);
    let dev = &result.results["dev_task"];
    assert_eq!(dev.status, TaskStatus::Cancelled);
    assert_eq!(dev.error.as_ref().unwrap().kind, ErrorKind::RunCancelled);
    assert!(
        dev.transitions
            .iter()
            .any(|t| t.to == TaskStatus::AwaitingCheckpoint)
    );
    assert_eq!(result.results["ops_task"].status, TaskStatus::Cancelled);
    assert!(result.context.get("dev_task").is_none());
    assert!(gate.pending().await.is_empty());
}

#[tokio::test]
async fn in_flight_workers_never_exceed_the_limit() {
    let backend = ScriptedBackend::new();
    backend.script(
        "ClassifierAgent",
        vec![Reply::Json(r#"["DevAgent", "SecAgent", "OpsAgent", "AdminAgent"]"#)],
    );
    for worker in ["DevAgent", "SecAgent", "OpsAgent", "AdminAgent"] {
        backend.script(worker, vec![Reply::Slow(r#"{"summary": "done"}"#)]);
    }

    let crew = crew(&backend, ProcessMode::Sequential, 2);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.results.len(), 4);
    // dev_task and ops_task are ready together and overlap.
    assert_eq!(backend.peak_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dependents_start_only_after_dependencies_succeed() {
    let backend = ScriptedBackend::new();
    backend.script(
        "ClassifierAgent",
        vec![Reply::Json(r#"["AdminAgent", "OpsAgent", "SecAgent", "DevAgent"]"#)],
    );

    let crew = crew(&backend, ProcessMode::Sequential, 4);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.results.len(), 4);

    let dev = &result.results["dev_task"];
    let sec = &result.results["sec_task"];
    let dev_done = dev
        .transitions
        .iter()
        .find(|t| t.to == TaskStatus::Succeeded)
        .unwrap()
        .timestamp;
    let sec_started = sec
        .transitions
        .iter()
        .find(|t| t.to == TaskStatus::Running)
        .unwrap()
        .timestamp;
    assert!(sec_started >= dev_done);
}

#[tokio::test]
async fn load_bearing_failure_aborts() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent", "SecAgent"]"#)]);
    backend.script("DevAgent", vec![Reply::Json("not json")]);

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::RunAborted);
    assert_eq!(result.abort.as_ref().unwrap().kind, ErrorKind::RunAborted);
    let dev = &result.results["dev_task"];
    assert_eq!(dev.status, TaskStatus::Failed);
    assert_eq!(dev.error.as_ref().unwrap().kind, ErrorKind::MalformedOutput);
    let sec = &result.results["sec_task"];
    assert_eq!(sec.status, TaskStatus::Cancelled);
    assert_eq!(sec.error.as_ref().unwrap().kind, ErrorKind::RunAborted);
    assert!(backend.prompts_for("SecAgent").is_empty());
}

#[tokio::test]
async fn independent_failure_is_partial() {
    let backend = ScriptedBackend::new();
    backend.script(
        "ClassifierAgent",
        vec![Reply::Json(r#"["DevAgent", "SecAgent", "OpsAgent"]"#)],
    );
    backend.script(
        "DevAgent",
        vec![Reply::Fail(LlmError::InvalidResponse {
            provider: "scripted".into(),
            reason: "truncated envelope".into(),
        })],
    );

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::PartialFailure);
    assert_eq!(result.results["dev_task"].status, TaskStatus::Failed);
    let sec = &result.results["sec_task"];
    assert_eq!(sec.status, TaskStatus::Failed);
    assert_eq!(sec.error.as_ref().unwrap().kind, ErrorKind::DependencyFailed);
    assert_eq!(result.results["ops_task"].status, TaskStatus::Succeeded);

    let failed: Vec<_> = result.failures().into_iter().map(|(id, _)| id).collect();
    assert_eq!(failed, vec!["dev_task", "sec_task"]);
}

#[tokio::test]
async fn backend_outage_is_reported_per_task() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["OpsAgent", "AdminAgent"]"#)]);
    backend.script(
        "OpsAgent",
        vec![Reply::Fail(LlmError::HttpStatus {
            provider: "scripted".into(),
            status: 503,
            body: "loading model".into(),
        })],
    );

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::PartialFailure);
    let ops = &result.results["ops_task"];
    assert_eq!(ops.error.as_ref().unwrap().kind, ErrorKind::BackendUnavailable);
    assert!(ops.error.as_ref().unwrap().message.contains("503"));
    assert_eq!(result.results["admin_task"].status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn manager_delegation_is_validated() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent"]"#)]);
    backend.script(
        MANAGER,
        vec![
            Reply::Json(
                r#"{"command": "delegate_task", "task": {"description": "package a chart", "worker": "HelmAgent"}}"#,
            ),
            Reply::Json(
                r#"{"command": "delegate_task", "task": {"id": "netpol_task", "description": "write a network policy", "worker": "SecAgent", "depends_on": ["dev_task"]}}"#,
            ),
            Reply::Json(r#"{"command": "run_task", "task_id": "netpol_task"}"#),
            Reply::Json(r#"{"command": "run_task", "task_id": "dev_task"}"#),
        ],
    );

    let crew = crew(&backend, ProcessMode::Hierarchical, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.rejected_delegations.len(), 1);
    let rejected = &result.rejected_delegations[0];
    assert_eq!(rejected.worker, "HelmAgent");
    assert_eq!(rejected.error.kind, ErrorKind::UnknownDelegate);

    assert_eq!(result.results.len(), 2);
    let dev = &result.results["dev_task"];
    let netpol = &result.results["netpol_task"];
    assert_eq!(netpol.worker, "SecAgent");
    assert_eq!(netpol.status, TaskStatus::Succeeded);
    // netpol_task was not ready when first chosen, so dev_task ran first.
    assert!(netpol.started_at.unwrap() >= dev.finished_at.unwrap());
}

#[tokio::test]
async fn delegation_cannot_reuse_the_classifier_task_id() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent"]"#)]);
    backend.script(
        MANAGER,
        vec![Reply::Json(
            r#"{"command": "delegate_task", "task": {"id": "classify_task", "description": "review", "worker": "SecAgent"}}"#,
        )],
    );

    let crew = crew(&backend, ProcessMode::Hierarchical, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.rejected_delegations.len(), 1);
    let rejected = &result.rejected_delegations[0];
    assert_eq!(rejected.task_id.as_deref(), Some("classify_task"));
    assert_eq!(rejected.worker, "SecAgent");
    assert_eq!(rejected.error.kind, ErrorKind::UnknownDelegate);

    let ids: Vec<_> = result.results.keys().cloned().collect();
    assert_eq!(ids, vec!["dev_task"]);
    assert_eq!(result.classifier.worker, "ClassifierAgent");
    assert!(backend.prompts_for("SecAgent").is_empty());
}

#[tokio::test]
async fn unusable_manager_replies_fall_back_to_declared_order() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["SecAgent", "DevAgent"]"#)]);
    backend.script(MANAGER, vec![Reply::Json(r#"{"command": "reboot"}"#)]);

    let crew = crew(&backend, ProcessMode::Hierarchical, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert!(result.results.values().all(|r| r.status == TaskStatus::Succeeded));
    assert!(!backend.prompts_for(MANAGER).is_empty());

    let order: Vec<_> = backend
        .prompts
        .lock()
        .unwrap()
        .iter()
        .map(|(route, _)| route.clone())
        .filter(|route| route == "DevAgent" || route == "SecAgent")
        .collect();
    assert_eq!(order, vec!["DevAgent", "SecAgent"]);
}

#[tokio::test]
async fn worker_tool_calls_reach_the_validator() {
    let backend = ScriptedBackend::new();
    backend.script("ClassifierAgent", vec![Reply::Json(r#"["DevAgent"]"#)]);
    backend.script(
        "DevAgent",
        vec![
            Reply::Json(
                r#"{"tool_calls": [{"name": "yaml_validator", "arguments": {"yaml_content": "spec:\n  replicas: 2\n    selector: nginx\n"}}]}"#,
            ),
            Reply::Json(r#"{"yaml": "fixed", "validation": "fixed indentation"}"#),
        ],
    );

    let crew = crew(&backend, ProcessMode::Sequential, 1);
    let result = timeout(TEST_TIMEOUT, crew.run(QUERY)).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    let prompts = backend.prompts_for("DevAgent");
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("\"valid\":false"));
    assert_eq!(result.context["dev_task"]["validation"], "fixed indentation");
}
