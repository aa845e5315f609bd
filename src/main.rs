use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use kube_crew::agent::{CheckpointDecision, CheckpointGate, Crew};
use kube_crew::config::CrewConfig;
use kube_crew::llm::OllamaBackend;

const DEFAULT_QUERY: &str = "Deploy an Nginx app with 2 replicas and a service.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let config = CrewConfig::from_env()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let query = if args.is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        args.join(" ")
    };

    eprintln!("☸️  Kube Crew v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Backend: {}", config.base_url);
    eprintln!("   Process: {:?}", config.process);
    eprintln!("   Query: {}", query);
    eprintln!("   Press Ctrl-C to cancel.\n");

    if let Err(e) = OllamaBackend::new(config.base_url.clone()).health_check().await {
        tracing::warn!(error = %e, "Completion backend is not reachable, continuing anyway");
    }

    let crew = Crew::kubernetes(config)?;
    let reviewer = spawn_reviewer(Arc::clone(crew.checkpoints()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling run...");
                cancel.cancel();
            }
        });
    }

    let result = crew.run_with_cancel(&query, cancel).await;
    reviewer.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);

    eprintln!("\n🚀 Run {} finished: {}", result.run_id, result.status);
    if !result.selected_workers.is_empty() {
        eprintln!("   Workers: {}", result.selected_workers.join(", "));
    }
    if !result.dropped_workers.is_empty() {
        eprintln!("   Dropped: {}", result.dropped_workers.join(", "));
    }
    for (id, task) in &result.results {
        eprintln!("   {id}: {}", task.status);
    }
    for (id, error) in result.failures() {
        eprintln!("   ✗ {id}: {error}");
    }
    for rejected in &result.rejected_delegations {
        eprintln!("   ✗ delegation to {}: {}", rejected.worker, rejected.error);
    }

    Ok(())
}

/// Console logging on stderr, plus a daily rolling file when `CREW_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("CREW_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kube-crew.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

/// Review checkpoints on stdin: `y` (or an empty line) approves, any other
/// text is sent back as rejection feedback. Closed stdin approves.
fn spawn_reviewer(gate: Arc<CheckpointGate>) -> tokio::task::JoinHandle<()> {
    let mut requests = gate.subscribe();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let request = match requests.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Checkpoint reviewer lagged behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            eprintln!(
                "\n── Checkpoint: {} ({}), round {}",
                request.task_id, request.worker, request.round
            );
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&request.payload).unwrap_or_default()
            );
            eprintln!("Approve? [y] or type feedback:");

            let answer = match lines.next_line().await {
                Ok(Some(line)) => line.trim().to_string(),
                _ => String::new(),
            };
            let decision = if answer.is_empty() || answer.eq_ignore_ascii_case("y") {
                CheckpointDecision::Approve { feedback: None }
            } else {
                CheckpointDecision::Reject { feedback: answer }
            };

            if let Err(e) = gate.resolve(request.id, decision).await {
                tracing::warn!(error = %e, "Could not deliver checkpoint decision");
            }
        }
    })
}
