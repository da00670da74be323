//! issue-fixer CLI.
//!
//! Events go to stdout, logs to stderr.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use issue_fixer::cli::{self, Args};
use issue_fixer::sandbox;
use issue_fixer::{
    AgentEvent, AgentReport, AgentRun, AnthropicRuntime, GitHubClient, IssueRef,
    QuestionBroker, Result, Settings, Validate,
};

const PRINTER_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let outcome = run(&args).await;

    if let Err(e) = &outcome {
        tracing::error!(error = %e, "run failed");
        eprintln!("Error: {}", e.user_message());
    }
    std::process::exit(cli::exit_code(&outcome));
}

async fn run(args: &Args) -> Result<AgentReport> {
    let mut settings = Settings::load(args.config.as_deref())?;
    args.apply(&mut settings);

    for warning in settings.validate().into_result()? {
        tracing::warn!("{}", warning);
    }
    let api_key = settings.require_api_key()?.to_string();

    let issue_ref = IssueRef::parse(&args.issue_url)?;
    let github = GitHubClient::new(settings.github_token.clone());
    let (issue, repository) = github.fetch(&issue_ref).await?;
    tracing::info!(
        issue = issue.number,
        repository = %repository.full_name(),
        title = %issue.title,
        "fetched issue"
    );

    let mut runtime = AnthropicRuntime::new(api_key);
    if let Some(base_url) = &settings.anthropic_base_url {
        runtime = runtime.with_base_url(base_url.clone());
    }
    let provider = sandbox::provider_for(&settings.sandbox);

    let (tx, rx) = mpsc::unbounded_channel();
    let run = AgentRun::new(
        Arc::new(runtime),
        provider,
        settings.agent.clone(),
        settings.sandbox.clone(),
    )
    .with_sink(Arc::new(move |event: AgentEvent| {
        let _ = tx.send(event);
    }));

    let mut printer = tokio::spawn(print_events(rx, run.questions(), args.json));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let outcome = run.execute(&issue, &repository, cancel).await;

    // A printer still blocked on stdin for a cancelled question is abandoned.
    match tokio::time::timeout(PRINTER_DRAIN, &mut printer).await {
        Ok(Err(e)) => tracing::warn!(error = %e, "event printer stopped"),
        Ok(Ok(())) => {}
        Err(_) => printer.abort(),
    }
    outcome
}

/// Prints events in order and answers `ask_user` from stdin.
///
/// Returns after the terminal `complete` or `error` event. The broker keeps
/// a sender alive, so the channel alone never closes while it is held.
async fn print_events(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    questions: Option<Arc<QuestionBroker>>,
    json: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    // Fragments were shown for the current message.
    let mut streamed = false;
    // The cursor is mid-line after a fragment.
    let mut open_line = false;

    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, kind = event.kind(), "failed to serialize event"),
            }
        } else if let Some(fragment) = cli::format_fragment(&event) {
            print!("{}", fragment);
            let _ = std::io::stdout().flush();
            streamed = true;
            open_line = true;
        } else {
            if open_line {
                println!();
                open_line = false;
            }
            match &event {
                // Already shown fragment by fragment.
                AgentEvent::Message { .. } if streamed => {}
                AgentEvent::Complete { report } => println!("{}", cli::format_report(report)),
                _ => {
                    if let Some(line) = cli::format_event(&event) {
                        println!("{}", line);
                    }
                }
            }
            if matches!(event, AgentEvent::Message { .. }) {
                streamed = false;
            }
        }

        if matches!(event, AgentEvent::Complete { .. } | AgentEvent::Error { .. }) {
            break;
        }

        if let AgentEvent::AskUser { id, options, .. } = &event {
            if !json {
                print!("> ");
                let _ = std::io::stdout().flush();
            }
            let Some(broker) = &questions else {
                continue;
            };
            let answer = match stdin.next_line().await {
                Ok(Some(line)) => Some(pick_option(line.trim(), options)),
                Ok(None) => {
                    tracing::warn!(question_id = %id, "stdin closed, rejecting question");
                    None
                }
                Err(e) => {
                    tracing::warn!(question_id = %id, error = %e, "failed to read answer, rejecting question");
                    None
                }
            };
            let resolved = match answer {
                Some(answer) => broker.answer(id, answer),
                None => broker.reject(id),
            };
            if !resolved {
                tracing::debug!(question_id = %id, "question no longer pending");
            }
        }
    }
}

/// A 1-based option number selects that option; anything else is free text.
fn pick_option(input: &str, options: &[String]) -> String {
    input
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i))
        .cloned()
        .unwrap_or_else(|| input.to_string())
}
