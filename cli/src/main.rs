use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use murmur_core::{
    AppReconciler, AppState, AppUpdate, ChatApp, InMemoryMessageService, Message, MessageId,
    MessageStatus, Sender, SharedMessageService,
};
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const WELCOME: &str = "Welcome to your chat assistant.";

#[derive(Debug, Parser)]
#[command(name = "murmur")]
#[command(about = "Optimistic chat sync against an in-process message service")]
struct Cli {
    /// Data directory (murmur_config.json and murmur.log live here)
    #[arg(long, env = "MURMUR_DATA_DIR", default_value = ".murmur")]
    data_dir: PathBuf,

    /// Conversation to open
    #[arg(long, default_value = "general")]
    conversation: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat with a scripted assistant
    Chat {
        /// Delay before the assistant answers a confirmed message
        #[arg(long, default_value_t = 400)]
        reply_delay_ms: u64,
    },

    /// Send a message through injected failures, retry it, and print the final state
    Demo {
        /// Number of creates the service fails before accepting one
        #[arg(long, default_value_t = 1)]
        failures: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("create data dir {}", cli.data_dir.display()))?;

    let service = InMemoryMessageService::new();
    service.seed(&cli.conversation, WELCOME, Sender::Assistant);
    let shared: SharedMessageService = Arc::new(service.clone());
    let app = ChatApp::new(cli.data_dir.to_string_lossy().to_string(), shared);

    match cli.cmd {
        Command::Chat { reply_delay_ms } => {
            cmd_chat(
                &app,
                service,
                &cli.conversation,
                Duration::from_millis(reply_delay_ms),
            )
            .await
        }
        Command::Demo { failures } => cmd_demo(&app, &service, &cli.conversation, failures).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn print(v: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&v).context("encode output")?);
    Ok(())
}

async fn wait_for(what: &str, mut f: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if f() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {what}")
}

fn marker(status: &MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "…",
        MessageStatus::Confirmed => "✓",
        MessageStatus::Failed { .. } => "✗",
    }
}

fn format_line(n: usize, m: &Message) -> String {
    let mut line = format!(
        "{n:>3} {} {:<10} {} {}",
        m.display_time(),
        m.sender.to_string(),
        marker(&m.status),
        m.text
    );
    if let MessageStatus::Failed { reason } = &m.status {
        line.push_str(&format!("   ({reason}; /retry {n})"));
    }
    line
}

struct Forward(UnboundedSender<AppUpdate>);

impl AppReconciler for Forward {
    fn reconcile(&self, update: AppUpdate) {
        let _ = self.0.send(update);
    }
}

// ── Chat ────────────────────────────────────────────────────────────────────

enum Input {
    Text(String),
    Retry(usize),
    Fail(u32),
    Reject,
    List,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(cmd) = line.strip_prefix('/') else {
        return Some(Input::Text(line.to_string()));
    };
    let mut parts = cmd.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().and_then(|a| a.parse::<u32>().ok());
    Some(match (name, arg) {
        ("retry", Some(n)) => Input::Retry(n as usize),
        ("fail", n) => Input::Fail(n.unwrap_or(1)),
        ("reject", _) => Input::Reject,
        ("list", _) => Input::List,
        ("quit", _) | ("exit", _) => Input::Quit,
        _ => Input::Help,
    })
}

const HELP: &str = "\
  <text>       send a message
  /retry N     retry failed message N
  /fail [N]    make the next N sends fail
  /reject      make the next send come back with status=error
  /list        show the conversation
  /quit        leave";

/// Print changed lines and let the scripted assistant answer confirmed messages.
async fn render_loop(
    mut rx: UnboundedReceiver<AppUpdate>,
    service: InMemoryMessageService,
    conversation: String,
    reply_delay: Duration,
) {
    let mut state = AppState::empty();
    let mut shown: Vec<Message> = vec![];
    let mut answered = HashSet::<String>::new();

    while let Some(update) = rx.recv().await {
        update.apply_to(&mut state);
        if let Some(err) = state.last_error.take() {
            eprintln!("! {err}");
        }

        for (i, m) in state.messages.iter().enumerate() {
            if shown.get(i) != Some(m) {
                println!("{}", format_line(i + 1, m));
            }
        }
        shown = state.messages.clone();

        for m in &state.messages {
            let (MessageId::Server(id), MessageStatus::Confirmed) = (&m.id, &m.status) else {
                continue;
            };
            if m.sender == Sender::Assistant || !answered.insert(id.clone()) {
                continue;
            }
            let service = service.clone();
            let conversation = conversation.clone();
            let reply = format!("You said \"{}\". Noted.", m.text);
            tokio::spawn(async move {
                tokio::time::sleep(reply_delay).await;
                service.post(&conversation, &reply, Sender::Assistant);
            });
        }
    }
}

async fn cmd_chat(
    app: &ChatApp,
    service: InMemoryMessageService,
    conversation: &str,
    reply_delay: Duration,
) -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    app.listen_for_updates(Box::new(Forward(tx)));
    app.open_conversation(conversation);
    let renderer = tokio::spawn(render_loop(
        rx,
        service.clone(),
        conversation.to_string(),
        reply_delay,
    ));
    println!("{HELP}");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        match parse_input(&line) {
            None => {}
            Some(Input::Text(text)) => app.send(text),
            Some(Input::Retry(n)) => match n.checked_sub(1).and_then(|i| app.messages().get(i).cloned()) {
                Some(m) => app.retry(m.id),
                None => eprintln!("! no message {n}"),
            },
            Some(Input::Fail(n)) => service.fail_next_creates(n),
            Some(Input::Reject) => service.reject_next_creates(1),
            Some(Input::List) => {
                for (i, m) in app.messages().iter().enumerate() {
                    println!("{}", format_line(i + 1, m));
                }
            }
            Some(Input::Help) => println!("{HELP}"),
            Some(Input::Quit) => break,
        }
    }

    app.close_conversation();
    renderer.abort();
    Ok(())
}

// ── Demo ────────────────────────────────────────────────────────────────────

fn own_message(state: &AppState) -> Option<Message> {
    state
        .messages
        .iter()
        .find(|m| m.sender != Sender::Assistant)
        .cloned()
}

async fn cmd_demo(
    app: &ChatApp,
    service: &InMemoryMessageService,
    conversation: &str,
    failures: u32,
) -> anyhow::Result<()> {
    app.open_conversation(conversation);
    wait_for("history", || {
        let s = app.state();
        s.conversation_id.is_some() && !s.is_loading
    })
    .await?;

    service.fail_next_creates(failures);
    app.send("hello there");

    let mut attempts = 1;
    loop {
        wait_for("send to settle", || {
            own_message(&app.state()).is_some_and(|m| !m.status.is_pending())
        })
        .await?;
        let Some(m) = own_message(&app.state()) else {
            bail!("sent message disappeared");
        };
        if !m.status.is_failed() {
            break;
        }
        if attempts > failures {
            bail!("still failing after {attempts} attempts");
        }
        attempts += 1;
        app.retry(m.id);
        let expected = attempts;
        wait_for("retry to start", || service.create_calls() >= expected).await?;
    }

    service.post(conversation, "How can I help?", Sender::Assistant);
    wait_for("assistant reply", || app.messages().len() == 3).await?;

    print(json!({
        "conversation": conversation,
        "attempts": attempts,
        "messages": app.messages(),
        "server_records": service.records(conversation).len(),
    }))
}
