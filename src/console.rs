//! Line-oriented terminal host.
//!
//! Plain lines are sent as chat messages. Slash commands drive the session
//! and the tracker:
//!
//! | command          | effect                                      |
//! |------------------|---------------------------------------------|
//! | `/end`           | end the session                             |
//! | `/retry`         | leave the error state                       |
//! | `/hide`, `/show` | report host visibility to the tracker       |
//! | `/click <url>`   | record a link click                         |
//! | `/form <name>`   | record a form submission                    |
//! | `/history`       | list recently persisted sessions            |
//! | `/quit`          | end the session and exit                    |

use std::io::{self, Write};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::activity::ActivityBatcher;
use crate::bus::{SessionEventType, TOPIC_SESSION_EVENTS};
use crate::chat::{ChatError, ChatSnapshot, ChatState, SendOutcome, SessionProtocolClient};
use crate::db::{queries, Database};
use crate::host::{acquire_render_target, RenderTargetLocator};
use crate::retry::RetryPolicy;
use crate::AppError;

const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    End,
    Retry,
    Visibility { hidden: bool },
    LinkClick(String),
    FormSubmit(String),
    History,
    Quit,
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("end", _) => Self::End,
            ("retry", _) => Self::Retry,
            ("hide", _) => Self::Visibility { hidden: true },
            ("show", _) => Self::Visibility { hidden: false },
            ("click", url) if !url.is_empty() => Self::LinkClick(url.to_string()),
            ("form", form) if !form.is_empty() => Self::FormSubmit(form.to_string()),
            ("history", _) => Self::History,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Standard output as the render target.
pub struct TerminalLocator;

impl RenderTargetLocator for TerminalLocator {
    type Target = io::Stdout;

    fn locate(&self) -> Option<Self::Target> {
        Some(io::stdout())
    }
}

/// Tracks what has already been written so each snapshot only prints what is new.
#[derive(Debug, Default)]
pub struct TranscriptView {
    session_id: String,
    printed: usize,
    state: Option<ChatState>,
    typing: bool,
}

impl TranscriptView {
    pub fn render(&mut self, snapshot: &ChatSnapshot, out: &mut impl Write) -> io::Result<()> {
        if snapshot.session_id != self.session_id {
            self.session_id = snapshot.session_id.clone();
            self.printed = 0;
        }
        if self.state != Some(snapshot.state) {
            self.state = Some(snapshot.state);
            writeln!(out, "-- {} --", snapshot.state)?;
            if snapshot.state == ChatState::Error {
                if let Some(error) = &snapshot.last_error {
                    writeln!(out, "!! {error} (type /retry)")?;
                }
            }
        }
        for entry in snapshot.transcript.iter().skip(self.printed) {
            writeln!(out, "{}: {}", entry.role.as_str(), entry.text)?;
        }
        self.printed = snapshot.transcript.len();

        if snapshot.is_typing && !self.typing {
            writeln!(out, "...")?;
        }
        self.typing = snapshot.is_typing;
        out.flush()
    }
}

async fn render_loop(
    client: SessionProtocolClient,
    mut out: impl Write,
    mut changes: watch::Receiver<u64>,
) {
    let mut view = TranscriptView::default();
    loop {
        changes.borrow_and_update();
        if let Err(e) = view.render(&client.snapshot(), &mut out) {
            tracing::warn!("failed to render transcript: {e}");
            return;
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Input loop
// ---------------------------------------------------------------------------

pub async fn run(
    client: SessionProtocolClient,
    batcher: ActivityBatcher,
    db: Arc<Database>,
) -> Result<(), AppError> {
    let target = acquire_render_target(&TerminalLocator, &RetryPolicy::default()).await?;
    let renderer = tokio::spawn(render_loop(client.clone(), target, client.changes()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Send(text) => {
                let client = client.clone();
                tokio::spawn(async move {
                    match client.send_message(&text).await {
                        Ok(SendOutcome::Suppressed) => eprintln!("(still connecting, message not sent)"),
                        Ok(_) => {}
                        Err(e) => match send_failure_hint(&e) {
                            Some(hint) => eprintln!("{hint}"),
                            None => tracing::debug!("send failed: {e}"),
                        },
                    }
                });
            }
            Command::End => client.end_session(),
            Command::Retry => client.retry(),
            Command::Visibility { hidden } => batcher.on_visibility_change(hidden),
            Command::LinkClick(url) => {
                emit_interaction(&client, SessionEventType::LinkClick, json!({ "url": url }));
            }
            Command::FormSubmit(form) => {
                emit_interaction(&client, SessionEventType::FormSubmit, json!({ "form": form }));
            }
            Command::History => print_history(&db)?,
            Command::Quit => break,
            Command::Unknown(input) => eprintln!("unknown command: {input}"),
        }
    }

    client.shutdown();
    batcher.teardown();
    renderer.abort();
    tracing::info!("console closed");
    Ok(())
}

/// Retriable failures are already shown by the view; the rest need the
/// settings fixed before `/retry` can help.
fn send_failure_hint(error: &ChatError) -> Option<String> {
    (!error.is_retriable()).then(|| format!("!! {error} (fix the CHATWIRE_* settings and restart)"))
}

fn emit_interaction(client: &SessionProtocolClient, kind: SessionEventType, data: serde_json::Value) {
    if client.state() != ChatState::Active {
        eprintln!("(no active session)");
        return;
    }
    client
        .bus()
        .emit(TOPIC_SESSION_EVENTS, client.session_id(), kind, data);
}

fn print_history(db: &Database) -> Result<(), AppError> {
    let rows = queries::list_session_activity(db, HISTORY_LIMIT)?;
    if rows.is_empty() {
        println!("no recorded sessions");
    }
    for row in rows {
        println!(
            "{}  {:<14} events={} messages={} updated={}",
            row.session_id, row.event_type, row.event_count, row.message_count, row.updated_at
        );
    }
    Ok(())
}
