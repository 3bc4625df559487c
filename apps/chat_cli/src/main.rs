use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use chat_client::{
    load_settings, AuthSession, ChatClient, ClientEvent, DeliveryState, LocalId, Message,
    MessageKey, SessionStore,
};
use clap::Parser;
use shared::domain::{ChatId, MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for a single chat")]
struct Args {
    /// REST base of the chat server; overrides the config file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "You")]
    username: String,
    #[arg(long, conflicts_with = "with_user", required_unless_present = "with_user")]
    chat_id: Option<String>,
    /// Open the direct chat with this user instead of a chat id.
    #[arg(long)]
    with_user: Option<String>,
}

fn render(message: &Message) -> String {
    let marker = match message.delivery_state {
        DeliveryState::Pending => " (sending)",
        DeliveryState::Confirmed => "",
        DeliveryState::Failed => " (failed)",
    };
    format!(
        "[{}] {}: {}{marker}",
        message.created_at.format("%H:%M"),
        message.sender_name,
        message.content
    )
}

/// Tracks what has been printed so each message appears once.
#[derive(Default)]
struct Transcript {
    shown: HashSet<MessageKey>,
    /// Server ids of our sends, mapped to the local id they were printed under.
    promoted: HashMap<MessageId, LocalId>,
}

impl Transcript {
    fn confirmed(&mut self, local_id: LocalId, message_id: MessageId) {
        self.promoted.insert(message_id, local_id);
    }

    /// Lines for the messages not printed yet, in display order.
    fn new_lines(&mut self, messages: &[Message]) -> Vec<String> {
        let mut lines = Vec::new();
        for message in messages {
            if !self.shown.insert(message.id.clone()) {
                continue;
            }
            if let Some(local_id) = message.local_id() {
                lines.push(format!("{} <{local_id}>", render(message)));
                continue;
            }
            let printed_as_local = message
                .canonical_id()
                .and_then(|id| self.promoted.get(id))
                .is_some_and(|local_id| {
                    self.shown.contains(&MessageKey::Provisional(*local_id))
                });
            if !printed_as_local {
                lines.push(render(message));
            }
        }
        lines
    }

    fn print_new(&mut self, messages: &[Message]) {
        for line in self.new_lines(messages) {
            println!("{line}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chat_client=debug")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let auth = Arc::new(SessionStore::signed_in(AuthSession::new(
        args.token,
        UserId::new(args.user_id),
        args.username,
    )));
    let client = ChatClient::from_settings(settings, auth).context("invalid client settings")?;
    let mut events = client.subscribe_events();

    client
        .connect()
        .await
        .context("failed to connect to the chat server")?;

    let history = match (args.chat_id, args.with_user) {
        (Some(chat_id), _) => client.open_chat(ChatId::new(chat_id)).await?,
        (None, Some(user_id)) => client.open_chat_with_user(&UserId::new(user_id)).await?,
        (None, None) => bail!("pass --chat-id or --with-user"),
    };
    let chat_id = history.chat_id().clone();
    match history.wait().await {
        Ok(outcome) => info!(chat_id = %chat_id, ?outcome, "history ready"),
        Err(err) => warn!(chat_id = %chat_id, error = %err, "history unavailable"),
    }

    let mut transcript = Transcript::default();
    transcript.print_new(&client.messages().await);
    println!("-- chat {chat_id}; type a message, /quit to leave --");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim() == "/quit" {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    if let Err(err) = client.send_message(&line).await {
                        let hint = if err.is_retryable() { " (try again)" } else { "" };
                        eprintln!("send failed: {err}{hint}");
                    }
                });
            }
            event = events.recv() => match event {
                Ok(ClientEvent::MessagesUpdated { .. }) => {
                    transcript.print_new(&client.messages().await);
                }
                Ok(ClientEvent::SendConfirmed { local_id, message_id }) => {
                    println!("  <{local_id}> delivered as {message_id}");
                    transcript.confirmed(local_id, message_id);
                }
                Ok(ClientEvent::SendFailed { local_id, reason }) => {
                    println!("  <{local_id}> failed: {reason}");
                }
                Ok(ClientEvent::ConnectionChanged(state)) => println!("-- {state} --"),
                Ok(ClientEvent::ConnectionFailed(reason)) => {
                    println!("-- connection lost: {reason} --");
                }
                Ok(ClientEvent::HistoryFailed { reason, .. }) => {
                    println!("-- history unavailable: {reason} --");
                }
                Ok(ClientEvent::ServerError(error)) => {
                    println!("-- server error: {} --", error.message);
                }
                Ok(ClientEvent::HistoryLoaded { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "ui fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.close_chat().await;
    client.disconnect().await;
    Ok(())
}
