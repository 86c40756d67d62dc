//! Terminal client: open a document over `WsChannel` with an in-memory
//! editor.
//!
//! Each stdin line is either text to append or a command:
//! `/title <t>`, `/share`, `/users`, `/show`, `/quit`.

use crate::config::ClientConfig;
use crate::outgoing::WsChannel;
use anyhow::Result;
use async_trait::async_trait;
use docsync_core::{
    ChangeSource, Clipboard, DocId, DocumentRoute, Editor, EngineConfig, EngineEvent,
    MemoryEditor, ShareError, SyncEngine, UserName,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use url::Url;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Append(String),
    Title(String),
    Share,
    Users,
    Show,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Append(line.to_string()));
        };
        let (name, arg) = match rest.split_once(' ') {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest.trim(), ""),
        };
        match name {
            "title" if !arg.is_empty() => Some(Command::Title(arg.to_string())),
            "share" => Some(Command::Share),
            "users" => Some(Command::Users),
            "show" => Some(Command::Show),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Prints the link instead of touching a system clipboard.
pub struct TerminalClipboard;

#[async_trait]
impl Clipboard for TerminalClipboard {
    async fn write_text(&self, text: &str) -> Result<(), ShareError> {
        println!("{}", text);
        Ok(())
    }
}

type Engine = SyncEngine<WsChannel, MemoryEditor>;

/// Open `doc_id` (or a fresh document) as `user_name` and run until stdin
/// closes, `/quit` or Ctrl+C.
pub async fn run(config: ClientConfig, doc_id: Option<DocId>, user_name: UserName) -> Result<()> {
    let doc_id = doc_id.unwrap_or_else(|| {
        let id = DocId::generate();
        info!("Created document {}", id);
        id
    });

    let route = DocumentRoute::new(Url::parse(&config.app_url)?, doc_id.clone())?
        .with_user(user_name.clone());
    println!("Opening {}", route.url());

    let channel = WsChannel::connect(config.channel());
    let editor = Arc::new(MemoryEditor::new());
    let engine = SyncEngine::new(
        EngineConfig::new(doc_id, user_name).with_route(route),
        Arc::clone(&channel),
        Arc::clone(&editor),
    );

    let _events = engine.events().subscribe(print_event);
    let printer = Arc::downgrade(&editor);
    let _changes = editor.changes().subscribe(move |change| {
        let Some(editor) = printer.upgrade() else { return };
        if change.source != ChangeSource::User && editor.is_enabled() {
            println!("| {}", editor.text());
        }
    });

    let session = engine.start()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(command) => execute(&engine, command).await,
                    None => println!("Unknown command: {}", line),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    if tokio::time::timeout(Duration::from_secs(2), channel.closed())
        .await
        .is_err()
    {
        warn!("Timed out closing the connection");
    }
    Ok(())
}

async fn execute(engine: &Engine, command: Command) {
    let editor = engine.editor();
    match command {
        Command::Append(text) => {
            if let Err(e) = editor.type_text(&text) {
                println!("Cannot edit yet: {}", e);
            }
        }
        Command::Title(title) => {
            if let Err(e) = engine.on_title_edit(title) {
                println!("Cannot set title: {}", e);
            }
        }
        Command::Share => {
            // Failures are reported through the notification event.
            let _ = engine.share_link(&TerminalClipboard).await;
        }
        Command::Users => {
            let users = engine.presence();
            if users.is_empty() {
                println!("Nobody else is here");
            } else {
                let names: Vec<&str> = users.iter().map(|u| u.as_str()).collect();
                println!("Also here: {}", names.join(", "));
            }
        }
        Command::Show => {
            println!("# {}", engine.title());
            println!("{}", editor.text());
        }
        Command::Quit => {}
    }
}

fn print_event(event: EngineEvent) {
    match event {
        EngineEvent::StateChanged { state } => println!("[{:?}]", state),
        EngineEvent::ContentLoaded { length } => println!("[loaded {} characters]", length),
        EngineEvent::TitleChanged { title } => println!("# {}", title),
        EngineEvent::PresenceChanged { users } => println!("[present: {}]", users.join(", ")),
        EngineEvent::Saved => {}
        EngineEvent::ConnectionLost => println!("[connection lost, reconnecting]"),
        EngineEvent::Notification { message, .. } => println!("[{}]", message),
    }
}
