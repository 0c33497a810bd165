use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use {
    anyhow::{Context, Result},
    tether_config::TetherConfig,
    tether_protocol::{ChatMessage, InboundMessage},
    tether_sessions::{ChatSessionStore, Session},
    tether_transport::{ConnectionManager, DisconnectEvent, TransportError, endpoint},
    tokio::io::{AsyncBufReadExt, BufReader},
    tracing::{debug, info, warn},
};

/// Join a session and relay stdin lines as chat messages until EOF,
/// `/quit` or Ctrl-C.
pub async fn run(config: &TetherConfig, session: Option<String>) -> Result<()> {
    let resolver = crate::resolver(config)?;
    let session = match session {
        Some(id) => Session::server(id),
        None => resolver.resolve().await,
    };
    if session.is_local() {
        warn!(session_id = %session.id, "server unreachable, using a local session");
    }

    let data_dir = tether_config::data_dir(config);
    let transcript = Transcript::open(data_dir, &session.id, config.storage.transcript_limit)?;
    for message in transcript.history().context("reading transcript")? {
        render(&InboundMessage::Chat(message));
    }
    let transcript = Arc::new(Mutex::new(transcript));

    let manager = ConnectionManager::builder(config.transport.clone())
        .server_url(config.server.base_url.clone())
        .session_renewer(resolver)
        .build();

    let _messages = manager.on_message({
        let transcript = Arc::clone(&transcript);
        move |message| {
            render(message);
            if let Some(chat) = message.as_chat() {
                transcript
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(chat);
            }
        }
    });

    // The session changes under us when the server deletes it.
    let _connects = manager.on_connect({
        let transcript = Arc::clone(&transcript);
        move |url| {
            info!(url = %url, "connected");
            let Some(session_id) = endpoint::session_id(url) else {
                return;
            };
            let mut transcript = transcript.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = transcript.follow(&session_id) {
                warn!(session_id = %session_id, error = %e, "failed to switch transcript");
            }
        }
    });

    let _disconnects = manager.on_disconnect(|event| match event {
        DisconnectEvent::Closed {
            code,
            reason,
            reconnect_in: Some(delay),
        } => warn!(
            code,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "connection lost, reconnecting"
        ),
        DisconnectEvent::Closed { code, reason, .. } => {
            info!(code, reason = %reason, "connection closed")
        },
        DisconnectEvent::Error { message } => warn!(error = %message, "connection error"),
        DisconnectEvent::GaveUp { attempts } => {
            eprintln!("gave up after {attempts} attempts, type /reconnect to try again")
        },
    });

    manager
        .connect_session(&session)
        .await
        .with_context(|| format!("connecting to session {}", session.id))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => continue,
                    "/quit" => break,
                    "/reconnect" => {
                        let state = manager.reconnect().await?;
                        debug!(%state, "reconnect requested");
                    },
                    text => match manager.send_chat(text, config.server.user_id.as_str()).await {
                        Ok(()) => {},
                        Err(TransportError::NotConnected(state)) => {
                            eprintln!("not connected ({state}), message not sent");
                        },
                        Err(e @ (TransportError::Socket(_) | TransportError::WriteTimeout(_))) => {
                            eprintln!("{e}, message not sent");
                        },
                        Err(e) => return Err(e.into()),
                    },
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Transcript of the session the client is currently bound to.
struct Transcript {
    data_dir: PathBuf,
    limit: usize,
    session_id: String,
    store: ChatSessionStore,
}

impl Transcript {
    fn open(data_dir: PathBuf, session_id: &str, limit: usize) -> Result<Self> {
        let store = ChatSessionStore::open(&data_dir, session_id, limit)
            .with_context(|| format!("opening transcript for {session_id}"))?;
        Ok(Self {
            data_dir,
            limit,
            session_id: session_id.to_string(),
            store,
        })
    }

    fn history(&self) -> Result<Vec<ChatMessage>> {
        self.store.load()
    }

    fn record(&mut self, chat: &ChatMessage) {
        if let Err(e) = self.store.append(chat) {
            warn!(session_id = %self.session_id, error = %e, "failed to record message");
        }
    }

    /// Bind to `session_id` after a connect. Reconnects to the same session
    /// keep the open store. A different id means the server deleted the old
    /// session, so its transcript is removed.
    fn follow(&mut self, session_id: &str) -> Result<()> {
        if session_id == self.session_id {
            return Ok(());
        }
        let store = ChatSessionStore::open(&self.data_dir, session_id, self.limit)
            .with_context(|| format!("opening transcript for {session_id}"))?;
        let mut deleted = std::mem::replace(&mut self.store, store);
        let previous = std::mem::replace(&mut self.session_id, session_id.to_string());
        info!(from = %previous, to = %session_id, "transcript switched");
        deleted
            .clear()
            .with_context(|| format!("removing transcript of {previous}"))
    }
}

fn render(message: &InboundMessage) {
    match message {
        InboundMessage::Chat(chat) | InboundMessage::AgentResponse(chat) => {
            let who = chat.sender_name.as_deref().unwrap_or(chat.sender.as_str());
            println!("[{who}] {}", chat.content);
        },
        InboundMessage::StreamStart { .. } => {},
        InboundMessage::StreamChunk { chunk, .. } => {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        },
        InboundMessage::StreamEnd { .. } => println!(),
        InboundMessage::Error { message } => eprintln!("server error: {message}"),
        InboundMessage::TaskCompleted {
            task_id,
            agent_name,
            status,
            ..
        } => println!(
            "task {task_id} {} ({})",
            status.as_deref().unwrap_or("completed"),
            agent_name.as_deref().unwrap_or("agent")
        ),
        InboundMessage::ConnectionEstablished { message, .. } => {
            if let Some(message) = message {
                info!(message = %message, "server ready");
            }
        },
        InboundMessage::SessionDeleted { session_id } => {
            info!(session_id = %session_id, "session deleted");
        },
        InboundMessage::Unhandled { kind, .. } => debug!(kind = %kind, "unhandled message"),
    }
}
