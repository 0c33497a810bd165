use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
    tether_config::TetherConfig,
    tether_sessions::{ChatSessionStore, Session, SessionOrigin, StateStore},
};

#[derive(Subcommand)]
pub enum SessionAction {
    /// Show the persisted session.
    Show,
    /// Resolve a session against the server, replacing a local one.
    Retry,
    /// Forget the persisted session.
    Reset,
}

pub async fn handle_session(config: &TetherConfig, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::Show => {
            match crate::resolver(config)?.persisted() {
                Some(session) => print_session(&session),
                None => println!("no session"),
            }
            Ok(())
        },
        SessionAction::Retry => {
            let session = crate::resolver(config)?
                .retry()
                .await
                .context("session API unavailable")?;
            print_session(&session);
            Ok(())
        },
        SessionAction::Reset => {
            crate::resolver(config)?.reset().await;
            println!("session cleared");
            Ok(())
        },
    }
}

pub fn history(config: &TetherConfig, session: Option<String>, limit: Option<usize>) -> Result<()> {
    let data_dir = tether_config::data_dir(config);
    let session_id = match session {
        Some(id) => id,
        None => {
            let store = StateStore::load(data_dir.join("state.json")).context("reading session state")?;
            match store.current_session() {
                Some(session) => session.id,
                None => bail!("no persisted session, pass --session"),
            }
        },
    };

    let limit = limit.unwrap_or(config.storage.transcript_limit);
    let transcript = ChatSessionStore::open(&data_dir, &session_id, limit)?;
    for message in transcript.load()? {
        let who = message
            .sender_name
            .as_deref()
            .unwrap_or(message.sender.as_str());
        println!("[{who}] {}", message.content);
    }
    Ok(())
}

fn print_session(session: &Session) {
    let origin = match session.origin {
        SessionOrigin::Server => "server",
        SessionOrigin::Local => "local",
    };
    println!("{} ({origin})", session.id);
}
