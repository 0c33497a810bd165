use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};

use {anyhow::Result, fd_lock::RwLock, tracing::warn};

use tether_protocol::ChatMessage;

/// Append-only JSONL transcript of the chat records delivered for one session.
///
/// Stored at `<data_dir>/transcripts/<session>.jsonl` and guarded by an
/// advisory file lock. Only used to restore a transcript across restarts.
pub struct ChatSessionStore {
    path: PathBuf,
    limit: usize,
    seen: HashSet<String>,
}

impl ChatSessionStore {
    /// Open (or create the directory for) the transcript of `session_id`,
    /// keeping at most `limit` entries on [`load`](Self::load).
    pub fn open(data_dir: &Path, session_id: &str, limit: usize) -> Result<Self> {
        let dir = data_dir.join("transcripts");
        fs::create_dir_all(&dir)?;
        let mut store = Self {
            path: dir.join(format!("{}.jsonl", file_stem(session_id))),
            limit,
            seen: HashSet::new(),
        };
        store.seen = store.read_all()?.into_iter().map(|m| m.id).collect();
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Returns `false` when a record with the same id is
    /// already stored (replays after a reconnect).
    pub fn append(&mut self, message: &ChatMessage) -> Result<bool> {
        if !message.id.is_empty() && self.seen.contains(&message.id) {
            return Ok(false);
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut lock = RwLock::new(file);
        let mut guard = lock.write()?;
        guard.write_all(line.as_bytes())?;
        drop(guard);

        if !message.id.is_empty() {
            self.seen.insert(message.id.clone());
        }
        Ok(true)
    }

    /// The newest `limit` records, oldest first. Malformed lines are skipped.
    pub fn load(&self) -> Result<Vec<ChatMessage>> {
        let mut all = self.read_all()?;
        if all.len() > self.limit {
            all.drain(..all.len() - self.limit);
        }
        Ok(all)
    }

    /// Remove the transcript file.
    pub fn clear(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        self.seen.clear();
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<ChatMessage>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lock = RwLock::new(file);
        let guard = lock.read()?;

        let mut messages = Vec::new();
        for (n, line) in BufReader::new(&*guard).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(&line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    warn!(path = %self.path.display(), line = n + 1, error = %e, "skipping malformed transcript line");
                },
            }
        }
        Ok(messages)
    }
}

/// Session ids come from the server; keep them filesystem-safe.
fn file_stem(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
