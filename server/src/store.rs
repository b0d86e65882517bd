use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: String,
    pub session_id: String,
    pub user_id: i64,
    pub name: String,
    pub prompt_template: Option<String>,
    /// Ordered document paths, serialized as one JSON text blob.
    pub document_paths: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn instructions(&self) -> &str {
        self.prompt_template.as_deref().unwrap_or("")
    }

    pub fn document_paths(&self) -> Result<Vec<String>, AppError> {
        match self.document_paths.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Some(raw) => Ok(serde_json::from_str(raw)?),
        }
    }

    pub fn set_document_paths(&mut self, paths: &[String]) -> Result<(), AppError> {
        self.document_paths = Some(serde_json::to_string(paths)?);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub user_id: i64,
    pub message: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// sled-backed records: one tree each for sessions, agents and chat turns.
/// Chat keys are `{agent_id}:{micros:020}:{id}` so an agent's history scans in order.
#[derive(Clone)]
pub struct Store {
    sessions: sled::Tree,
    agents: sled::Tree,
    chats: sled::Tree,
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T, AppError> {
    Ok(serde_json::from_slice(raw)?)
}

impl Store {
    pub fn open(db: &sled::Db) -> Result<Self, AppError> {
        Ok(Self { sessions: db.open_tree("sessions")?, agents: db.open_tree("agents")?, chats: db.open_tree("chats")? })
    }

    pub fn create_session(&self, user_id: i64, name: &str) -> Result<Session, AppError> {
        let now = Utc::now();
        let session = Session { id: Uuid::new_v4().to_string(), name: name.to_string(), user_id, created_at: now, updated_at: now };
        self.sessions.insert(session.id.as_bytes(), serde_json::to_vec(&session)?)?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>, AppError> {
        self.sessions.get(id.as_bytes())?.map(|raw| decode(&raw)).transpose()
    }

    pub fn sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>, AppError> {
        let mut out = Vec::new();
        for item in self.sessions.iter() {
            let (_, raw) = item?;
            let s: Session = decode(&raw)?;
            if s.user_id == user_id {
                out.push(s);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub fn create_agent(&self, session_id: &str, user_id: i64, name: &str) -> Result<Agent, AppError> {
        let now = Utc::now();
        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id,
            name: name.to_string(),
            prompt_template: None,
            document_paths: None,
            created_at: now,
            updated_at: now,
        };
        self.put_agent(&agent)?;
        Ok(agent)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>, AppError> {
        self.agents.get(id.as_bytes())?.map(|raw| decode(&raw)).transpose()
    }

    pub fn put_agent(&self, agent: &Agent) -> Result<(), AppError> {
        self.agents.insert(agent.id.as_bytes(), serde_json::to_vec(agent)?)?;
        Ok(())
    }

    pub fn agents_in_session(&self, session_id: &str) -> Result<Vec<Agent>, AppError> {
        let mut out = Vec::new();
        for item in self.agents.iter() {
            let (_, raw) = item?;
            let a: Agent = decode(&raw)?;
            if a.session_id == session_id {
                out.push(a);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Removes the agent and its chat history. Returns false when no such agent existed.
    pub fn delete_agent(&self, id: &str) -> Result<bool, AppError> {
        let existed = self.agents.remove(id.as_bytes())?.is_some();
        let mut batch = sled::Batch::default();
        for key in self.chats.scan_prefix(format!("{}:", id)).keys() {
            batch.remove(key?);
        }
        self.chats.apply_batch(batch)?;
        Ok(existed)
    }

    pub fn append_chat(&self, turn: &ChatTurn) -> Result<(), AppError> {
        let key = format!("{}:{:020}:{}", turn.agent_id, turn.created_at.timestamp_micros().max(0), turn.id);
        self.chats.insert(key.as_bytes(), serde_json::to_vec(turn)?)?;
        Ok(())
    }

    /// Oldest-first history of the agent; with `limit > 0` only the most recent `limit` turns.
    pub fn chats_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<ChatTurn>, AppError> {
        let mut out: Vec<ChatTurn> = Vec::new();
        let prefix = format!("{}:", agent_id);
        if limit == 0 {
            for item in self.chats.scan_prefix(&prefix) {
                let (_, raw) = item?;
                out.push(decode(&raw)?);
            }
        } else {
            for item in self.chats.scan_prefix(&prefix).rev().take(limit) {
                let (_, raw) = item?;
                out.push(decode(&raw)?);
            }
            out.reverse();
        }
        Ok(out)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.sessions.len(), self.agents.len(), self.chats.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("kv")).unwrap();
        (dir, Store::open(&db).unwrap())
    }

    fn turn(agent_id: &str, n: i64) -> ChatTurn {
        ChatTurn {
            id: Uuid::new_v4().to_string(),
            session_id: "s".into(),
            agent_id: agent_id.into(),
            user_id: 1,
            message: format!("m{n}"),
            response: format!("r{n}"),
            created_at: DateTime::from_timestamp(1_700_000_000 + n, 0).unwrap(),
        }
    }

    #[test]
    fn sessions_are_listed_per_user() {
        let (_d, store) = open();
        let s = store.create_session(1, "mine").unwrap();
        store.create_session(2, "theirs").unwrap();
        let mine = store.sessions_for_user(1).unwrap();
        assert_eq!(mine, vec![s.clone()]);
        assert_eq!(store.get_session(&s.id).unwrap().unwrap().name, "mine");
        assert!(store.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn document_paths_round_trip_through_json_blob() {
        let (_d, store) = open();
        let mut agent = store.create_agent("s1", 1, "bot").unwrap();
        assert!(agent.document_paths().unwrap().is_empty());
        agent.set_document_paths(&["b.txt".into(), "a.pdf".into()]).unwrap();
        store.put_agent(&agent).unwrap();
        let stored = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(stored.document_paths.as_deref(), Some(r#"["b.txt","a.pdf"]"#));
        assert_eq!(stored.document_paths().unwrap(), vec!["b.txt".to_string(), "a.pdf".to_string()]);
        assert_eq!(store.agents_in_session("s1").unwrap().len(), 1);
        assert!(store.agents_in_session("s2").unwrap().is_empty());
    }

    #[test]
    fn chat_history_is_ordered_and_limited() {
        let (_d, store) = open();
        for n in [3, 1, 2] {
            store.append_chat(&turn("a1", n)).unwrap();
        }
        store.append_chat(&turn("a10", 0)).unwrap();
        let all: Vec<String> = store.chats_for_agent("a1", 0).unwrap().into_iter().map(|t| t.message).collect();
        assert_eq!(all, vec!["m1", "m2", "m3"]);
        let last: Vec<String> = store.chats_for_agent("a1", 2).unwrap().into_iter().map(|t| t.message).collect();
        assert_eq!(last, vec!["m2", "m3"]);
    }

    #[test]
    fn deleting_an_agent_drops_its_history() {
        let (_d, store) = open();
        let agent = store.create_agent("s1", 1, "bot").unwrap();
        let mut t = turn(&agent.id, 1);
        t.agent_id = agent.id.clone();
        store.append_chat(&t).unwrap();
        store.append_chat(&turn("other", 1)).unwrap();
        assert!(store.delete_agent(&agent.id).unwrap());
        assert!(!store.delete_agent(&agent.id).unwrap());
        assert!(store.chats_for_agent(&agent.id, 0).unwrap().is_empty());
        assert_eq!(store.counts(), (0, 0, 1));
    }
}
