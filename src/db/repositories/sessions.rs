use crate::{
    db::{documents::DocRef, Database},
    error::Result,
    models::{Condition, Session},
};

const SESSIONS: &str = "sessions";

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        self.put(DocRef::session(&session.session_id), session.clone())
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.get(DocRef::session(session_id)).await
    }

    /// Newest first.
    pub async fn sessions_by_reader(&self, reader_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.find_by(SESSIONS, "reader_id", reader_id).await?;
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    pub async fn sessions_for_condition(
        &self,
        reader_id: &str,
        condition: Condition,
    ) -> Result<Vec<Session>> {
        let sessions = self.sessions_by_reader(reader_id).await?;
        Ok(sessions
            .into_iter()
            .filter(|session| session.condition == condition)
            .collect())
    }
}
