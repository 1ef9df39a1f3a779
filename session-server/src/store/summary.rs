use sqlx::types::Json;

use session_core::error::{Result, SessionError};
use session_core::models::{Session, SessionKey, Summary};

use super::Store;
use crate::subsystems::summarize::summarize_delta;
use crate::subsystems::summary_worker::SummaryJob;

impl Store {
    /// Summarize `session` for `filter_key` and persist the result. A
    /// non-empty filter key also refreshes the full-session summary.
    pub async fn create_session_summary(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<Option<Summary>> {
        session.key().check_session_key()?;
        let created = self.summarize_and_store(session, filter_key, force).await?;
        if !filter_key.is_empty() {
            if let Err(e) = self.summarize_and_store(session, "", force).await {
                tracing::warn!(session = %session.key(), error = %e, "full-session summary refresh failed");
            }
        }
        Ok(created)
    }

    async fn summarize_and_store(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<Option<Summary>> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or_else(|| SessionError::Summarizer("no summarizer configured".to_string()))?;
        let Some(summary) = summarize_delta(summarizer.as_ref(), session, filter_key, force).await? else {
            return Ok(None);
        };
        self.upsert_summary(&session.key(), filter_key, &summary).await?;
        Ok(Some(summary))
    }

    /// Insert or overwrite the summary for (session, filter key). An active
    /// row with an equal or newer `updated_at` is kept; a tombstoned row is
    /// revived. Assignment order matters: MySQL evaluates left to right.
    pub async fn upsert_summary(&self, key: &SessionKey, filter_key: &str, summary: &Summary) -> Result<()> {
        let raw = serde_json::to_string(summary).map_err(|e| SessionError::serde("marshal summary", e))?;
        let newer = "(deleted_at IS NOT NULL OR VALUES(updated_at) > updated_at)";
        sqlx::query(&format!(
            "INSERT INTO {} (app_name, user_id, session_id, filter_key, summary, updated_at, expires_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL) \
             ON DUPLICATE KEY UPDATE \
             summary = IF({newer}, VALUES(summary), summary), \
             expires_at = IF({newer}, VALUES(expires_at), expires_at), \
             updated_at = IF({newer}, VALUES(updated_at), updated_at), \
             deleted_at = NULL",
            self.tables.session_summaries
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(filter_key)
        .bind(raw)
        .bind(summary.updated_at)
        .bind(self.session_expires_at(Store::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::db("upsert session summary", e))?;
        Ok(())
    }

    /// Summary text: in-memory first, then the stored rows (requested key,
    /// then the full-session key).
    pub async fn get_session_summary_text(&self, session: &Session, filter_key: &str) -> Result<Option<String>> {
        let key = session.key();
        key.check_session_key()?;
        if let Some(text) = session.summary_text(filter_key) {
            return Ok(Some(text));
        }

        let mut candidates = vec![filter_key];
        if !filter_key.is_empty() {
            candidates.push("");
        }
        for fk in candidates {
            let row: Option<(Option<Json<Summary>>,)> = sqlx::query_as(&format!(
                "SELECT summary FROM {} WHERE app_name = ? AND user_id = ? AND session_id = ? \
                 AND filter_key = ? AND deleted_at IS NULL",
                self.tables.session_summaries
            ))
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .bind(fk)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionError::db("get session summary", e))?;

            if let Some((Some(Json(summary)),)) = row {
                if !summary.summary.is_empty() {
                    return Ok(Some(summary.summary));
                }
            }
        }
        Ok(None)
    }

    /// Run one queued summary job under its own deadline.
    pub async fn process_summary_job(&self, job: SummaryJob) -> Result<()> {
        let timeout = self.config.summary_job_timeout();
        let work = self.create_session_summary(&job.session, &job.filter_key, job.force);
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(SessionError::Summarizer(format!(
                "summary job timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}
