//! Anrufliste

use super::{Database, DatabaseError};
use crate::call_engine::{CallAttempt, CallHistory};
use rusqlite::{params, Result as SqliteResult};
use serde::Serialize;

/// Ein beendeter Anruf
#[derive(Debug, Clone, Serialize)]
pub struct CallLogEntry {
    pub call_id: String,
    pub direction: String,
    pub peer_id: String,
    pub peer_display_name: String,
    pub status: String,
    pub video: bool,
    pub started_at: String,
    pub answered_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
}

impl Database {
    /// Speichert einen beendeten Anruf. Doppelte IDs überschreiben.
    pub fn record_call(&self, call: &CallAttempt) -> Result<(), DatabaseError> {
        let direction = match call.direction {
            crate::call_engine::CallDirection::Incoming => "incoming",
            crate::call_engine::CallDirection::Outgoing => "outgoing",
        };

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO call_log (
                call_id, direction, peer_id, peer_display_name, status, video,
                started_at, answered_at, ended_at, duration_secs, end_reason
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                call.id.as_str(),
                direction,
                call.peer_id,
                call.peer_display_name,
                call.status.to_string(),
                call.video as i32,
                call.started_at.to_rfc3339(),
                call.answered_at.map(|t| t.to_rfc3339()),
                call.ended_at.map(|t| t.to_rfc3339()),
                call.duration_secs(),
                call.end_reason,
            ],
        )?;
        Ok(())
    }

    /// Die letzten `limit` Anrufe, neueste zuerst
    pub fn recent_calls(&self, limit: usize) -> Result<Vec<CallLogEntry>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT call_id, direction, peer_id, peer_display_name, status, video,
                   started_at, answered_at, ended_at, duration_secs, end_reason
            FROM call_log
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(CallLogEntry {
                    call_id: row.get(0)?,
                    direction: row.get(1)?,
                    peer_id: row.get(2)?,
                    peer_display_name: row.get(3)?,
                    status: row.get(4)?,
                    video: row.get::<_, i32>(5)? != 0,
                    started_at: row.get(6)?,
                    answered_at: row.get(7)?,
                    ended_at: row.get(8)?,
                    duration_secs: row.get(9)?,
                    end_reason: row.get(10)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(entries)
    }
}

impl CallHistory for Database {
    fn record(&self, call: &CallAttempt) -> anyhow::Result<()> {
        self.record_call(call)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{CallDirection, CallStatus};
    use crate::signaling::CallId;
    use chrono::{Duration, Utc};

    fn finished(id: &str, status: CallStatus, answered: bool) -> CallAttempt {
        let mut call = CallAttempt::new(CallId::new(id), CallDirection::Outgoing, "peer-bob", false);
        call.peer_display_name = "Bob".to_string();
        call.status = status;
        let now = Utc::now();
        call.started_at = now - Duration::seconds(90);
        if answered {
            call.answered_at = Some(now - Duration::seconds(75));
        }
        call.ended_at = Some(now);
        call
    }

    #[test]
    fn test_record_and_list() {
        let db = Database::open_in_memory().unwrap();

        db.record_call(&finished("a", CallStatus::Completed, true)).unwrap();
        let mut missed = finished("b", CallStatus::NoAnswer, false);
        missed.started_at = Utc::now();
        missed.end_reason = Some("Recipient did not answer".to_string());
        db.record_call(&missed).unwrap();

        let calls = db.recent_calls(10).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "b");
        assert_eq!(calls[0].status, "no_answer");
        assert_eq!(calls[0].duration_secs, None);
        assert_eq!(calls[1].status, "completed");
        assert_eq!(calls[1].duration_secs, Some(75));
        assert_eq!(calls[1].direction, "outgoing");
    }

    #[test]
    fn test_history_trait_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let call = finished("a", CallStatus::Busy, false);

        CallHistory::record(&db, &call).unwrap();
        CallHistory::record(&db, &call).unwrap();

        assert_eq!(db.recent_calls(10).unwrap().len(), 1);
        assert_eq!(db.recent_calls(1).unwrap()[0].peer_display_name, "Bob");
    }
}
