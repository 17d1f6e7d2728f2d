//! Refresh session storage for rotation and revocation.
//!
//! Only refresh tokens are stored. Access tokens are stateless.
//! Every login starts a family; each refresh marks the presented token used
//! and records its successor in the same family.

use sqlx::sqlite::SqlitePool;

/// A refresh session record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshSession {
    pub id: i64,
    pub jti: String,
    pub family: String,
    pub user_id: i64,
    pub last_ip: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub used: bool,
    /// When the token was exchanged, if it was.
    pub used_at: Option<i64>,
    /// JWT ID of the token it was exchanged for.
    pub replaced_by: Option<String>,
    pub created_at: String,
}

impl RefreshSession {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now as i64
    }

    /// Whether the token was exchanged less than `grace_secs` before `now`.
    pub fn used_within(&self, now: u64, grace_secs: u64) -> bool {
        match self.used_at {
            Some(used_at) => (now as i64) < used_at.saturating_add(grace_secs as i64),
            None => false,
        }
    }
}

/// Fields needed to record a refresh token.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub jti: &'a str,
    pub family: &'a str,
    pub user_id: i64,
    pub ip: Option<&'a str>,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Result of trying to exchange a refresh token for its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The old token was marked used and the new one recorded.
    Rotated,
    /// The old token was already used, expired, or gone. Nothing was written.
    Stale,
}

const SESSION_COLUMNS: &str = "id, jti, family, user_id, last_ip, issued_at, expires_at, used, \
     used_at, replaced_by, created_at";

/// Store for managing refresh sessions.
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new refresh token.
    pub async fn create(&self, session: &NewSession<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO refresh_sessions (jti, family, user_id, last_ip, issued_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.jti)
        .bind(session.family)
        .bind(session.user_id)
        .bind(session.ip)
        .bind(session.issued_at as i64)
        .bind(session.expires_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a refresh session by its JWT ID.
    pub async fn get_by_jti(&self, jti: &str) -> Result<Option<RefreshSession>, sqlx::Error> {
        sqlx::query_as(&format!(
            "SELECT {} FROM refresh_sessions WHERE jti = ?",
            SESSION_COLUMNS
        ))
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
    }

    /// Mark `old_jti` used and record `next` as its successor in one transaction.
    ///
    /// The update only matches an unused, unexpired row, so of two concurrent
    /// exchanges of the same token exactly one sees `Rotated`.
    pub async fn rotate(
        &self,
        old_jti: &str,
        next: &NewSession<'_>,
        now: u64,
    ) -> Result<RotateOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE refresh_sessions SET used = 1, used_at = ?, replaced_by = ?
             WHERE jti = ? AND used = 0 AND expires_at > ?",
        )
        .bind(now as i64)
        .bind(next.jti)
        .bind(old_jti)
        .bind(now as i64)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RotateOutcome::Stale);
        }

        sqlx::query(
            "INSERT INTO refresh_sessions (jti, family, user_id, last_ip, issued_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(next.jti)
        .bind(next.family)
        .bind(next.user_id)
        .bind(next.ip)
        .bind(next.issued_at as i64)
        .bind(next.expires_at as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RotateOutcome::Rotated)
    }

    /// Delete every token of a session family (logout, replay).
    pub async fn delete_family(&self, family: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_sessions WHERE family = ?")
            .bind(family)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete all tokens that expired at or before `now`.
    pub async fn delete_expired(&self, now: u64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_sessions WHERE expires_at <= ?")
            .bind(now as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every token of every family a user holds (password change).
    pub async fn delete_by_user(&self, user_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Database, NewUser};
    use super::*;

    const NOW: u64 = 1_700_000_000;

    async fn setup() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db
            .users()
            .create(&NewUser {
                uuid: "uuid-1",
                email: "bob@example.com",
                first_name: "Bob",
                last_name: "Weir",
                bio: None,
                password_hash: "hash",
            })
            .await
            .unwrap();
        (db, user_id)
    }

    fn session<'a>(jti: &'a str, family: &'a str, user_id: i64, expires_at: u64) -> NewSession<'a> {
        NewSession {
            jti,
            family,
            user_id,
            ip: Some("127.0.0.1"),
            issued_at: NOW,
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (db, user_id) = setup().await;

        db.sessions()
            .create(&session("jti-1", "fam-1", user_id, NOW + 100))
            .await
            .unwrap();

        let stored = db.sessions().get_by_jti("jti-1").await.unwrap().unwrap();
        assert_eq!(stored.family, "fam-1");
        assert_eq!(stored.user_id, user_id);
        assert_eq!(stored.last_ip.as_deref(), Some("127.0.0.1"));
        assert!(!stored.used);
        assert!(!stored.is_expired(NOW));
        assert!(stored.is_expired(NOW + 100));

        assert!(db.sessions().get_by_jti("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_marks_old_used_once() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();

        sessions
            .create(&session("jti-1", "fam-1", user_id, NOW + 100))
            .await
            .unwrap();

        let outcome = sessions
            .rotate("jti-1", &session("jti-2", "fam-1", user_id, NOW + 200), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated);
        let old = sessions.get_by_jti("jti-1").await.unwrap().unwrap();
        assert!(old.used);
        assert_eq!(old.used_at, Some(NOW as i64));
        assert_eq!(old.replaced_by.as_deref(), Some("jti-2"));
        assert!(old.used_within(NOW + 29, 30));
        assert!(!old.used_within(NOW + 30, 30));

        let next = sessions.get_by_jti("jti-2").await.unwrap().unwrap();
        assert!(!next.used);
        assert_eq!(next.used_at, None);
        assert!(!next.used_within(NOW, 30));

        // Second exchange of the same token writes nothing
        let outcome = sessions
            .rotate("jti-1", &session("jti-3", "fam-1", user_id, NOW + 200), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Stale);
        assert!(sessions.get_by_jti("jti-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_expired_is_stale() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();

        sessions
            .create(&session("jti-1", "fam-1", user_id, NOW + 10))
            .await
            .unwrap();

        let outcome = sessions
            .rotate(
                "jti-1",
                &session("jti-2", "fam-1", user_id, NOW + 200),
                NOW + 10,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Stale);
    }

    #[tokio::test]
    async fn test_delete_family_leaves_other_families() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();

        sessions
            .create(&session("a-1", "fam-a", user_id, NOW + 100))
            .await
            .unwrap();
        sessions
            .create(&session("a-2", "fam-a", user_id, NOW + 100))
            .await
            .unwrap();
        sessions
            .create(&session("b-1", "fam-b", user_id, NOW + 100))
            .await
            .unwrap();

        assert_eq!(sessions.delete_family("fam-a").await.unwrap(), 2);
        assert!(sessions.get_by_jti("a-1").await.unwrap().is_none());
        assert!(sessions.get_by_jti("b-1").await.unwrap().is_some());
        assert_eq!(sessions.delete_family("fam-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();

        sessions
            .create(&session("old", "fam-1", user_id, NOW - 1))
            .await
            .unwrap();
        sessions
            .create(&session("live", "fam-2", user_id, NOW + 100))
            .await
            .unwrap();

        assert_eq!(sessions.delete_expired(NOW).await.unwrap(), 1);
        assert!(sessions.get_by_jti("old").await.unwrap().is_none());
        assert!(sessions.get_by_jti("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_by_user_spans_families() {
        let (db, user_id) = setup().await;
        let other = db
            .users()
            .create(&NewUser {
                uuid: "uuid-2",
                email: "phil@example.com",
                first_name: "Phil",
                last_name: "Lesh",
                bio: None,
                password_hash: "hash",
            })
            .await
            .unwrap();
        let sessions = db.sessions();

        sessions
            .create(&session("a-1", "fam-a", user_id, NOW + 100))
            .await
            .unwrap();
        sessions
            .create(&session("b-1", "fam-b", user_id, NOW + 100))
            .await
            .unwrap();
        sessions
            .create(&session("c-1", "fam-c", other, NOW + 100))
            .await
            .unwrap();

        assert_eq!(sessions.delete_by_user(user_id).await.unwrap(), 2);
        assert!(sessions.get_by_jti("a-1").await.unwrap().is_none());
        assert!(sessions.get_by_jti("b-1").await.unwrap().is_none());
        assert!(sessions.get_by_jti("c-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sessions_removed_with_user() {
        let (db, user_id) = setup().await;

        db.sessions()
            .create(&session("jti-1", "fam-1", user_id, NOW + 100))
            .await
            .unwrap();
        db.users().delete(user_id).await.unwrap();

        assert!(db.sessions().get_by_jti("jti-1").await.unwrap().is_none());
    }
}
