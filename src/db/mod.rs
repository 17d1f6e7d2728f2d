mod session;
mod user;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub use session::{NewSession, RefreshSession, RotateOutcome, SessionStore};
pub use user::{NewUser, PublicUser, User, UserRole, UserStore};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create a database at the given path.
    /// Use ":memory:" for an in-memory database.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let (url, max_connections) = if path == ":memory:" {
            // Every in-memory connection is its own database, so keep exactly one.
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite:{}?mode=rwc", path), 5)
        };

        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        if path == ":memory:" {
            // Dropping the only connection would drop the database with it.
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(&url).await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the current schema version.
    async fn get_version(&self) -> Result<i32, sqlx::Error> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(result.map(|r| r.0).unwrap_or(0))
    }

    /// Set the schema version within a transaction.
    async fn set_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        version: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM schema_version")
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Run database migrations.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let version = self.get_version().await?;

        if version < 1 {
            self.migrate_v1().await?;
        }
        if version < 2 {
            self.migrate_v2().await?;
        }

        Ok(())
    }

    /// Execute a list of queries in a transaction, then set the version.
    async fn run_migration(
        &self,
        version: i32,
        queries: &[&'static str],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for query in queries {
            sqlx::query(*query).execute(&mut *tx).await?;
        }
        Self::set_version(&mut tx, version).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn migrate_v1(&self) -> Result<(), sqlx::Error> {
        self.run_migration(
            1,
            &[
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT UNIQUE NOT NULL,
                    email TEXT UNIQUE NOT NULL COLLATE NOCASE,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    bio TEXT,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'user',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
                "CREATE INDEX idx_users_uuid ON users(uuid)",
                "CREATE INDEX idx_users_email ON users(email)",
                // Refresh sessions. Timestamps are Unix seconds.
                // `used` is set once a token has been exchanged for its successor.
                "CREATE TABLE refresh_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    jti TEXT UNIQUE NOT NULL,
                    family TEXT NOT NULL,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    last_ip TEXT,
                    issued_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    used INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
                "CREATE INDEX idx_refresh_sessions_jti ON refresh_sessions(jti)",
                "CREATE INDEX idx_refresh_sessions_family ON refresh_sessions(family)",
                "CREATE INDEX idx_refresh_sessions_user_id ON refresh_sessions(user_id)",
                "CREATE INDEX idx_refresh_sessions_expires_at ON refresh_sessions(expires_at)",
            ],
        )
        .await
    }

    /// Record when a refresh token was exchanged and for which successor,
    /// so a retry after a lost response can be told apart from a replay.
    async fn migrate_v2(&self) -> Result<(), sqlx::Error> {
        self.run_migration(
            2,
            &[
                "ALTER TABLE refresh_sessions ADD COLUMN used_at INTEGER",
                "ALTER TABLE refresh_sessions ADD COLUMN replaced_by TEXT",
            ],
        )
        .await
    }

    /// Get the user store.
    pub fn users(&self) -> UserStore {
        UserStore::new(self.pool.clone())
    }

    /// Get the refresh session store.
    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.pool.clone())
    }

    /// Get the underlying connection pool (for tests that need raw SQL access).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
