use serde::Serialize;
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

/// User role. Carried in access tokens as an opaque attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn from_str(s: &str) -> Self {
        match s {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub bio: Option<String>,
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    uuid: String,
    email: String,
    first_name: String,
    last_name: String,
    bio: Option<String>,
    password_hash: String,
    role: String,
    created_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            bio: row.bio,
            password_hash: row.password_hash,
            role: UserRole::from_str(&row.role),
            created_at: row.created_at,
        }
    }
}

/// User profile as returned by the API. Never exposes the password hash or internal ID.
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    #[serde(rename = "_id")]
    pub uuid: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub bio: Option<String>,
    pub role: UserRole,
    pub created_at: String,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        Self {
            uuid: user.uuid,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            bio: user.bio,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

/// Fields needed to insert a user.
pub struct NewUser<'a> {
    pub uuid: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub bio: Option<&'a str>,
    pub password_hash: &'a str,
}

const USER_COLUMNS: &str =
    "id, uuid, email, first_name, last_name, bio, password_hash, role, created_at";

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user with the `user` role. Returns the user ID.
    pub async fn create(&self, user: &NewUser<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO users (uuid, email, first_name, last_name, bio, password_hash, role)
             VALUES (?, ?, ?, ?, ?, ?, 'user')",
        )
        .bind(user.uuid)
        .bind(user.email)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.bio)
        .bind(user.password_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Get a user by email (case-insensitive).
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by UUID.
    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users WHERE uuid = ?", USER_COLUMNS))
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Check whether an account already uses this email.
    pub async fn email_exists(&self, email: &str) -> Result<bool, sqlx::Error> {
        let count: (i32,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    /// Replace a user's password hash.
    pub async fn update_password(&self, id: i64, password_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a user by ID. Their refresh sessions go with them.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
