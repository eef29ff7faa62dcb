use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Database operations for organizations
pub struct OrgRepo;

impl OrgRepo {
    pub async fn create(pool: &DbPool, name: &str) -> AppResult<Organization> {
        let org = Organization {
            id: new_id(),
            name: name.to_string(),
            api_key_hash: None,
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO organizations (id, name, api_key_hash, created_at) VALUES (?, ?, ?, ?)")
            .bind(&org.id)
            .bind(&org.name)
            .bind(&org.api_key_hash)
            .bind(org.created_at)
            .execute(pool)
            .await?;
        Ok(org)
    }
}

/// Database operations for users
pub struct UserRepo;

impl UserRepo {
    pub async fn create(pool: &DbPool, org_id: &str, email: &str) -> AppResult<User> {
        let user = User {
            id: new_id(),
            org_id: org_id.to_string(),
            email: email.to_string(),
            full_name: None,
            role: "agent".to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, org_id, email, full_name, role, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.org_id)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.role)
        .bind(user.created_at)
        .execute(pool)
        .await?;
        Ok(user)
    }

    pub async fn get_by_id(pool: &DbPool, id: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }
}

/// Database operations for calls
pub struct CallRepo;

impl CallRepo {
    pub async fn create(pool: &DbPool, new_call: NewCall) -> AppResult<Call> {
        let call = Call {
            id: new_id(),
            org_id: new_call.org_id,
            user_id: new_call.user_id,
            session_id: new_call.session_id,
            start_time: Utc::now(),
            end_time: None,
            audio_object_key: None,
            status: CallStatus::InProgress.as_str().to_string(),
            customer_email: new_call.customer_email,
            sentiment_score: None,
        };
        sqlx::query(
            r#"
            INSERT INTO calls (id, org_id, user_id, session_id, start_time, end_time,
                               audio_object_key, status, customer_email, sentiment_score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&call.id)
        .bind(&call.org_id)
        .bind(&call.user_id)
        .bind(&call.session_id)
        .bind(call.start_time)
        .bind(call.end_time)
        .bind(&call.audio_object_key)
        .bind(&call.status)
        .bind(&call.customer_email)
        .bind(call.sentiment_score)
        .execute(pool)
        .await?;
        Ok(call)
    }

    pub async fn get_by_session_id(pool: &DbPool, session_id: &str) -> AppResult<Option<Call>> {
        let call = sqlx::query_as::<_, Call>("SELECT * FROM calls WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(pool)
            .await?;
        Ok(call)
    }

    /// Advance a call's status, enforcing the forward-only lifecycle.
    ///
    /// `processed` is reachable from `completed` or, on a reconciliation
    /// retry, from `crm_failed`. Returns `true` if the transition applied;
    /// `false` if the call was in none of the legal predecessor states
    /// (another worker won the race, or the transition is illegal).
    pub async fn advance_status(pool: &DbPool, call_id: &str, next: CallStatus) -> AppResult<bool> {
        let predecessors: &[CallStatus] = match next {
            CallStatus::Completed => &[CallStatus::InProgress],
            CallStatus::Processed => &[CallStatus::Completed, CallStatus::CrmFailed],
            CallStatus::CrmFailed => &[CallStatus::Completed],
            CallStatus::InProgress => {
                return Err(AppError::internal("calls never transition back to in_progress"))
            }
        };

        for from in predecessors {
            let result = sqlx::query("UPDATE calls SET status = ? WHERE id = ? AND status = ?")
                .bind(next.as_str())
                .bind(call_id)
                .bind(from.as_str())
                .execute(pool)
                .await?;
            if result.rows_affected() == 1 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn set_archived(
        pool: &DbPool,
        call_id: &str,
        audio_object_key: &str,
    ) -> AppResult<()> {
        sqlx::query("UPDATE calls SET audio_object_key = ?, end_time = ? WHERE id = ?")
            .bind(audio_object_key)
            .bind(Utc::now())
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_sentiment(pool: &DbPool, call_id: &str, score: f64) -> AppResult<()> {
        sqlx::query("UPDATE calls SET sentiment_score = ? WHERE id = ?")
            .bind(score)
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Database operations for transcript segments
pub struct SegmentRepo;

impl SegmentRepo {
    /// One bulk insert for a whole batch. Segments are immutable once written.
    pub async fn insert_batch(pool: &DbPool, segments: &[NewSegment]) -> AppResult<Vec<String>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = segments.iter().map(|_| new_id()).collect();

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "INSERT INTO transcript_segments (id, call_id, text, start_offset, end_offset, speaker, vector_id) ",
        );
        builder.push_values(segments.iter().zip(ids.iter()), |mut b, (seg, id)| {
            b.push_bind(id)
                .push_bind(&seg.call_id)
                .push_bind(&seg.text)
                .push_bind(seg.start_offset)
                .push_bind(seg.end_offset)
                .push_bind(&seg.speaker)
                .push_bind(Option::<String>::None);
        });
        builder.build().execute(pool).await?;

        Ok(ids)
    }

    pub async fn list_by_call(pool: &DbPool, call_id: &str) -> AppResult<Vec<TranscriptSegment>> {
        let segments = sqlx::query_as::<_, TranscriptSegment>(
            "SELECT * FROM transcript_segments WHERE call_id = ? ORDER BY start_offset",
        )
        .bind(call_id)
        .fetch_all(pool)
        .await?;
        Ok(segments)
    }
}

/// Database operations for wrapped tenant keys
pub struct KeyRepo;

impl KeyRepo {
    pub async fn upsert(pool: &DbPool, tenant_id: &str, dek_encrypted: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_keys (tenant_id, dek_encrypted, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET dek_encrypted = excluded.dek_encrypted
            "#,
        )
        .bind(tenant_id)
        .bind(dek_encrypted)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(pool: &DbPool, tenant_id: &str) -> AppResult<Option<TenantKeyRow>> {
        let row = sqlx::query_as::<_, TenantKeyRow>(
            "SELECT * FROM tenant_keys WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

/// Connect a pool and run migrations.
pub async fn connect(url: &str, max_connections: u32) -> AppResult<DbPool> {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    init_db(&pool).await?;
    Ok(pool)
}

pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            api_key_hash TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL REFERENCES organizations(id),
            email TEXT UNIQUE NOT NULL,
            full_name TEXT,
            role TEXT NOT NULL DEFAULT 'agent',
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL REFERENCES organizations(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            session_id TEXT UNIQUE NOT NULL,
            start_time DATETIME NOT NULL,
            end_time DATETIME,
            audio_object_key TEXT,
            status TEXT NOT NULL DEFAULT 'in_progress',
            customer_email TEXT,
            sentiment_score REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcript_segments (
            id TEXT PRIMARY KEY,
            call_id TEXT NOT NULL REFERENCES calls(id),
            text TEXT NOT NULL,
            start_offset REAL NOT NULL,
            end_offset REAL NOT NULL,
            speaker TEXT NOT NULL DEFAULT 'agent',
            vector_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_keys (
            tenant_id TEXT PRIMARY KEY,
            dek_encrypted TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_session_id ON calls(session_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_segments_call_offset ON transcript_segments(call_id, start_offset)",
    )
    .execute(pool)
    .await?;

    info!("Database migrations complete");
    Ok(())
}

/// Create the synthetic org/user/call rows a transcript event needs when no
/// call exists yet for its session. Development convenience only; production
/// creates these at handshake time.
pub async fn ensure_fixtures(pool: &DbPool, session_id: &str) -> AppResult<Call> {
    if let Some(call) = CallRepo::get_by_session_id(pool, session_id).await? {
        return Ok(call);
    }

    let org = OrgRepo::create(pool, "Demo Corp").await?;
    let user = UserRepo::create(pool, &org.id, &format!("agent+{}@demo.com", new_id())).await?;
    let call = CallRepo::create(
        pool,
        NewCall {
            org_id: org.id,
            user_id: user.id,
            session_id: session_id.to_string(),
            customer_email: None,
        },
    )
    .await?;
    Ok(call)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_call(pool: &DbPool, session_id: &str) -> Call {
        let org = OrgRepo::create(pool, "Acme").await.unwrap();
        let user = UserRepo::create(pool, &org.id, "agent@acme.com").await.unwrap();
        CallRepo::create(
            pool,
            NewCall {
                org_id: org.id,
                user_id: user.id,
                session_id: session_id.to_string(),
                customer_email: Some("buyer@client.com".to_string()),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_create_and_lookup() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        let found = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(found.id, call.id);
        assert_eq!(found.status(), CallStatus::InProgress);
        assert!(found.end_time.is_none());
    }

    #[tokio::test]
    async fn test_session_id_unique() {
        let pool = setup_test_db().await;
        seeded_call(&pool, "s1").await;

        let org = OrgRepo::create(&pool, "Other").await.unwrap();
        let user = UserRepo::create(&pool, &org.id, "other@acme.com").await.unwrap();
        let dup = CallRepo::create(
            &pool,
            NewCall {
                org_id: org.id,
                user_id: user.id,
                session_id: "s1".to_string(),
                customer_email: None,
            },
        )
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_status_advances_and_never_regresses() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        assert!(CallRepo::advance_status(&pool, &call.id, CallStatus::Completed).await.unwrap());
        // Same transition twice: second is a no-op
        assert!(!CallRepo::advance_status(&pool, &call.id, CallStatus::Completed).await.unwrap());

        assert!(CallRepo::advance_status(&pool, &call.id, CallStatus::Processed).await.unwrap());
        // Processed is final: no further movement
        assert!(!CallRepo::advance_status(&pool, &call.id, CallStatus::CrmFailed).await.unwrap());

        let found = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(found.status(), CallStatus::Processed);
    }

    #[tokio::test]
    async fn test_crm_failed_retry_reaches_processed() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        assert!(CallRepo::advance_status(&pool, &call.id, CallStatus::Completed).await.unwrap());
        assert!(CallRepo::advance_status(&pool, &call.id, CallStatus::CrmFailed).await.unwrap());

        // Reconciliation retry succeeds against the CRM
        assert!(CallRepo::advance_status(&pool, &call.id, CallStatus::Processed).await.unwrap());
        let found = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(found.status(), CallStatus::Processed);

        // But never regresses back to crm_failed afterwards
        assert!(!CallRepo::advance_status(&pool, &call.id, CallStatus::CrmFailed).await.unwrap());
    }

    #[tokio::test]
    async fn test_skipping_completed_is_rejected() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        // in_progress -> processed is not a legal transition
        assert!(!CallRepo::advance_status(&pool, &call.id, CallStatus::Processed).await.unwrap());
    }

    #[tokio::test]
    async fn test_segment_batch_insert_ordered_readback() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        let segments = vec![
            NewSegment {
                call_id: call.id.clone(),
                text: "second".to_string(),
                start_offset: 5.0,
                end_offset: 7.0,
                speaker: "agent".to_string(),
            },
            NewSegment {
                call_id: call.id.clone(),
                text: "first".to_string(),
                start_offset: 1.0,
                end_offset: 3.0,
                speaker: "agent".to_string(),
            },
        ];
        let ids = SegmentRepo::insert_batch(&pool, &segments).await.unwrap();
        assert_eq!(ids.len(), 2);

        let listed = SegmentRepo::list_by_call(&pool, &call.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].text, "first");
        assert_eq!(listed[1].text, "second");
    }

    #[tokio::test]
    async fn test_segment_batch_empty_is_noop() {
        let pool = setup_test_db().await;
        let ids = SegmentRepo::insert_batch(&pool, &[]).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_fixtures_idempotent() {
        let pool = setup_test_db().await;

        let first = ensure_fixtures(&pool, "dev-session").await.unwrap();
        let second = ensure_fixtures(&pool, "dev-session").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_tenant_key_upsert() {
        let pool = setup_test_db().await;
        KeyRepo::upsert(&pool, "org1", "blob-a").await.unwrap();
        KeyRepo::upsert(&pool, "org1", "blob-b").await.unwrap();

        let row = KeyRepo::get(&pool, "org1").await.unwrap().unwrap();
        assert_eq!(row.dek_encrypted, "blob-b");
        assert!(KeyRepo::get(&pool, "org2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_archived() {
        let pool = setup_test_db().await;
        let call = seeded_call(&pool, "s1").await;

        CallRepo::set_archived(&pool, &call.id, "recordings/s1.ogg").await.unwrap();
        let found = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(found.audio_object_key.as_deref(), Some("recordings/s1.ogg"));
        assert!(found.end_time.is_some());
    }
}
