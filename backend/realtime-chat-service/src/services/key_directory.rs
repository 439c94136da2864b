use async_trait::async_trait;
use crypto_core::{
    CryptoError, CryptoResult, KeyDirectory, OneTimePreKey, PrekeyBundle, PublishKeysRequest,
    SignedPreKey,
};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_identity_keys (
    user_id UUID PRIMARY KEY,
    identity_key BYTEA NOT NULL,
    signed_pre_key_id BIGINT NOT NULL,
    signed_pre_key BYTEA NOT NULL,
    signed_pre_key_signature BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS chat_one_time_prekeys (
    user_id UUID NOT NULL,
    key_id BIGINT NOT NULL,
    public_key BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    PRIMARY KEY (user_id, key_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_otk_unclaimed
    ON chat_one_time_prekeys (user_id, key_id)
    WHERE claimed_at IS NULL;
"#;

fn storage<E: std::fmt::Display>(e: E) -> CryptoError {
    CryptoError::KeyDirectory(e.to_string())
}

/// Postgres-backed prekey directory.
///
/// Claimed one-time keys are stamped with `claimed_at` rather than deleted, so
/// the `(user_id, key_id)` primary key keeps an issued id from being uploaded
/// and handed out a second time.
#[derive(Clone)]
pub struct PgKeyDirectory {
    pool: Pool,
}

impl PgKeyDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str) -> CryptoResult<Self> {
        let pg_config: tokio_postgres::Config = database_url.parse().map_err(storage)?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(storage)?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> CryptoResult<()> {
        let client = self.pool.get().await.map_err(storage)?;
        client.batch_execute(SCHEMA).await.map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for PgKeyDirectory {
    async fn fetch_bundle(&self, user_id: Uuid) -> CryptoResult<Option<PrekeyBundle>> {
        let mut client = self.pool.get().await.map_err(storage)?;
        let tx = client.transaction().await.map_err(storage)?;

        let Some(identity) = tx
            .query_opt(
                r#"
                SELECT identity_key, signed_pre_key_id, signed_pre_key, signed_pre_key_signature
                FROM chat_identity_keys
                WHERE user_id = $1
                "#,
                &[&user_id],
            )
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };

        // Oldest unclaimed key; concurrent fetchers skip rows another
        // transaction is already claiming.
        let claimed = tx
            .query_opt(
                r#"
                WITH claimed AS (
                    SELECT key_id
                    FROM chat_one_time_prekeys
                    WHERE user_id = $1 AND claimed_at IS NULL
                    ORDER BY key_id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE chat_one_time_prekeys p
                SET claimed_at = NOW()
                FROM claimed c
                WHERE p.user_id = $1 AND p.key_id = c.key_id
                RETURNING p.key_id, p.public_key
                "#,
                &[&user_id],
            )
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        let one_time_pre_key = claimed.map(|row| OneTimePreKey {
            key_id: row.get::<_, i64>("key_id") as u32,
            public_key: row.get("public_key"),
        });
        if one_time_pre_key.is_none() {
            tracing::warn!(user_id = %user_id, "one-time prekey pool exhausted");
        }

        Ok(Some(PrekeyBundle {
            user_id,
            identity_key: identity.get("identity_key"),
            signed_pre_key: SignedPreKey {
                key_id: identity.get::<_, i64>("signed_pre_key_id") as u32,
                public_key: identity.get("signed_pre_key"),
                signature: identity.get("signed_pre_key_signature"),
            },
            one_time_pre_key,
        }))
    }

    async fn publish(&self, user_id: Uuid, request: PublishKeysRequest) -> CryptoResult<()> {
        request.validate()?;

        let mut client = self.pool.get().await.map_err(storage)?;
        let tx = client.transaction().await.map_err(storage)?;

        tx.execute(
            r#"
            INSERT INTO chat_identity_keys
                (user_id, identity_key, signed_pre_key_id, signed_pre_key, signed_pre_key_signature)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                identity_key = EXCLUDED.identity_key,
                signed_pre_key_id = EXCLUDED.signed_pre_key_id,
                signed_pre_key = EXCLUDED.signed_pre_key,
                signed_pre_key_signature = EXCLUDED.signed_pre_key_signature,
                updated_at = NOW()
            "#,
            &[
                &user_id,
                &request.identity_key,
                &i64::from(request.signed_pre_key.key_id),
                &request.signed_pre_key.public_key,
                &request.signed_pre_key.signature,
            ],
        )
        .await
        .map_err(storage)?;

        let insert = tx
            .prepare(
                r#"
                INSERT INTO chat_one_time_prekeys (user_id, key_id, public_key)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, key_id) DO NOTHING
                "#,
            )
            .await
            .map_err(storage)?;

        let mut added = 0u64;
        for key in &request.one_time_pre_keys {
            added += tx
                .execute(&insert, &[&user_id, &i64::from(key.key_id), &key.public_key])
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        tracing::info!(user_id = %user_id, added, "published prekeys");
        Ok(())
    }

    async fn one_time_key_count(&self, user_id: Uuid) -> CryptoResult<usize> {
        let client = self.pool.get().await.map_err(storage)?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS remaining
                FROM chat_one_time_prekeys
                WHERE user_id = $1 AND claimed_at IS NULL
                "#,
                &[&user_id],
            )
            .await
            .map_err(storage)?;
        Ok(row.get::<_, i64>("remaining") as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_malformed_url() {
        assert!(matches!(
            PgKeyDirectory::connect("postgres://nova@localhost:notaport/chat"),
            Err(CryptoError::KeyDirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        // Building the pool does not open a connection
        assert!(PgKeyDirectory::connect("postgres://nova@127.0.0.1:1/chat").is_ok());
    }
}
