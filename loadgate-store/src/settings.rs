use crate::store_err;
use arc_swap::ArcSwap;
use loadgate_core::GatewayError;
use loadgate_core::group_config::SystemSettings;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

const SETTINGS_KEY: &str = "system";

/// DB-backed system settings with an immutable in-process snapshot.
///
/// Components call `snapshot()` per use instead of holding a
/// reference, so an admin update is visible on the next request
/// without any coordination.
pub struct Settings {
    pool: SqlitePool,
    snap: ArcSwap<SystemSettings>,
}

impl Settings {
    pub async fn load(pool: SqlitePool) -> Result<Self, GatewayError> {
        let stored = Self::read(&pool).await?;
        Ok(Self {
            pool,
            snap: ArcSwap::from_pointee(stored),
        })
    }

    pub fn snapshot(&self) -> Arc<SystemSettings> {
        self.snap.load_full()
    }

    /// Persist and publish a new settings document.
    pub async fn update(&self, settings: SystemSettings) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                   updated_at = excluded.updated_at"#,
        )
        .bind(SETTINGS_KEY)
        .bind(serde_json::to_string(&settings)?)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        self.snap.store(Arc::new(settings));
        Ok(())
    }

    /// Re-read from the DB, e.g. on a slave after a master-side change.
    pub async fn reload(&self) -> Result<(), GatewayError> {
        let stored = Self::read(&self.pool).await?;
        self.snap.store(Arc::new(stored));
        Ok(())
    }

    async fn read(pool: &SqlitePool) -> Result<SystemSettings, GatewayError> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(SETTINGS_KEY)
            .fetch_optional(pool)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => {
                let raw: String = row.get("value");
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(SystemSettings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_ephemeral;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let pool = connect_ephemeral().await.unwrap();
        let settings = Settings::load(pool).await.unwrap();
        assert_eq!(*settings.snapshot(), SystemSettings::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_publishes() {
        let pool = connect_ephemeral().await.unwrap();
        let settings = Settings::load(pool.clone()).await.unwrap();

        let mut next = SystemSettings::default();
        next.blacklist_threshold = 7;
        next.max_retries = 1;
        settings.update(next.clone()).await.unwrap();

        assert_eq!(settings.snapshot().blacklist_threshold, 7);

        // a second loader sees the persisted document
        let reloaded = Settings::load(pool).await.unwrap();
        assert_eq!(*reloaded.snapshot(), next);
    }

    #[tokio::test]
    async fn test_snapshot_is_immutable_view() {
        let pool = connect_ephemeral().await.unwrap();
        let settings = Settings::load(pool).await.unwrap();
        let before = settings.snapshot();

        let mut next = SystemSettings::default();
        next.max_retries = 9;
        settings.update(next).await.unwrap();

        assert_eq!(before.max_retries, SystemSettings::default().max_retries);
        assert_eq!(settings.snapshot().max_retries, 9);
    }
}
