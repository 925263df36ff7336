use crate::store_err;
use loadgate_core::GatewayError;
use loadgate_core::stats::{GroupHourlyStat, GroupMonthlyStat};
use sqlx::{Row, SqlitePool};

/// Hourly/monthly roll-up rows. Rows are created lazily on first
/// increment via atomic upserts, so concurrent batch consumers and
/// multi-node deployments aggregate correctly in the DB.
#[derive(Clone)]
pub struct StatsRepo {
    pool: SqlitePool,
}

impl StatsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn bump_hourly(
        &self,
        group_id: i64,
        bucket: chrono::DateTime<chrono::Utc>,
        success: i64,
        failure: i64,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO group_hourly_stats (group_id, time, success_count, failure_count)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (group_id, time) DO UPDATE SET
                   success_count = success_count + excluded.success_count,
                   failure_count = failure_count + excluded.failure_count"#,
        )
        .bind(group_id)
        .bind(bucket)
        .bind(success)
        .bind(failure)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn bump_monthly(
        &self,
        group_id: i64,
        bucket: chrono::DateTime<chrono::Utc>,
        requests: i64,
        success: i64,
        failure: i64,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO group_monthly_stats
               (group_id, month, request_count, success_count, failure_count)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (group_id, month) DO UPDATE SET
                   request_count = request_count + excluded.request_count,
                   success_count = success_count + excluded.success_count,
                   failure_count = failure_count + excluded.failure_count"#,
        )
        .bind(group_id)
        .bind(bucket)
        .bind(requests)
        .bind(success)
        .bind(failure)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn hourly(
        &self,
        group_id: i64,
        bucket: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<GroupHourlyStat>, GatewayError> {
        let row = sqlx::query(
            "SELECT success_count, failure_count FROM group_hourly_stats \
             WHERE group_id = ? AND time = ?",
        )
        .bind(group_id)
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| GroupHourlyStat {
            group_id,
            time: bucket,
            success_count: r.get("success_count"),
            failure_count: r.get("failure_count"),
        }))
    }

    pub async fn monthly(
        &self,
        group_id: i64,
        bucket: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<GroupMonthlyStat>, GatewayError> {
        let row = sqlx::query(
            "SELECT request_count, success_count, failure_count FROM group_monthly_stats \
             WHERE group_id = ? AND month = ?",
        )
        .bind(group_id)
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| GroupMonthlyStat {
            group_id,
            month: bucket,
            request_count: r.get("request_count"),
            success_count: r.get("success_count"),
            failure_count: r.get("failure_count"),
        }))
    }

    /// Dashboard feed: per-group hourly rows inside a window.
    pub async fn hourly_range(
        &self,
        group_id: i64,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<GroupHourlyStat>, GatewayError> {
        let rows = sqlx::query(
            "SELECT time, success_count, failure_count FROM group_hourly_stats \
             WHERE group_id = ? AND time >= ? AND time < ? ORDER BY time",
        )
        .bind(group_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|r| GroupHourlyStat {
                group_id,
                time: r.get("time"),
                success_count: r.get("success_count"),
                failure_count: r.get("failure_count"),
            })
            .collect())
    }

    /// Fleet-wide totals since `from`, for the monitor summary.
    pub async fn totals_since(
        &self,
        from: chrono::DateTime<chrono::Utc>,
    ) -> Result<(i64, i64), GatewayError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(success_count), 0) AS s, COALESCE(SUM(failure_count), 0) AS f \
             FROM group_hourly_stats WHERE time >= ?",
        )
        .bind(from)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok((row.get("s"), row.get("f")))
    }
}
