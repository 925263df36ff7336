use crate::store_err;
use loadgate_core::GatewayError;
use loadgate_core::log::RequestLog;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// Append-only request log storage.
#[derive(Clone)]
pub struct LogRepo {
    pool: SqlitePool,
}

/// Admin log query filters. All optional, combined with AND.
#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    /// Substring match on group name; `%`/`_` in the needle are literal.
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub status_code: Option<u16>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Escape LIKE wildcards so user input matches literally.
fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl LogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Single multi-row insert. The pipeline calls this once per batch.
    pub async fn insert_batch(&self, logs: &[RequestLog]) -> Result<(), GatewayError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO request_logs \
             (id, timestamp, group_id, group_name, upstream_url, key_hash, key_value, \
              model, status_code, duration_ms, is_stream, retries, error_message) ",
        );
        qb.push_values(logs, |mut row, log| {
            row.push_bind(&log.id)
                .push_bind(log.timestamp)
                .push_bind(log.group_id)
                .push_bind(&log.group_name)
                .push_bind(&log.upstream_url)
                .push_bind(&log.key_hash)
                .push_bind(&log.key_value)
                .push_bind(&log.model)
                .push_bind(log.status_code as i64)
                .push_bind(log.duration_ms)
                .push_bind(log.is_stream)
                .push_bind(log.retries as i64)
                .push_bind(&log.error_message);
        });
        qb.build().execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    pub async fn query(&self, q: &LogQuery) -> Result<(Vec<RequestLog>, i64), GatewayError> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM request_logs WHERE 1=1");
        let mut rows_qb = QueryBuilder::<Sqlite>::new("SELECT * FROM request_logs WHERE 1=1");
        for qb in [&mut count_qb, &mut rows_qb] {
            if let Some(name) = &q.group_name {
                qb.push(" AND group_name LIKE ")
                    .push_bind(format!("%{}%", escape_like(name)))
                    .push(" ESCAPE '\\'");
            }
            if let Some(hash) = &q.key_hash {
                qb.push(" AND key_hash = ").push_bind(hash.clone());
            }
            if let Some(status) = q.status_code {
                qb.push(" AND status_code = ").push_bind(status as i64);
            }
            if let Some(from) = q.from {
                qb.push(" AND timestamp >= ").push_bind(from);
            }
            if let Some(to) = q.to {
                qb.push(" AND timestamp < ").push_bind(to);
            }
        }
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;

        rows_qb.push(" ORDER BY timestamp DESC LIMIT ");
        rows_qb.push_bind(if q.limit > 0 { q.limit } else { 50 });
        rows_qb.push(" OFFSET ");
        rows_qb.push_bind(q.offset.max(0));

        let rows = rows_qb.build().fetch_all(&self.pool).await.map_err(store_err)?;
        let logs = rows.iter().map(log_from_row).collect::<Result<_, _>>()?;
        Ok((logs, total))
    }

    /// Delete rows older than `cutoff` in chunks, so the writer never
    /// holds a long lock. Returns the number of rows removed.
    pub async fn prune_before(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        chunk_size: i64,
    ) -> Result<u64, GatewayError> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(
                "DELETE FROM request_logs WHERE id IN \
                 (SELECT id FROM request_logs WHERE timestamp < ? LIMIT ?)",
            )
            .bind(cutoff)
            .bind(chunk_size)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
            let deleted = result.rows_affected();
            total += deleted;
            if deleted < chunk_size as u64 {
                return Ok(total);
            }
        }
    }
}

fn log_from_row(row: &SqliteRow) -> Result<RequestLog, GatewayError> {
    Ok(RequestLog {
        id: row.try_get("id").map_err(store_err)?,
        timestamp: row.try_get("timestamp").map_err(store_err)?,
        group_id: row.try_get("group_id").map_err(store_err)?,
        group_name: row.try_get("group_name").map_err(store_err)?,
        upstream_url: row.try_get("upstream_url").map_err(store_err)?,
        key_hash: row.try_get("key_hash").map_err(store_err)?,
        key_value: row.try_get("key_value").map_err(store_err)?,
        model: row.try_get("model").map_err(store_err)?,
        status_code: row.try_get::<i64, _>("status_code").map_err(store_err)? as u16,
        duration_ms: row.try_get("duration_ms").map_err(store_err)?,
        is_stream: row.try_get("is_stream").map_err(store_err)?,
        retries: row.try_get::<i64, _>("retries").map_err(store_err)? as u32,
        error_message: row.try_get("error_message").map_err(store_err)?,
    })
}
