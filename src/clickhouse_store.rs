/// ClickHouse-backed `LogStore`
///
/// Writes go over HTTP as JSONEachRow; reads and DDL use the `clickhouse`
/// client. Both tables are ReplacingMergeTree, so a redelivered job's rows
/// collapse onto the first delivery's and reads use `FINAL`.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use clickhouse::Client;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobStatus};
use crate::log_entry::{LogEntry, LogLevel};
use crate::store::{error_rate, Analytics, HourCount, LogPage, LogQuery, ServiceCount, ANOMALY_THRESHOLD};
use crate::traits::LogStore;

const INSERT_CHUNK_SIZE: usize = 1000;

/// Row as sent to ClickHouse in JSONEachRow
#[derive(Debug, Serialize)]
struct LogInsertRow<'a> {
    job_id: &'a str,
    line_index: u64,
    timestamp: String,
    level: &'a str,
    service: &'a str,
    message: &'a str,
    raw_line: &'a str,
    anomaly_score: f64,
    extra: Option<&'a str>,
}

impl<'a> From<&'a LogEntry> for LogInsertRow<'a> {
    fn from(entry: &'a LogEntry) -> Self {
        Self {
            job_id: &entry.job_id,
            line_index: entry.line_index,
            timestamp: format_time(entry.timestamp),
            level: entry.level.as_str(),
            service: &entry.service,
            message: &entry.message,
            raw_line: &entry.raw_line,
            anomaly_score: entry.anomaly_score,
            extra: entry.extra.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JobInsertRow<'a> {
    job_id: &'a str,
    filename: &'a str,
    status: &'a str,
    created_at: String,
    updated_at: String,
    processed_count: u64,
    error: Option<&'a str>,
}

impl<'a> From<&'a Job> for JobInsertRow<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_id: &job.job_id,
            filename: &job.filename,
            status: job.status.as_str(),
            created_at: format_time(job.created_at),
            updated_at: format_time(job.updated_at),
            processed_count: job.processed_count,
            error: job.error.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize, clickhouse::Row)]
struct LogRow {
    job_id: String,
    line_index: u64,
    timestamp_ms: i64,
    level: String,
    service: String,
    message: String,
    raw_line: String,
    anomaly_score: f64,
    extra: Option<String>,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            job_id: row.job_id,
            line_index: row.line_index,
            timestamp: from_millis(row.timestamp_ms),
            level: row.level.parse().unwrap_or(LogLevel::Unknown),
            service: row.service,
            message: row.message,
            raw_line: row.raw_line,
            anomaly_score: row.anomaly_score,
            extra: row.extra,
        }
    }
}

#[derive(Debug, Deserialize, clickhouse::Row)]
struct JobRow {
    job_id: String,
    filename: String,
    status: String,
    created_ms: i64,
    updated_ms: i64,
    processed_count: u64,
    error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> PipelineResult<Job> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            PipelineError::Persistence(format!("job {} has unknown status '{}'", self.job_id, self.status))
        })?;
        Ok(Job {
            job_id: self.job_id,
            filename: self.filename,
            status,
            created_at: from_millis(self.created_ms),
            updated_at: from_millis(self.updated_ms),
            processed_count: self.processed_count,
            error: self.error,
        })
    }
}

const LOG_COLUMNS: &str = "job_id, line_index, toUnixTimestamp64Milli(timestamp) AS timestamp_ms, \
     level, service, message, raw_line, anomaly_score, extra";

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Values bound into a dynamically built WHERE clause, in placeholder order
enum BindValue {
    Str(String),
    F64(f64),
    Millis(i64),
}

/// `WHERE ...` for `query`, plus its bind values
fn where_clause(query: &LogQuery) -> (String, Vec<BindValue>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();

    if let Some(job_id) = &query.job_id {
        conditions.push("job_id = ?");
        binds.push(BindValue::Str(job_id.clone()));
    }
    if let Some(service) = &query.service {
        conditions.push("service = ?");
        binds.push(BindValue::Str(service.clone()));
    }
    if let Some(level) = query.level {
        conditions.push("level = ?");
        binds.push(BindValue::Str(level.as_str().to_string()));
    }
    if let Some(min) = query.min_anomaly_score {
        conditions.push("anomaly_score >= ?");
        binds.push(BindValue::F64(min));
    }
    if let Some(search) = &query.search {
        conditions.push("positionCaseInsensitiveUTF8(message, ?) > 0");
        binds.push(BindValue::Str(search.clone()));
    }
    if let Some(start) = query.start_time {
        conditions.push("timestamp >= fromUnixTimestamp64Milli(?)");
        binds.push(BindValue::Millis(start.timestamp_millis()));
    }
    if let Some(end) = query.end_time {
        conditions.push("timestamp <= fromUnixTimestamp64Milli(?)");
        binds.push(BindValue::Millis(end.timestamp_millis()));
    }

    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), binds)
    }
}

fn bind_all(mut query: clickhouse::query::Query, binds: &[BindValue]) -> clickhouse::query::Query {
    for value in binds {
        query = match value {
            BindValue::Str(s) => query.bind(s.as_str()),
            BindValue::F64(f) => query.bind(*f),
            BindValue::Millis(ms) => query.bind(*ms),
        };
    }
    query
}

#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    http_client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseStore {
    pub fn new(url: &str, user: Option<&str>, password: Option<&str>, database: &str) -> Result<Self> {
        let mut client = Client::default().with_url(url).with_database(database);
        if let Some(user) = user {
            client = client.with_user(user);
        }
        if let Some(password) = password {
            client = client.with_password(password);
        }

        Ok(Self {
            client,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            url: url.to_string(),
            database: database.to_string(),
            user: user.map(str::to_string),
            password: password.map(str::to_string),
        })
    }

    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        Self::new(
            &config.clickhouse_url,
            config.clickhouse_user.as_deref(),
            config.clickhouse_password.as_deref(),
            &config.clickhouse_database,
        )
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("../clickhouse_schema.sql");

        // Split by semicolon and execute each statement
        for statement in schema.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                self.client.query(trimmed).execute().await?;
            }
        }

        Ok(())
    }

    /// POST newline-delimited JSON rows into `table`
    async fn insert_json_rows(&self, table: &str, body: String) -> Result<()> {
        let insert = format!("INSERT INTO {} FORMAT JSONEachRow", table);
        let mut request = self
            .http_client
            .post(&self.url)
            .query(&[("query", insert.as_str()), ("database", self.database.as_str())])
            .body(body);
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("ClickHouse insert failed: {}", error_text.trim());
        }
        Ok(())
    }

    async fn write_job(&self, job: &Job) -> Result<()> {
        let body = serde_json::to_string(&JobInsertRow::from(job))?;
        self.insert_json_rows("jobs", body).await
    }

    async fn count_logs(&self, where_sql: &str, binds: &[BindValue]) -> Result<u64> {
        #[derive(Debug, Deserialize, clickhouse::Row)]
        struct CountRow {
            total: u64,
        }

        let sql = format!("SELECT count() AS total FROM logs FINAL {}", where_sql);
        let row = bind_all(self.client.query(&sql), binds)
            .fetch_one::<CountRow>()
            .await?;
        Ok(row.total)
    }

    async fn fetch_analytics(&self, now: DateTime<Utc>) -> Result<Analytics> {
        #[derive(Debug, Deserialize, clickhouse::Row)]
        struct TotalsRow {
            total: u64,
            errors: u64,
            anomalies: u64,
        }

        #[derive(Debug, Deserialize, clickhouse::Row)]
        struct GroupRow {
            key: String,
            count: u64,
        }

        let day_ago = (now - Duration::days(1)).timestamp_millis();
        let half_day_ago = (now - Duration::hours(12)).timestamp_millis();

        let totals = self
            .client
            .query(
                "SELECT count() AS total, countIf(level = 'ERROR') AS errors,
                        countIf(anomaly_score >= ?) AS anomalies
                 FROM logs FINAL
                 WHERE timestamp >= fromUnixTimestamp64Milli(?)",
            )
            .bind(ANOMALY_THRESHOLD)
            .bind(day_ago)
            .fetch_one::<TotalsRow>()
            .await?;

        let top_services = self
            .client
            .query(
                "SELECT service AS key, count() AS count
                 FROM logs FINAL
                 WHERE timestamp >= fromUnixTimestamp64Milli(?)
                 GROUP BY service
                 ORDER BY count DESC, key ASC
                 LIMIT 5",
            )
            .bind(day_ago)
            .fetch_all::<GroupRow>()
            .await?;

        let hourly = self
            .client
            .query(
                "SELECT formatDateTime(timestamp, '%H') AS key, count() AS count
                 FROM logs FINAL
                 WHERE timestamp >= fromUnixTimestamp64Milli(?)
                 GROUP BY key
                 ORDER BY key ASC",
            )
            .bind(half_day_ago)
            .fetch_all::<GroupRow>()
            .await?;

        Ok(Analytics {
            total_logs: totals.total,
            error_count: totals.errors,
            error_rate: error_rate(totals.errors, totals.total),
            top_services: top_services
                .into_iter()
                .map(|g| ServiceCount {
                    service: g.key,
                    count: g.count,
                })
                .collect(),
            anomaly_count: totals.anomalies,
            hourly_breakdown: hourly
                .into_iter()
                .map(|g| HourCount {
                    hour: g.key,
                    count: g.count,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl LogStore for ClickHouseStore {
    async fn init(&self) -> PipelineResult<()> {
        self.init_schema().await.map_err(PipelineError::persistence)?;
        tracing::info!("ClickHouse schema initialized");
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.client.query("SELECT 1").execute().await.is_ok()
    }

    async fn insert_job(&self, job: &Job) -> PipelineResult<()> {
        self.write_job(job).await.map_err(PipelineError::persistence)
    }

    /// Appends a newer version of the row; `FINAL` reads pick it up
    async fn update_job(&self, job: &Job) -> PipelineResult<()> {
        self.write_job(job).await.map_err(PipelineError::persistence)
    }

    async fn get_job(&self, job_id: &str) -> PipelineResult<Option<Job>> {
        let rows = self
            .client
            .query(
                "SELECT job_id, filename, status,
                        toUnixTimestamp64Milli(created_at) AS created_ms,
                        toUnixTimestamp64Milli(updated_at) AS updated_ms,
                        processed_count, error
                 FROM jobs FINAL
                 WHERE job_id = ?
                 LIMIT 1",
            )
            .bind(job_id)
            .fetch_all::<JobRow>()
            .await
            .map_err(PipelineError::persistence)?;

        rows.into_iter().next().map(JobRow::into_job).transpose()
    }

    async fn insert_entries(&self, entries: &[LogEntry]) -> PipelineResult<u64> {
        for chunk in entries.chunks(INSERT_CHUNK_SIZE) {
            let mut body = String::with_capacity(chunk.len() * 256);
            for entry in chunk {
                let line = serde_json::to_string(&LogInsertRow::from(entry))
                    .map_err(PipelineError::persistence)?;
                body.push_str(&line);
                body.push('\n');
            }
            self.insert_json_rows("logs", body)
                .await
                .map_err(PipelineError::persistence)?;
        }

        tracing::debug!("Inserted {} rows into ClickHouse", entries.len());
        Ok(entries.len() as u64)
    }

    async fn query_logs(&self, query: &LogQuery) -> PipelineResult<LogPage> {
        let query = query.clone().normalized();
        let (where_sql, binds) = where_clause(&query);

        let total = self
            .count_logs(&where_sql, &binds)
            .await
            .map_err(PipelineError::persistence)?;

        let sql = format!(
            "SELECT {} FROM logs FINAL {} ORDER BY timestamp DESC, job_id, line_index LIMIT ? OFFSET ?",
            LOG_COLUMNS, where_sql
        );
        let rows = bind_all(self.client.query(&sql), &binds)
            .bind(query.page_size as u64)
            .bind(query.offset() as u64)
            .fetch_all::<LogRow>()
            .await
            .map_err(PipelineError::persistence)?;

        let logs = rows.into_iter().map(LogEntry::from).collect();
        Ok(LogPage::new(logs, total, &query))
    }

    async fn analytics(&self, now: DateTime<Utc>) -> PipelineResult<Analytics> {
        self.fetch_analytics(now).await.map_err(PipelineError::persistence)
    }

    async fn recent_entries(&self, ids: &[String], limit: usize) -> PipelineResult<Vec<LogEntry>> {
        let filter = if ids.is_empty() {
            ""
        } else {
            "WHERE has(?, concat(job_id, ':', toString(line_index)))"
        };
        let sql = format!(
            "SELECT {} FROM logs FINAL {} ORDER BY timestamp DESC LIMIT ?",
            LOG_COLUMNS, filter
        );

        let mut q = self.client.query(&sql);
        if !ids.is_empty() {
            q = q.bind(ids);
        }
        let rows = q
            .bind(limit as u64)
            .fetch_all::<LogRow>()
            .await
            .map_err(PipelineError::persistence)?;

        Ok(rows.into_iter().map(LogEntry::from).collect())
    }

    fn name(&self) -> &str {
        "clickhouse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> LogEntry {
        LogEntry {
            job_id: "JOB-test".to_string(),
            line_index: index,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            level: LogLevel::Error,
            service: "api".to_string(),
            message: "Test error".to_string(),
            raw_line: "2024-03-10T12:00:00Z ERROR api - Test error".to_string(),
            anomaly_score: 0.5,
            extra: None,
        }
    }

    #[test]
    fn test_insert_row_format() {
        let entry = entry(3);
        let json = serde_json::to_value(LogInsertRow::from(&entry)).unwrap();

        assert_eq!(json["timestamp"], "2024-03-10 12:00:00.000");
        assert_eq!(json["level"], "ERROR");
        assert_eq!(json["line_index"], 3);
        assert!(json["extra"].is_null());
    }

    #[test]
    fn test_where_clause_binds_in_order() {
        let query = LogQuery {
            service: Some("api".to_string()),
            level: Some(LogLevel::Warn),
            search: Some("timeout".to_string()),
            ..LogQuery::new()
        };
        let (sql, binds) = where_clause(&query);

        assert_eq!(
            sql,
            "WHERE service = ? AND level = ? AND positionCaseInsensitiveUTF8(message, ?) > 0"
        );
        assert_eq!(binds.len(), 3);
        assert!(matches!(&binds[1], BindValue::Str(s) if s == "WARN"));
    }

    #[test]
    fn test_empty_where_clause() {
        let (sql, binds) = where_clause(&LogQuery::new());
        assert!(sql.is_empty());
        assert!(binds.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires ClickHouse running
    async fn test_clickhouse_roundtrip() {
        let store = ClickHouseStore::new("http://localhost:8123", None, None, "default").unwrap();
        store.init().await.unwrap();

        let mut job = Job::new("ch.log", Utc::now());
        store.insert_job(&job).await.unwrap();

        let entries: Vec<LogEntry> = (0..3)
            .map(|i| LogEntry {
                job_id: job.job_id.clone(),
                ..entry(i)
            })
            .collect();
        assert_eq!(store.insert_entries(&entries).await.unwrap(), 3);
        // Redelivery collapses onto the same keys
        store.insert_entries(&entries).await.unwrap();

        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();
        store.update_job(&job).await.unwrap();
        let stored = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        let page = store
            .query_logs(&LogQuery {
                job_id: Some(job.job_id.clone()),
                ..LogQuery::new()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    #[ignore]
    async fn test_clickhouse_ping() {
        let store = ClickHouseStore::new("http://localhost:8123", None, None, "default").unwrap();
        assert!(store.ping().await);
    }
}
