use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{install_default_drivers, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row, Transaction};

use crate::config::ConfigEntry;
use crate::error::{EngineError, EngineResult};
use crate::store::{JobPatch, JobStore, SummaryPatch, SummaryStore, UpdateOutcome};
use crate::types::{Job, JobFilter, JobId, JobStatus, RetryHistory, SummaryFilter, TaskSummary};

/// Placeholder and quirk selection for the two supported engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> EngineResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(EngineError::Storage(format!(
                "unsupported database url scheme: {other:?}"
            ))),
        }
    }
}

/// Relational store over Postgres or SQLite through sqlx's `Any` driver.
///
/// `Any` cannot bind native timestamps, so all instants are stored as
/// fixed-width RFC 3339 TEXT (UTC, microsecond precision); lexicographic
/// comparison then matches chronological order. Job updates, their history
/// rows and the summary counter adjustments commit in one transaction.
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: SqlDialect,
}

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS taskmill_jobs (
        id TEXT PRIMARY KEY,
        task_name TEXT NOT NULL,
        arguments TEXT NOT NULL,
        retries BIGINT NOT NULL,
        max_retry BIGINT NOT NULL,
        retry_interval TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        result TEXT NOT NULL,
        current_progress BIGINT NOT NULL,
        max_progress BIGINT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        finished_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS taskmill_retry_histories (
        job_id TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT NOT NULL,
        error_stack TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS taskmill_summaries (
        task_name TEXT PRIMARY KEY,
        queueing BIGINT NOT NULL DEFAULT 0,
        retrying BIGINT NOT NULL DEFAULT 0,
        success BIGINT NOT NULL DEFAULT 0,
        failure BIGINT NOT NULL DEFAULT 0,
        stopped BIGINT NOT NULL DEFAULT 0,
        is_loading BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS taskmill_configurations (
        key TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        is_active BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_taskmill_jobs_task_status
        ON taskmill_jobs (task_name, status)",
    "CREATE INDEX IF NOT EXISTS idx_taskmill_jobs_created_at
        ON taskmill_jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_taskmill_histories_job_id
        ON taskmill_retry_histories (job_id)",
];

const JOB_COLUMNS: &str = "id, task_name, arguments, retries, max_retry, retry_interval, \
     status, error, trace_id, result, current_progress, max_progress, \
     created_at, updated_at, finished_at";

const HISTORY_COLUMNS: &str =
    "job_id, status, error, error_stack, trace_id, started_at, ended_at";

impl SqlStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        install_default_drivers();
        let dialect = SqlDialect::from_url(url)?;
        // a single connection keeps sqlite writers serialized and :memory:
        // databases coherent across the pool
        let (min, max) = match dialect {
            SqlDialect::Postgres => (0, 5),
            SqlDialect::Sqlite => (1, 1),
        };
        let pool = AnyPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .connect(url)
            .await?;
        Self::with_pool(pool, dialect).await
    }

    /// Wrap an existing pool, creating the schema if it is missing
    pub async fn with_pool(pool: AnyPool, dialect: SqlDialect) -> EngineResult<Self> {
        let store = Self { pool, dialect };
        store.migrate().await?;
        Ok(store)
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn migrate(&self) -> EngineResult<()> {
        for statement in DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_matching_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let mut q = SqlQuery::new(
            self.dialect,
            &format!("SELECT {JOB_COLUMNS} FROM taskmill_jobs"),
        );
        q.push_job_filter(filter);
        q.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            let page = filter.page.unwrap_or(1).max(1);
            q.push(" LIMIT ");
            q.bind_int(limit as i64);
            q.push(" OFFSET ");
            q.bind_int(((page - 1) * limit) as i64);
        }
        let rows = bind_args(&q.sql, &q.args).fetch_all(&self.pool).await?;
        let mut jobs = rows.iter().map(job_from_row).collect::<EngineResult<Vec<_>>>()?;
        self.attach_histories(&mut jobs).await?;
        Ok(jobs)
    }

    async fn attach_histories(&self, jobs: &mut [Job]) -> EngineResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut q = SqlQuery::new(
            self.dialect,
            &format!("SELECT {HISTORY_COLUMNS} FROM taskmill_retry_histories WHERE job_id IN ("),
        );
        for (i, job) in jobs.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.bind_text(job.id.as_str());
        }
        q.push(") ORDER BY started_at ASC");
        let rows = bind_args(&q.sql, &q.args).fetch_all(&self.pool).await?;

        let mut grouped: HashMap<String, Vec<RetryHistory>> = HashMap::new();
        for row in &rows {
            let job_id: String = row.try_get("job_id")?;
            grouped.entry(job_id).or_default().push(history_from_row(row)?);
        }
        for job in jobs.iter_mut() {
            if let Some(histories) = grouped.remove(job.id.as_str()) {
                job.retry_histories = histories;
            }
        }
        Ok(())
    }

    async fn insert_history_tx(
        &self,
        tx: &mut Transaction<'_, Any>,
        job_id: &JobId,
        history: &RetryHistory,
    ) -> EngineResult<()> {
        let mut q = SqlQuery::new(
            self.dialect,
            &format!("INSERT INTO taskmill_retry_histories ({HISTORY_COLUMNS}) VALUES ("),
        );
        q.bind_text(job_id.as_str());
        q.push(", ");
        q.bind_text(history.status.as_str());
        q.push(", ");
        q.bind_text(history.error.clone());
        q.push(", ");
        q.bind_text(history.error_stack.clone());
        q.push(", ");
        q.bind_text(history.trace_id.clone());
        q.push(", ");
        q.bind_text(fmt_ts(&history.started_at));
        q.push(", ");
        q.bind_text(fmt_ts(&history.ended_at));
        q.push(")");
        bind_args(&q.sql, &q.args).execute(&mut **tx).await?;
        Ok(())
    }

    /// Upsert signed counter adjustments for one task
    async fn apply_summary_deltas_tx(
        &self,
        tx: &mut Transaction<'_, Any>,
        task_name: &str,
        deltas: &[(JobStatus, i64)],
    ) -> EngineResult<()> {
        let mut counts = [0i64; 5];
        for (status, delta) in deltas {
            let idx = JobStatus::ALL
                .iter()
                .position(|s| s == status)
                .unwrap_or_default();
            counts[idx] += delta;
        }
        let mut q = SqlQuery::new(
            self.dialect,
            "INSERT INTO taskmill_summaries \
             (task_name, queueing, retrying, success, failure, stopped, is_loading) VALUES (",
        );
        q.bind_text(task_name);
        for count in counts {
            q.push(", ");
            q.bind_int(count);
        }
        q.push(", 0) ON CONFLICT (task_name) DO UPDATE SET \
             queueing = taskmill_summaries.queueing + excluded.queueing, \
             retrying = taskmill_summaries.retrying + excluded.retrying, \
             success = taskmill_summaries.success + excluded.success, \
             failure = taskmill_summaries.failure + excluded.failure, \
             stopped = taskmill_summaries.stopped + excluded.stopped");
        bind_args(&q.sql, &q.args).execute(&mut **tx).await?;
        Ok(())
    }
}

impl fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStore")
            .field("dialect", &self.dialect)
            .finish()
    }
}

#[async_trait]
impl SummaryStore for SqlStore {
    async fn find_all_summary(&self, filter: &SummaryFilter) -> EngineResult<Vec<TaskSummary>> {
        let q = SqlQuery::new(
            self.dialect,
            "SELECT task_name, queueing, retrying, success, failure, stopped, is_loading \
             FROM taskmill_summaries ORDER BY task_name",
        );
        let rows = bind_args(&q.sql, &q.args).fetch_all(&self.pool).await?;
        let mut summaries = Vec::new();
        for row in &rows {
            let summary = summary_from_row(row)?;
            if filter.matches(&summary.task_name) {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    async fn find_detail_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>> {
        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT task_name, queueing, retrying, success, failure, stopped, is_loading \
             FROM taskmill_summaries WHERE task_name = ",
        );
        q.bind_text(task_name);
        let row = bind_args(&q.sql, &q.args).fetch_optional(&self.pool).await?;
        row.as_ref().map(summary_from_row).transpose()
    }

    async fn update_summary(&self, task_name: &str, patch: &SummaryPatch) -> EngineResult<()> {
        let mut columns: Vec<(&str, i64)> = Vec::new();
        if let Some(v) = patch.queueing {
            columns.push(("queueing", v));
        }
        if let Some(v) = patch.retrying {
            columns.push(("retrying", v));
        }
        if let Some(v) = patch.success {
            columns.push(("success", v));
        }
        if let Some(v) = patch.failure {
            columns.push(("failure", v));
        }
        if let Some(v) = patch.stopped {
            columns.push(("stopped", v));
        }
        if let Some(v) = patch.is_loading {
            columns.push(("is_loading", i64::from(v)));
        }
        if columns.is_empty() {
            return Ok(());
        }

        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let mut q = SqlQuery::new(
            self.dialect,
            &format!(
                "INSERT INTO taskmill_summaries (task_name, {}) VALUES (",
                names.join(", ")
            ),
        );
        q.bind_text(task_name);
        for (_, value) in &columns {
            q.push(", ");
            q.bind_int(*value);
        }
        q.push(") ON CONFLICT (task_name) DO UPDATE SET ");
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push(&format!("{name} = excluded.{name}"));
        }
        bind_args(&q.sql, &q.args).execute(&self.pool).await?;
        Ok(())
    }

    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[(JobStatus, i64)],
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        self.apply_summary_deltas_tx(&mut tx, task_name, deltas).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqlStore {
    async fn save_job(&self, job: &Job) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let mut q = SqlQuery::new(
            self.dialect,
            &format!("INSERT INTO taskmill_jobs ({JOB_COLUMNS}) VALUES ("),
        );
        q.bind_text(job.id.as_str());
        q.push(", ");
        q.bind_text(job.task_name.clone());
        q.push(", ");
        q.bind_text(job.arguments.clone());
        q.push(", ");
        q.bind_int(i64::from(job.retries));
        q.push(", ");
        q.bind_int(i64::from(job.max_retry));
        q.push(", ");
        q.bind_text(job.interval.clone());
        q.push(", ");
        q.bind_text(job.status.as_str());
        q.push(", ");
        q.bind_text(job.error.clone());
        q.push(", ");
        q.bind_text(job.trace_id.clone());
        q.push(", ");
        q.bind_text(job.result.clone());
        q.push(", ");
        q.bind_int(job.current_progress as i64);
        q.push(", ");
        q.bind_int(job.max_progress as i64);
        q.push(", ");
        q.bind_text(fmt_ts(&job.created_at));
        q.push(", ");
        q.bind_text(fmt_ts(&job.updated_at));
        q.push(", ");
        match &job.finished_at {
            Some(ts) => q.bind_text(fmt_ts(ts)),
            None => q.push("NULL"),
        }
        q.push(")");
        bind_args(&q.sql, &q.args).execute(&mut *tx).await?;

        for history in &job.retry_histories {
            self.insert_history_tx(&mut tx, &job.id, history).await?;
        }
        self.apply_summary_deltas_tx(&mut tx, &job.task_name, &[(job.status, 1)])
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_job(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
        histories: &[RetryHistory],
    ) -> EngineResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT id, task_name, status FROM taskmill_jobs",
        );
        q.push_job_filter(filter);
        let rows = bind_args(&q.sql, &q.args).fetch_all(&mut *tx).await?;
        let matched = rows.len() as u64;
        if matched == 0 {
            tx.commit().await?;
            return Ok(UpdateOutcome::default());
        }

        let mut affected = 0u64;
        let mut deltas: BTreeMap<String, Vec<(JobStatus, i64)>> = BTreeMap::new();

        for row in &rows {
            let id: String = row.try_get("id")?;
            let task_name: String = row.try_get("task_name")?;
            let old_status: JobStatus = row.try_get::<String, _>("status")?.parse()?;

            let mut q = SqlQuery::new(self.dialect, "UPDATE taskmill_jobs SET ");
            q.push_job_patch(patch);
            q.push(" WHERE id = ");
            q.bind_text(id.as_str());
            let result = bind_args(&q.sql, &q.args).execute(&mut *tx).await?;
            affected += result.rows_affected();

            let job_id = JobId::from(id);
            for history in histories {
                self.insert_history_tx(&mut tx, &job_id, history).await?;
            }
            if let Some(new_status) = patch.status {
                if new_status != old_status {
                    deltas
                        .entry(task_name)
                        .or_default()
                        .extend([(old_status, -1), (new_status, 1)]);
                }
            }
        }
        for (task_name, task_deltas) in &deltas {
            self.apply_summary_deltas_tx(&mut tx, task_name, task_deltas).await?;
        }
        tx.commit().await?;
        Ok(UpdateOutcome { matched, affected })
    }

    async fn find_job_by_id(&self, id: &JobId) -> EngineResult<Option<Job>> {
        let mut q = SqlQuery::new(
            self.dialect,
            &format!("SELECT {JOB_COLUMNS} FROM taskmill_jobs WHERE id = "),
        );
        q.bind_text(id.as_str());
        let row = bind_args(&q.sql, &q.args).fetch_optional(&self.pool).await?;
        let Some(row) = row else { return Ok(None) };
        let mut jobs = vec![job_from_row(&row)?];
        self.attach_histories(&mut jobs).await?;
        Ok(jobs.pop())
    }

    async fn find_all_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        self.fetch_matching_jobs(filter).await
    }

    async fn count_all_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT COUNT(*) AS n FROM taskmill_jobs",
        );
        q.push_job_filter(filter);
        let row = bind_args(&q.sql, &q.args).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    async fn aggregate_all_task_jobs(
        &self,
        filter: &JobFilter,
    ) -> EngineResult<Vec<TaskSummary>> {
        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT task_name, status, COUNT(*) AS n FROM taskmill_jobs",
        );
        q.push_job_filter(filter);
        q.push(" GROUP BY task_name, status ORDER BY task_name");
        let rows = bind_args(&q.sql, &q.args).fetch_all(&self.pool).await?;

        let mut grouped: BTreeMap<String, TaskSummary> = BTreeMap::new();
        for row in &rows {
            let task_name: String = row.try_get("task_name")?;
            let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
            let n: i64 = row.try_get("n")?;
            grouped
                .entry(task_name.clone())
                .or_insert_with(|| TaskSummary::new(&task_name))
                .set(status, n);
        }
        Ok(grouped.into_values().collect())
    }

    async fn clean_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        let mut tx = self.pool.begin().await?;

        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT id, task_name, status FROM taskmill_jobs",
        );
        q.push_job_filter(filter);
        let rows = bind_args(&q.sql, &q.args).fetch_all(&mut *tx).await?;
        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut ids: Vec<String> = Vec::with_capacity(rows.len());
        let mut deltas: BTreeMap<String, Vec<(JobStatus, i64)>> = BTreeMap::new();
        for row in &rows {
            let id: String = row.try_get("id")?;
            let task_name: String = row.try_get("task_name")?;
            let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
            ids.push(id);
            deltas.entry(task_name).or_default().push((status, -1));
        }

        for (table, column) in [
            ("taskmill_retry_histories", "job_id"),
            ("taskmill_jobs", "id"),
        ] {
            let mut q = SqlQuery::new(
                self.dialect,
                &format!("DELETE FROM {table} WHERE {column} IN ("),
            );
            for (i, id) in ids.iter().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.bind_text(id.as_str());
            }
            q.push(")");
            bind_args(&q.sql, &q.args).execute(&mut *tx).await?;
        }
        for (task_name, task_deltas) in &deltas {
            self.apply_summary_deltas_tx(&mut tx, task_name, task_deltas).await?;
        }
        tx.commit().await?;
        Ok(ids.len())
    }

    async fn delete_job(&self, id: &JobId) -> EngineResult<Option<Job>> {
        let Some(job) = self.find_job_by_id(id).await? else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await?;
        for (table, column) in [
            ("taskmill_retry_histories", "job_id"),
            ("taskmill_jobs", "id"),
        ] {
            let mut q = SqlQuery::new(
                self.dialect,
                &format!("DELETE FROM {table} WHERE {column} = "),
            );
            q.bind_text(id.as_str());
            bind_args(&q.sql, &q.args).execute(&mut *tx).await?;
        }
        self.apply_summary_deltas_tx(&mut tx, &job.task_name, &[(job.status, -1)])
            .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn find_configuration(&self, key: &str) -> EngineResult<Option<ConfigEntry>> {
        let mut q = SqlQuery::new(
            self.dialect,
            "SELECT key, name, value, is_active FROM taskmill_configurations WHERE key = ",
        );
        q.bind_text(key);
        let row = bind_args(&q.sql, &q.args).fetch_optional(&self.pool).await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn set_configuration(&self, entry: &ConfigEntry) -> EngineResult<()> {
        let mut q = SqlQuery::new(
            self.dialect,
            "INSERT INTO taskmill_configurations (key, name, value, is_active) VALUES (",
        );
        q.bind_text(entry.key.clone());
        q.push(", ");
        q.bind_text(entry.name.clone());
        q.push(", ");
        q.bind_text(entry.value.clone());
        q.push(", ");
        q.bind_int(i64::from(entry.is_active));
        q.push(") ON CONFLICT (key) DO UPDATE SET \
             name = excluded.name, value = excluded.value, is_active = excluded.is_active");
        bind_args(&q.sql, &q.args).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_configurations(&self) -> EngineResult<Vec<ConfigEntry>> {
        let q = SqlQuery::new(
            self.dialect,
            "SELECT key, name, value, is_active FROM taskmill_configurations ORDER BY key",
        );
        let rows = bind_args(&q.sql, &q.args).fetch_all(&self.pool).await?;
        rows.iter().map(config_from_row).collect()
    }
}

/// Incrementally built statement with positional arguments.
/// Arguments are pushed in placeholder order, so `$n` numbering stays in sync.
struct SqlQuery {
    dialect: SqlDialect,
    sql: String,
    args: Vec<SqlArg>,
    has_where: bool,
}

enum SqlArg {
    Text(String),
    Int(i64),
}

impl SqlQuery {
    fn new(dialect: SqlDialect, base: &str) -> Self {
        Self {
            dialect,
            sql: base.to_string(),
            args: Vec::new(),
            has_where: false,
        }
    }

    fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    fn and(&mut self) {
        if self.has_where {
            self.sql.push_str(" AND ");
        } else {
            self.sql.push_str(" WHERE ");
            self.has_where = true;
        }
    }

    fn bind_text(&mut self, value: impl Into<String>) {
        self.args.push(SqlArg::Text(value.into()));
        self.push_placeholder();
    }

    fn bind_int(&mut self, value: i64) {
        self.args.push(SqlArg::Int(value));
        self.push_placeholder();
    }

    fn push_placeholder(&mut self) {
        match self.dialect {
            SqlDialect::Postgres => {
                let n = self.args.len();
                self.sql.push_str(&format!("${n}"));
            }
            SqlDialect::Sqlite => self.sql.push('?'),
        }
    }

    fn push_name_list(&mut self, names: &[String]) {
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind_text(name.clone());
        }
    }

    fn push_job_filter(&mut self, filter: &JobFilter) {
        if let Some(id) = &filter.job_id {
            self.and();
            self.push("id = ");
            self.bind_text(id.as_str());
        }
        if let Some(name) = &filter.task_name {
            self.and();
            self.push("task_name = ");
            self.bind_text(name.clone());
        }
        if let Some(names) = &filter.task_names {
            self.and();
            if names.is_empty() {
                self.push("1 = 0");
            } else {
                self.push("task_name IN (");
                self.push_name_list(names);
                self.push(")");
            }
        }
        if let Some(excluded) = &filter.exclude_task_names {
            if !excluded.is_empty() {
                self.and();
                self.push("task_name NOT IN (");
                self.push_name_list(excluded);
                self.push(")");
            }
        }
        if !filter.statuses.is_empty() {
            self.and();
            self.push("status IN (");
            for (i, status) in filter.statuses.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.bind_text(status.as_str());
            }
            self.push(")");
        }
        if let Some(needle) = &filter.search {
            let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
            self.and();
            self.push("(LOWER(arguments) LIKE ");
            self.bind_text(pattern.clone());
            self.push(" ESCAPE '\\' OR LOWER(error) LIKE ");
            self.bind_text(pattern);
            self.push(" ESCAPE '\\')");
        }
        if let Some(before) = &filter.before_created_at {
            self.and();
            self.push("created_at < ");
            self.bind_text(fmt_ts(before));
        }
    }

    fn push_job_patch(&mut self, patch: &JobPatch) {
        let mut first = true;
        let mut comma = |q: &mut SqlQuery| {
            if first {
                first = false;
            } else {
                q.push(", ");
            }
        };
        if let Some(v) = patch.status {
            comma(self);
            self.push("status = ");
            self.bind_text(v.as_str());
        }
        if let Some(v) = patch.retries {
            comma(self);
            self.push("retries = ");
            self.bind_int(i64::from(v));
        }
        if let Some(v) = patch.max_retry {
            comma(self);
            self.push("max_retry = ");
            self.bind_int(i64::from(v));
        }
        if let Some(v) = &patch.arguments {
            comma(self);
            self.push("arguments = ");
            self.bind_text(v.clone());
        }
        if let Some(v) = &patch.interval {
            comma(self);
            self.push("retry_interval = ");
            self.bind_text(v.clone());
        }
        if let Some(v) = &patch.error {
            comma(self);
            self.push("error = ");
            self.bind_text(v.clone());
        }
        if let Some(v) = &patch.trace_id {
            comma(self);
            self.push("trace_id = ");
            self.bind_text(v.clone());
        }
        if let Some(v) = &patch.result {
            comma(self);
            self.push("result = ");
            self.bind_text(v.clone());
        }
        if let Some(v) = patch.current_progress {
            comma(self);
            self.push("current_progress = ");
            self.bind_int(v as i64);
        }
        if let Some(v) = patch.max_progress {
            comma(self);
            self.push("max_progress = ");
            self.bind_int(v as i64);
        }
        if let Some(finished) = patch.finished_at {
            comma(self);
            match finished {
                Some(ts) => {
                    self.push("finished_at = ");
                    self.bind_text(fmt_ts(&ts));
                }
                None => self.push("finished_at = NULL"),
            }
        }
        comma(self);
        self.push("updated_at = ");
        self.bind_text(fmt_ts(&Utc::now()));
    }
}

fn bind_args<'q>(sql: &'q str, args: &'q [SqlArg]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            SqlArg::Text(value) => query.bind(value.as_str()),
            SqlArg::Int(value) => query.bind(*value),
        };
    }
    query
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| EngineError::Serialization(format!("bad timestamp {raw:?}: {err}")))
}

/// Backslash-escape LIKE wildcards in a search term
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn job_from_row(row: &AnyRow) -> EngineResult<Job> {
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(Job {
        id: JobId::from(row.try_get::<String, _>("id")?),
        task_name: row.try_get("task_name")?,
        arguments: row.try_get("arguments")?,
        retries: row.try_get::<i64, _>("retries")?.max(0) as u32,
        max_retry: row.try_get::<i64, _>("max_retry")?.max(0) as u32,
        interval: row.try_get("retry_interval")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        error: row.try_get("error")?,
        trace_id: row.try_get("trace_id")?,
        result: row.try_get("result")?,
        current_progress: row.try_get::<i64, _>("current_progress")?.max(0) as u64,
        max_progress: row.try_get::<i64, _>("max_progress")?.max(0) as u64,
        retry_histories: Vec::new(),
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        finished_at: finished_at.map(|raw| parse_ts(&raw)).transpose()?,
    })
}

fn history_from_row(row: &AnyRow) -> EngineResult<RetryHistory> {
    Ok(RetryHistory {
        status: row.try_get::<String, _>("status")?.parse()?,
        error: row.try_get("error")?,
        error_stack: row.try_get("error_stack")?,
        trace_id: row.try_get("trace_id")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        ended_at: parse_ts(&row.try_get::<String, _>("ended_at")?)?,
    })
}

fn summary_from_row(row: &AnyRow) -> EngineResult<TaskSummary> {
    let task_name: String = row.try_get("task_name")?;
    let mut summary = TaskSummary::new(&task_name);
    summary.queueing = row.try_get("queueing")?;
    summary.retrying = row.try_get("retrying")?;
    summary.success = row.try_get("success")?;
    summary.failure = row.try_get("failure")?;
    summary.stopped = row.try_get("stopped")?;
    summary.is_loading = row.try_get::<i64, _>("is_loading")? != 0;
    Ok(summary)
}

fn config_from_row(row: &AnyRow) -> EngineResult<ConfigEntry> {
    Ok(ConfigEntry {
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        value: row.try_get("value")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store() -> SqlStore {
        SqlStore::connect("sqlite::memory:").await.unwrap()
    }

    fn queued(task: &str) -> Job {
        Job::new(task, r#"{"n":1}"#, 3, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = store().await;
        let job = queued("send-email");
        store.save_job(&job).await.unwrap();

        let loaded = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.task_name, "send-email");
        assert_eq!(loaded.status, JobStatus::Queueing);
        assert_eq!(loaded.interval, "1s");
        assert!(loaded.retry_histories.is_empty());
        assert!(loaded.finished_at.is_none());

        let summary = store.find_detail_summary("send-email").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 1);
        assert_eq!(summary.total(), 1);
    }

    #[tokio::test]
    async fn update_moves_summary_buckets_and_appends_history() {
        let store = store().await;
        let job = queued("resize");
        store.save_job(&job).await.unwrap();

        let now = Utc::now();
        let history = RetryHistory {
            status: JobStatus::Retrying,
            error: String::new(),
            error_stack: String::new(),
            trace_id: "t1".into(),
            started_at: now,
            ended_at: now,
        };
        let patch = JobPatch {
            status: Some(JobStatus::Retrying),
            retries: Some(1),
            ..Default::default()
        };
        let filter = JobFilter::new().with_job_id(job.id.clone());
        let outcome = store.update_job(&filter, &patch, &[history]).await.unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.affected, 1);

        let loaded = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Retrying);
        assert_eq!(loaded.retries, 1);
        assert_eq!(loaded.retry_histories.len(), 1);

        let summary = store.find_detail_summary("resize").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 0);
        assert_eq!(summary.retrying, 1);
    }

    #[tokio::test]
    async fn filters_by_status_and_search() {
        let store = store().await;
        let a = queued("report");
        let mut b = queued("report");
        b.arguments = r#"{"customer":"acme"}"#.into();
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();

        let filter = JobFilter::new()
            .with_task_name("report")
            .with_statuses(vec![JobStatus::Queueing]);
        assert_eq!(store.count_all_jobs(&filter).await.unwrap(), 2);

        let filter = JobFilter::new().with_search("ACME");
        let found = store.find_all_jobs(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);

        let filter = JobFilter::new().with_task_name("report").with_page(1, 1);
        assert_eq!(store.find_all_jobs(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clean_removes_jobs_and_counters() {
        let store = store().await;
        let job = queued("tmp");
        store.save_job(&job).await.unwrap();

        let patch = JobPatch {
            status: Some(JobStatus::Success),
            ..Default::default()
        };
        let filter = JobFilter::new().with_job_id(job.id.clone());
        store.update_job(&filter, &patch, &[]).await.unwrap();

        let cleaned = store
            .clean_jobs(&JobFilter::new().with_statuses(vec![JobStatus::Success]))
            .await
            .unwrap();
        assert_eq!(cleaned, 1);
        assert!(store.find_job_by_id(&job.id).await.unwrap().is_none());

        let summary = store.find_detail_summary("tmp").await.unwrap().unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[tokio::test]
    async fn aggregate_recounts_from_rows() {
        let store = store().await;
        store.save_job(&queued("a")).await.unwrap();
        store.save_job(&queued("a")).await.unwrap();
        store.save_job(&queued("b")).await.unwrap();

        let summaries = store
            .aggregate_all_task_jobs(&JobFilter::new())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].task_name, "a");
        assert_eq!(summaries[0].queueing, 2);
        assert_eq!(summaries[1].task_name, "b");
        assert_eq!(summaries[1].queueing, 1);
    }

    #[tokio::test]
    async fn configuration_upsert() {
        let store = store().await;
        assert!(store.find_configuration("retention_age").await.unwrap().is_none());

        let entry = ConfigEntry::new("retention_age", "Job retention age", "720h");
        store.set_configuration(&entry).await.unwrap();
        let loaded = store.find_configuration("retention_age").await.unwrap().unwrap();
        assert_eq!(loaded, entry);

        let changed = ConfigEntry::new("retention_age", "Job retention age", "48h");
        store.set_configuration(&changed).await.unwrap();
        let loaded = store.find_configuration("retention_age").await.unwrap().unwrap();
        assert_eq!(loaded.value, "48h");
        assert_eq!(store.list_configurations().await.unwrap().len(), 1);
    }

    #[test]
    fn dialect_from_url() {
        assert_eq!(
            SqlDialect::from_url("postgres://localhost/db").unwrap(),
            SqlDialect::Postgres
        );
        assert_eq!(
            SqlDialect::from_url("sqlite::memory:").unwrap(),
            SqlDialect::Sqlite
        );
        assert!(SqlDialect::from_url("mysql://x").is_err());
    }
}
