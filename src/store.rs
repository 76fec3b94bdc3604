//! SQLite-backed store for the request hierarchy and service heartbeats.
//!
//! Every public method is one transactional unit: it commits or rolls back as
//! a whole, and no transaction is held across grid backend calls. Loads of
//! request subtrees are eager (three queries, stitched in memory) so a
//! monitoring cycle never goes back to the database per child row.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use log::info;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use thiserror::Error;

use crate::models::{
    GridJobModel, LocalStatus, ParametricJobModel, RequestModel, ServiceModel, ServiceStatus,
};

/// Embedded schema migrations, applied by [`Store::connect`] and the daemon
/// at startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Store failures. `NotFound`/`MultipleResults` indicate a genuine bug or
/// race (a caller named a record that should exist exactly once) and must not
/// be silently swallowed; the monitoring loop's per-request boundary logs
/// them without halting the loop.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No {entity} found for {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Multiple {entity} rows found for {key}")]
    MultipleResults { entity: &'static str, key: String },

    #[error("Invalid {column} value {value:?} in {entity} row")]
    InvalidColumn {
        entity: &'static str,
        column: &'static str,
        value: String,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

fn parse_status<T>(
    entity: &'static str,
    column: &'static str,
    value: &str,
) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|_| StoreError::InvalidColumn {
        entity,
        column,
        value: value.to_string(),
    })
}

fn request_from_row(row: &SqliteRow) -> Result<RequestModel, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(RequestModel {
        id: row.try_get("id")?,
        requester_id: row.try_get("requester_id")?,
        description: row.try_get("description")?,
        request_date: row.try_get("request_date")?,
        status: parse_status("request", "status", &status)?,
        timestamp: row.try_get("timestamp")?,
        parametric_jobs: Vec::new(),
    })
}

fn parametricjob_from_row(row: &SqliteRow) -> Result<ParametricJobModel, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ParametricJobModel {
        request_id: row.try_get("request_id")?,
        id: row.try_get("id")?,
        requester_id: row.try_get("requester_id")?,
        priority: row.try_get("priority")?,
        site: row.try_get("site")?,
        status: parse_status("parametricjob", "status", &status)?,
        reschedule: row.try_get("reschedule")?,
        num_jobs: row.try_get("num_jobs")?,
        num_completed: row.try_get("num_completed")?,
        num_failed: row.try_get("num_failed")?,
        num_submitted: row.try_get("num_submitted")?,
        num_running: row.try_get("num_running")?,
        timestamp: row.try_get("timestamp")?,
        grid_jobs: Vec::new(),
    })
}

fn gridjob_from_row(row: &SqliteRow) -> Result<GridJobModel, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(GridJobModel {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        parametricjob_id: row.try_get("parametricjob_id")?,
        requester_id: row.try_get("requester_id")?,
        status: parse_status("gridjob", "status", &status)?,
        reschedules: row.try_get("reschedules")?,
    })
}

fn service_from_row(row: &SqliteRow) -> Result<ServiceModel, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ServiceModel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: parse_status("service", "status", &status)?,
        timestamp: row.try_get("timestamp")?,
    })
}

/// Handle to the SQLite store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) and migrate the database at `database_url`,
    /// configured with WAL journal mode and foreign key enforcement.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(45));

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new request with its parametric jobs, assigning the request
    /// id and (where unset) per-request parametric job sequence ids.
    pub async fn add_request(&self, request: &mut RequestModel) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        request.timestamp = now;

        let result = sqlx::query(
            r#"
            INSERT INTO requests (requester_id, description, request_date, status, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.requester_id)
        .bind(&request.description)
        .bind(request.request_date)
        .bind(request.status.to_string())
        .bind(request.timestamp)
        .execute(&mut *tx)
        .await?;
        request.id = result.last_insert_rowid();

        for (index, job) in request.parametric_jobs.iter_mut().enumerate() {
            job.request_id = request.id;
            if job.id == 0 {
                job.id = index as i64 + 1;
            }
            job.timestamp = now;

            sqlx::query(
                r#"
                INSERT INTO parametricjobs (request_id, id, requester_id, priority, site, status,
                                            reschedule, num_jobs, num_completed, num_failed,
                                            num_submitted, num_running, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.request_id)
            .bind(job.id)
            .bind(job.requester_id)
            .bind(job.priority)
            .bind(&job.site)
            .bind(job.status.to_string())
            .bind(job.reschedule)
            .bind(job.num_jobs)
            .bind(job.num_completed)
            .bind(job.num_failed)
            .bind(job.num_submitted)
            .bind(job.num_running)
            .bind(job.timestamp)
            .execute(&mut *tx)
            .await?;

            for grid_job in &mut job.grid_jobs {
                grid_job.request_id = job.request_id;
                grid_job.parametricjob_id = job.id;
                upsert_gridjob(&mut tx, grid_job).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Merge the request subtree back into the database: the request row,
    /// every parametric job, and every grid job, in one transaction. Grid job
    /// rows no longer present on the model (replaced by a resubmission) are
    /// removed.
    pub async fn save_request(&self, request: &RequestModel) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET requester_id = ?, description = ?, status = ?, timestamp = ?
            WHERE id = ?
            "#,
        )
        .bind(request.requester_id)
        .bind(&request.description)
        .bind(request.status.to_string())
        .bind(now)
        .bind(request.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "request",
                key: request.id.to_string(),
            });
        }

        for job in &request.parametric_jobs {
            sqlx::query(
                r#"
                INSERT INTO parametricjobs (request_id, id, requester_id, priority, site, status,
                                            reschedule, num_jobs, num_completed, num_failed,
                                            num_submitted, num_running, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (request_id, id) DO UPDATE SET
                    requester_id = excluded.requester_id,
                    priority = excluded.priority,
                    site = excluded.site,
                    status = excluded.status,
                    reschedule = excluded.reschedule,
                    num_jobs = excluded.num_jobs,
                    num_completed = excluded.num_completed,
                    num_failed = excluded.num_failed,
                    num_submitted = excluded.num_submitted,
                    num_running = excluded.num_running,
                    timestamp = excluded.timestamp
                "#,
            )
            .bind(job.request_id)
            .bind(job.id)
            .bind(job.requester_id)
            .bind(job.priority)
            .bind(&job.site)
            .bind(job.status.to_string())
            .bind(job.reschedule)
            .bind(job.num_jobs)
            .bind(job.num_completed)
            .bind(job.num_failed)
            .bind(job.num_submitted)
            .bind(job.num_running)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if job.grid_jobs.is_empty() {
                sqlx::query("DELETE FROM gridjobs WHERE request_id = ? AND parametricjob_id = ?")
                    .bind(job.request_id)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                // String formatting because sqlx doesn't support parameterized
                // IN clauses; the ids are integers.
                let ids = job
                    .grid_jobs
                    .iter()
                    .map(|grid_job| grid_job.id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!(
                    "DELETE FROM gridjobs WHERE request_id = ? AND parametricjob_id = ? \
                     AND id NOT IN ({})",
                    ids
                );
                sqlx::query(&sql)
                    .bind(job.request_id)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await?;

                for grid_job in &job.grid_jobs {
                    upsert_gridjob(&mut tx, grid_job).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a single request with its full subtree.
    pub async fn get_request(&self, request_id: i64) -> Result<RequestModel, StoreError> {
        let rows = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;

        let mut requests = match rows.len() {
            0 => {
                return Err(StoreError::NotFound {
                    entity: "request",
                    key: request_id.to_string(),
                });
            }
            1 => vec![request_from_row(&rows[0])?],
            _ => {
                return Err(StoreError::MultipleResults {
                    entity: "request",
                    key: request_id.to_string(),
                });
            }
        };

        self.load_children(&mut requests).await?;
        Ok(requests.remove(0))
    }

    /// Fetch every request whose status is in `statuses`, eager-loaded with
    /// parametric jobs and grid jobs, ordered by id.
    pub async fn get_requests(
        &self,
        statuses: &[LocalStatus],
    ) -> Result<Vec<RequestModel>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let clause = statuses
            .iter()
            .map(|status| format!("'{}'", status))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM requests WHERE status IN ({}) ORDER BY id",
            clause
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut requests = rows
            .iter()
            .map(request_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.load_children(&mut requests).await?;
        Ok(requests)
    }

    /// Fetch FAILED requests owning at least one parametric job with the
    /// manual reschedule flag set, eager-loaded like [`Store::get_requests`].
    pub async fn get_reschedule_requests(&self) -> Result<Vec<RequestModel>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT r.* FROM requests r \
             JOIN parametricjobs p ON p.request_id = r.id \
             WHERE r.status = '{}' AND p.reschedule = 1 ORDER BY r.id",
            LocalStatus::Failed
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut requests = rows
            .iter()
            .map(request_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.load_children(&mut requests).await?;
        Ok(requests)
    }

    /// Delete a request; parametric jobs and grid jobs cascade at the schema
    /// level. The caller is responsible for remote cleanup first.
    pub async fn delete_request(&self, request_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "request",
                key: request_id.to_string(),
            });
        }
        tx.commit().await?;
        info!("Request {} deleted.", request_id);
        Ok(())
    }

    /// Create or refresh a service heartbeat record.
    pub async fn upsert_service(
        &self,
        name: &str,
        status: ServiceStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO services (name, status, timestamp)
            VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                status = excluded.status,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(name)
        .bind(status.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceModel, StoreError> {
        let rows = sqlx::query("SELECT * FROM services WHERE name = ?")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;

        match rows.len() {
            0 => Err(StoreError::NotFound {
                entity: "service",
                key: name.to_string(),
            }),
            1 => service_from_row(&rows[0]),
            _ => Err(StoreError::MultipleResults {
                entity: "service",
                key: name.to_string(),
            }),
        }
    }

    pub async fn get_services(&self) -> Result<Vec<ServiceModel>, StoreError> {
        let rows = sqlx::query("SELECT * FROM services ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    /// Attach parametric jobs and grid jobs to the given requests with one
    /// query per table.
    async fn load_children(&self, requests: &mut [RequestModel]) -> Result<(), StoreError> {
        if requests.is_empty() {
            return Ok(());
        }

        let id_list = requests
            .iter()
            .map(|request| request.id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let sql = format!(
            "SELECT * FROM parametricjobs WHERE request_id IN ({}) ORDER BY request_id, id",
            id_list
        );
        let job_rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut jobs = job_rows
            .iter()
            .map(parametricjob_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT * FROM gridjobs WHERE request_id IN ({}) \
             ORDER BY request_id, parametricjob_id, id",
            id_list
        );
        let grid_rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut grid_jobs_by_parent: HashMap<(i64, i64), Vec<GridJobModel>> = HashMap::new();
        for row in &grid_rows {
            let grid_job = gridjob_from_row(row)?;
            grid_jobs_by_parent
                .entry((grid_job.request_id, grid_job.parametricjob_id))
                .or_default()
                .push(grid_job);
        }

        let mut jobs_by_request: HashMap<i64, Vec<ParametricJobModel>> = HashMap::new();
        for mut job in jobs.drain(..) {
            job.grid_jobs = grid_jobs_by_parent
                .remove(&(job.request_id, job.id))
                .unwrap_or_default();
            jobs_by_request.entry(job.request_id).or_default().push(job);
        }

        for request in requests {
            request.parametric_jobs = jobs_by_request.remove(&request.id).unwrap_or_default();
        }
        Ok(())
    }
}

async fn upsert_gridjob(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    grid_job: &GridJobModel,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO gridjobs (id, request_id, parametricjob_id, requester_id, status, reschedules)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (request_id, parametricjob_id, id) DO UPDATE SET
            requester_id = excluded.requester_id,
            status = excluded.status,
            reschedules = excluded.reschedules
        "#,
    )
    .bind(grid_job.id)
    .bind(grid_job.request_id)
    .bind(grid_job.parametricjob_id)
    .bind(grid_job.requester_id)
    .bind(grid_job.status.to_string())
    .bind(grid_job.reschedules)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
