//! SQLite result sink
//!
//! Stores scraped pages and finished job summaries in a local SQLite file.

use crate::fetch::PageContent;
use crate::job::{Job, JobId};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ResultSink, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A stored page row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub job_id: String,
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub title: Option<String>,
    pub body: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
}

/// A stored job summary row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub tenant_id: String,
    pub tier: String,
    pub status: String,
    pub total_pages: u32,
    pub pages_scraped: u32,
    pub errors: Vec<String>,
}

/// SQLite-backed `ResultSink`
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Opens or creates the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a page, replacing an earlier copy of the same URL in the same job
    pub fn store_page(&self, job_id: JobId, url: &str, page: &PageContent) -> StorageResult<()> {
        let links = serde_json::to_string(&page.links)?;
        let images = serde_json::to_string(&page.images)?;

        self.conn().execute(
            "INSERT INTO pages (job_id, url, final_url, status_code, content_type, title, body, links, images, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(job_id, url) DO UPDATE SET
                final_url = excluded.final_url,
                status_code = excluded.status_code,
                content_type = excluded.content_type,
                title = excluded.title,
                body = excluded.body,
                links = excluded.links,
                images = excluded.images,
                scraped_at = excluded.scraped_at",
            params![
                job_id.to_string(),
                url,
                page.final_url,
                page.status_code,
                page.content_type,
                page.title,
                page.body,
                links,
                images,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Inserts or updates a job summary
    pub fn store_job(&self, job: &Job) -> StorageResult<()> {
        let errors = serde_json::to_string(&job.error_messages())?;

        self.conn().execute(
            "INSERT INTO jobs (id, tenant_id, tier, status, total_pages, pages_scraped, created_at, started_at, completed_at, errors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                pages_scraped = excluded.pages_scraped,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                errors = excluded.errors",
            params![
                job.id.to_string(),
                job.tenant_id,
                job.tier.as_str(),
                job.status.as_str(),
                job.total_pages(),
                job.pages_scraped(),
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                errors,
            ],
        )?;
        Ok(())
    }

    pub fn get_page(&self, job_id: JobId, url: &str) -> StorageResult<Option<StoredPage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT job_id, url, final_url, status_code, title, body, links, images
             FROM pages WHERE job_id = ?1 AND url = ?2",
        )?;

        let row = stmt
            .query_row(params![job_id.to_string(), url], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u16>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .optional()?;

        let Some((job_id, url, final_url, status_code, title, body, links, images)) = row else {
            return Ok(None);
        };

        Ok(Some(StoredPage {
            job_id,
            url,
            final_url,
            status_code,
            title,
            body,
            links: serde_json::from_str(&links)?,
            images: serde_json::from_str(&images)?,
        }))
    }

    /// Number of pages stored for a job
    pub fn page_count(&self, job_id: JobId) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM pages WHERE job_id = ?1",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_job(&self, job_id: JobId) -> StorageResult<Option<JobRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, tier, status, total_pages, pages_scraped, errors
                 FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, tenant_id, tier, status, total_pages, pages_scraped, errors)) = row else {
            return Ok(None);
        };

        Ok(Some(JobRecord {
            id,
            tenant_id,
            tier,
            status,
            total_pages,
            pages_scraped,
            errors: serde_json::from_str(&errors)?,
        }))
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn persist(&self, job_id: JobId, url: &str, page: &PageContent) -> StorageResult<()> {
        self.store_page(job_id, url, page)
    }

    async fn record_job(&self, job: &Job) -> StorageResult<()> {
        self.store_job(job)
    }
}
