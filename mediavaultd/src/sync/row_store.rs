use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};

use crate::model::{
    ChannelContainers, Container, PersistedRow, ProgressRecord, ProgressState, StatusCounts,
    UploadStatus,
};

use super::reconcile::{RowStore, StoreError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ROW_COLUMNS: &str = "file_id, file_name, status, upload_date, upload_error, attempts, \
    content_hash, remote_link, deleted_from_source";

/// SQLite-backed row store. Only `tracked_files` and `channel_progress`
/// are written; `annotations` belongs to whoever edits the sheet.
#[derive(Debug, Clone)]
pub struct SqliteRowStore {
    pool: SqlitePool,
}

impl SqliteRowStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("mediavault");
    path.push("state.db");
    Ok(path)
}

fn row_from(row: &SqliteRow) -> Result<PersistedRow, StoreError> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(PersistedRow {
        file_id: row.try_get("file_id")?,
        file_name: row.try_get("file_name")?,
        status: UploadStatus::parse(&status)?,
        upload_date: row.try_get("upload_date")?,
        upload_error: row.try_get("upload_error")?,
        attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
        content_hash: row.try_get("content_hash")?,
        remote_link: row.try_get("remote_link")?,
        deleted_from_source: row.try_get("deleted_from_source")?,
    })
}

fn container_from(id: Option<String>, name: Option<String>) -> Option<Container> {
    id.map(|id| Container {
        name: name.unwrap_or_default(),
        id,
    })
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn uncount(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn load_rows(&self, channel_id: &str) -> Result<Vec<PersistedRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM tracked_files WHERE channel_id = ?1 ORDER BY position ASC"
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from).collect()
    }

    async fn get_by_key(
        &self,
        channel_id: &str,
        file_id: &str,
    ) -> Result<Option<PersistedRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM tracked_files WHERE channel_id = ?1 AND file_id = ?2"
        ))
        .bind(channel_id)
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_from).transpose()
    }

    async fn upsert_by_key(&self, channel_id: &str, row: &PersistedRow) -> Result<(), StoreError> {
        sqlx::query(
            "
            INSERT INTO tracked_files (
                channel_id,
                file_id,
                position,
                file_name,
                status,
                upload_date,
                upload_error,
                attempts,
                content_hash,
                remote_link,
                deleted_from_source
            )
            VALUES (
                ?1,
                ?2,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM tracked_files WHERE channel_id = ?1),
                ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
            )
            ON CONFLICT(channel_id, file_id) DO UPDATE SET
                file_name = excluded.file_name,
                status = excluded.status,
                upload_date = excluded.upload_date,
                upload_error = excluded.upload_error,
                attempts = excluded.attempts,
                content_hash = excluded.content_hash,
                remote_link = excluded.remote_link,
                deleted_from_source = excluded.deleted_from_source;
            ",
        )
        .bind(channel_id)
        .bind(&row.file_id)
        .bind(&row.file_name)
        .bind(row.status.as_str())
        .bind(&row.upload_date)
        .bind(&row.upload_error)
        .bind(i64::from(row.attempts))
        .bind(&row.content_hash)
        .bind(&row.remote_link)
        .bind(row.deleted_from_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_rows(&self, channel_id: &str, rows: &[PersistedRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM tracked_files WHERE channel_id = ?1",
        )
        .bind(channel_id)
        .fetch_one(&mut *tx)
        .await?;
        for (offset, row) in rows.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tracked_files (channel_id, file_id, position, file_name, status,
                     upload_date, upload_error, attempts, content_hash, remote_link,
                     deleted_from_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )
            .bind(channel_id)
            .bind(&row.file_id)
            .bind(next + count(offset))
            .bind(&row.file_name)
            .bind(row.status.as_str())
            .bind(&row.upload_date)
            .bind(&row.upload_error)
            .bind(i64::from(row.attempts))
            .bind(&row.content_hash)
            .bind(&row.remote_link)
            .bind(row.deleted_from_source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_all(&self, channel_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tracked_files WHERE channel_id = ?1")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_progress(&self, channel_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT channel_id, channel_name, pending, uploaded, failed, skipped, last_file,
                    state, album_id, album_name, folder_id, folder_name, updated_at
             FROM channel_progress WHERE channel_id = ?1",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        Ok(Some(ProgressRecord {
            channel_id: row.try_get("channel_id")?,
            channel_name: row.try_get("channel_name")?,
            counts: StatusCounts {
                pending: uncount(row.try_get("pending")?),
                uploaded: uncount(row.try_get("uploaded")?),
                failed: uncount(row.try_get("failed")?),
                skipped: uncount(row.try_get("skipped")?),
            },
            last_file: row.try_get("last_file")?,
            state: ProgressState::parse(&state),
            containers: ChannelContainers {
                album: container_from(row.try_get("album_id")?, row.try_get("album_name")?),
                folder: container_from(row.try_get("folder_id")?, row.try_get("folder_name")?),
            },
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let album = record.containers.album.as_ref();
        let folder = record.containers.folder.as_ref();
        sqlx::query(
            "
            INSERT INTO channel_progress (
                channel_id, channel_name, pending, uploaded, failed, skipped,
                last_file, state, album_id, album_name, folder_id, folder_name, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(channel_id) DO UPDATE SET
                channel_name = excluded.channel_name,
                pending = excluded.pending,
                uploaded = excluded.uploaded,
                failed = excluded.failed,
                skipped = excluded.skipped,
                last_file = excluded.last_file,
                state = excluded.state,
                album_id = excluded.album_id,
                album_name = excluded.album_name,
                folder_id = excluded.folder_id,
                folder_name = excluded.folder_name,
                updated_at = excluded.updated_at;
            ",
        )
        .bind(&record.channel_id)
        .bind(&record.channel_name)
        .bind(count(record.counts.pending))
        .bind(count(record.counts.uploaded))
        .bind(count(record.counts.failed))
        .bind(count(record.counts.skipped))
        .bind(&record.last_file)
        .bind(record.state.as_str())
        .bind(album.map(|c| c.id.as_str()))
        .bind(album.map(|c| c.name.as_str()))
        .bind(folder.map(|c| c.id.as_str()))
        .bind(folder.map(|c| c.name.as_str()))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn make_store() -> SqliteRowStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteRowStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn row(id: &str, status: UploadStatus) -> PersistedRow {
        PersistedRow {
            file_id: id.into(),
            file_name: format!("{id}.jpg"),
            status,
            upload_date: None,
            upload_error: None,
            attempts: 0,
            content_hash: None,
            remote_link: None,
            deleted_from_source: false,
        }
    }

    async fn annotate(store: &SqliteRowStore, file_id: &str, notes: &str) {
        sqlx::query("INSERT INTO annotations (channel_id, file_id, notes) VALUES ('c1', ?1, ?2)")
            .bind(file_id)
            .bind(notes)
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn notes(store: &SqliteRowStore, file_id: &str) -> Option<String> {
        sqlx::query_scalar::<_, Option<String>>(
            "SELECT notes FROM channel_sheet WHERE channel_id = 'c1' AND file_id = ?1",
        )
        .bind(file_id)
        .fetch_optional(store.pool())
        .await
        .unwrap()
        .flatten()
    }

    #[tokio::test]
    async fn append_keeps_order_and_loads_back() {
        let store = make_store().await;
        store
            .append_rows("c1", &[row("b", UploadStatus::Pending), row("a", UploadStatus::Failed)])
            .await
            .unwrap();
        store
            .append_rows("c1", &[row("c", UploadStatus::Skipped)])
            .await
            .unwrap();

        let ids: Vec<_> = store
            .load_rows("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.file_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(store.load_rows("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_updates_in_place_and_inserts_at_end() {
        let store = make_store().await;
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending), row("b", UploadStatus::Pending)])
            .await
            .unwrap();

        let mut updated = row("a", UploadStatus::Uploaded);
        updated.attempts = 2;
        updated.remote_link = Some("https://remote/a".into());
        store.upsert_by_key("c1", &updated).await.unwrap();
        store
            .upsert_by_key("c1", &row("z", UploadStatus::Failed))
            .await
            .unwrap();

        assert_eq!(store.get_by_key("c1", "a").await.unwrap(), Some(updated));
        let ids: Vec<_> = store
            .load_rows("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.file_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "z"]);
        assert_eq!(store.get_by_key("c1", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn annotations_survive_snapshot_and_row_writes() {
        let store = make_store().await;
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending)])
            .await
            .unwrap();
        annotate(&store, "a", "grandma's birthday").await;

        store.clear_all("c1").await.unwrap();
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending)])
            .await
            .unwrap();
        store
            .upsert_by_key("c1", &row("a", UploadStatus::Uploaded))
            .await
            .unwrap();

        assert_eq!(notes(&store, "a").await.as_deref(), Some("grandma's birthday"));
    }

    #[tokio::test]
    async fn clear_is_scoped_to_one_channel() {
        let store = make_store().await;
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending)])
            .await
            .unwrap();
        store
            .append_rows("c2", &[row("a", UploadStatus::Uploaded)])
            .await
            .unwrap();

        store.clear_all("c1").await.unwrap();

        assert!(store.load_rows("c1").await.unwrap().is_empty());
        assert_eq!(store.load_rows("c2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_status_edited_by_hand_is_reported() {
        let store = make_store().await;
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending)])
            .await
            .unwrap();
        sqlx::query("UPDATE tracked_files SET status = 'done' WHERE file_id = 'a'")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.load_rows("c1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));
    }

    #[tokio::test]
    async fn progress_round_trips_with_containers() {
        let store = make_store().await;
        assert_eq!(store.load_progress("c1").await.unwrap(), None);
        let mut record = ProgressRecord {
            channel_id: "c1".into(),
            channel_name: "Family".into(),
            counts: StatusCounts {
                pending: 3,
                uploaded: 7,
                failed: 0,
                skipped: 1,
            },
            last_file: Some("f7.jpg".into()),
            state: ProgressState::Interrupted,
            containers: ChannelContainers {
                album: None,
                folder: Some(Container {
                    id: "disk:/Backup/Family".into(),
                    name: "Family".into(),
                }),
            },
            updated_at: 1_700_000_000,
        };
        store.save_progress(&record).await.unwrap();
        record.state = ProgressState::Completed;
        store.save_progress(&record).await.unwrap();

        assert_eq!(store.load_progress("c1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let store = SqliteRowStore::open(&path).await.unwrap();
        store
            .append_rows("c1", &[row("a", UploadStatus::Pending)])
            .await
            .unwrap();
        assert!(path.exists());
    }
}
