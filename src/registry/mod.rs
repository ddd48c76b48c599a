//! 学習済みモデルの登録簿（SQLite）
//!
//! モデルごとに1行を `tf_models` テーブルへ記録する。
//! 接続はリクエストや処理単位で [`ModelStore::session`] から開き、使い終わったら閉じる。

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::model::ModelMetadata;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS tf_models (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    path         TEXT NOT NULL,
    class_names  TEXT NOT NULL,
    image_width  INTEGER NOT NULL,
    image_height INTEGER NOT NULL,
    num_epochs   INTEGER NOT NULL,
    val_accuracy REAL,
    trained_at   TEXT NOT NULL
)";

/// 登録簿の操作で起こりうるエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// データベースファイルを開けない
    #[error("Failed to open model database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    /// データベースの親ディレクトリを作成できない
    #[error("Failed to create model database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Model database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    /// class_names 列のJSONが壊れている
    #[error("Failed to decode stored class names: {0}")]
    Decode(#[from] serde_json::Error),
}

/// 登録済みモデル1件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub class_names: Vec<String>,
    pub image_width: u32,
    pub image_height: u32,
    pub num_epochs: u32,
    pub val_accuracy: Option<f64>,
    pub trained_at: String,
}

/// 登録前のモデル情報
#[derive(Debug, Clone, PartialEq)]
pub struct NewModelRecord {
    pub name: String,
    pub path: String,
    pub class_names: Vec<String>,
    pub image_width: u32,
    pub image_height: u32,
    pub num_epochs: u32,
    pub val_accuracy: Option<f64>,
    pub trained_at: String,
}

impl NewModelRecord {
    /// 保存済みモデルのメタデータから作成
    pub fn from_metadata(metadata: &ModelMetadata, archive_path: &Path) -> Self {
        Self {
            name: metadata.name.clone(),
            path: archive_path.to_string_lossy().to_string(),
            class_names: metadata.class_names.clone(),
            image_width: metadata.image_width,
            image_height: metadata.image_height,
            num_epochs: metadata.num_epochs,
            val_accuracy: metadata.val_accuracy,
            trained_at: metadata.trained_at.clone(),
        }
    }
}

/// データベースファイルの場所を保持し、セッションを払い出す
#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// テーブルがなければ作成する
    pub fn init(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let session = self.session()?;
        session.conn.execute_batch(CREATE_TABLE)?;
        tracing::debug!("Model database ready at {}", self.path.display());
        Ok(())
    }

    /// 新しい接続を開く
    pub fn session(&self) -> Result<ModelSession, StoreError> {
        let conn = Connection::open(&self.path).map_err(|source| StoreError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(ModelSession { conn })
    }
}

/// 1回分の接続。ドロップ時に閉じられる。
pub struct ModelSession {
    conn: Connection,
}

impl ModelSession {
    /// 全モデルを登録順に取得
    pub fn all_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, path, class_names, image_width, image_height, num_epochs,
                    val_accuracy, trained_at
             FROM tf_models ORDER BY id",
        )?;
        let rows = stmt.query_map([], read_row)?;

        let mut models = Vec::new();
        for row in rows {
            let (record, class_names_json) = row?;
            models.push(ModelRecord {
                class_names: serde_json::from_str(&class_names_json)?,
                ..record
            });
        }
        Ok(models)
    }

    /// モデルを登録して採番されたIDを返す
    pub fn insert_model(&self, model: &NewModelRecord) -> Result<i64, StoreError> {
        let class_names = serde_json::to_string(&model.class_names)?;
        self.conn.execute(
            "INSERT INTO tf_models
                (name, path, class_names, image_width, image_height, num_epochs, val_accuracy, trained_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                model.name,
                model.path,
                class_names,
                model.image_width,
                model.image_height,
                model.num_epochs,
                model.val_accuracy,
                model.trained_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<(ModelRecord, String)> {
    let record = ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        class_names: Vec::new(),
        image_width: row.get(4)?,
        image_height: row.get(5)?,
        num_epochs: row.get(6)?,
        val_accuracy: row.get(7)?,
        trained_at: row.get(8)?,
    };
    Ok((record, row.get(3)?))
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_record;
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ModelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("db/models.db"));
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn empty_table_lists_nothing() {
        let (_dir, store) = temp_store();
        assert!(store.session().unwrap().all_models().unwrap().is_empty());
    }

    #[test]
    fn inserted_models_are_listed_in_order() {
        let (_dir, store) = temp_store();
        let session = store.session().unwrap();
        let first = session.insert_model(&sample_record("first")).unwrap();
        let mut second_record = sample_record("second");
        second_record.val_accuracy = None;
        let second = session.insert_model(&second_record).unwrap();
        drop(session);

        let models = store.session().unwrap().all_models().unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, first);
        assert_eq!(models[0].name, "first");
        assert_eq!(models[0].class_names, vec!["biblioteca", "cantina", "quadra"]);
        assert_eq!(models[1].id, second);
        assert_eq!(models[1].val_accuracy, None);
    }

    #[test]
    fn init_is_idempotent() {
        let (_dir, store) = temp_store();
        store.session().unwrap().insert_model(&sample_record("kept")).unwrap();
        store.init().unwrap();
        assert_eq!(store.session().unwrap().all_models().unwrap().len(), 1);
    }

    #[test]
    fn record_from_metadata_copies_fields() {
        let metadata = ModelMetadata::for_test(
            vec!["a".into(), "b".into()],
            crate::model::ImageSettings { height: 32, width: 48 },
        );
        let record = NewModelRecord::from_metadata(&metadata, Path::new("models/m.tar.gz"));
        assert_eq!(record.name, metadata.name);
        assert_eq!(record.image_width, 48);
        assert_eq!(record.image_height, 32);
        assert_eq!(record.val_accuracy, Some(0.75));
        assert_eq!(record.path, "models/m.tar.gz");
    }

    #[test]
    fn init_reports_unusable_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = ModelStore::new(blocker.join("models.db"));

        let err = store.init().unwrap_err();
        assert!(matches!(err, StoreError::CreateDir { .. }));
    }

    #[test]
    fn missing_table_is_a_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("uninitialized.db"));
        let err = store.session().unwrap().all_models().unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
