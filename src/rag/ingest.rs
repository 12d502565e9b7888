//! Loads clinic records (services, branches, social media) from the clinic
//! SQLite database into the document index.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::document::{Document, CATEGORY_KEY};
use super::index::DocumentIndex;
use crate::core::config::{IngestSettings, IngestTable};
use crate::embedding::Embedder;
use crate::pipeline::PipelineError;

pub const TABLE_KEY: &str = "table";

pub async fn open_clinic_database(path: &Path) -> Result<SqlitePool, PipelineError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .read_only(true);

    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .map_err(|e| {
            PipelineError::storage(format!(
                "failed to open clinic database {}: {}",
                path.display(),
                e
            ))
        })
}

/// Reads every configured table and returns unembedded documents in table
/// order, rows ordered by their id column.
pub async fn read_documents(
    pool: &SqlitePool,
    tables: &[IngestTable],
) -> Result<Vec<Document>, PipelineError> {
    let mut documents = Vec::new();

    for table in tables {
        validate_identifier(&table.table)?;
        validate_identifier(&table.id_column)?;
        for column in &table.columns {
            validate_identifier(column)?;
        }

        let select_list = std::iter::once(&table.id_column)
            .chain(table.columns.iter())
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY \"{}\"",
            select_list, table.table, table.id_column
        );

        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(PipelineError::storage)?;

        for row in &rows {
            let Some(id) = column_text(row, 0) else {
                tracing::warn!(table = %table.table, "Skipping row without id");
                continue;
            };

            let text = (1..=table.columns.len())
                .filter_map(|i| column_text(row, i))
                .filter(|value| !value.trim().is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if text.trim().is_empty() {
                tracing::warn!(table = %table.table, id = %id, "Skipping row with no text");
                continue;
            }

            documents.push(
                Document::new(format!("{}:{}", table.table, id), text)
                    .with_metadata(CATEGORY_KEY, table.category.clone())
                    .with_metadata(TABLE_KEY, table.table.clone()),
            );
        }

        tracing::info!(table = %table.table, rows = rows.len(), "Read clinic table");
    }

    Ok(documents)
}

/// Embeds and indexes every configured table. Returns the number of
/// documents added.
pub async fn load_clinic_documents(
    settings: &IngestSettings,
    embedder: &dyn Embedder,
    index: &DocumentIndex,
) -> Result<usize, PipelineError> {
    let Some(path) = settings.database_path.as_deref() else {
        tracing::warn!("No clinic database configured; the document index is empty");
        return Ok(0);
    };

    let pool = open_clinic_database(path).await?;
    let documents = read_documents(&pool, &settings.tables).await;
    pool.close().await;

    let mut added = 0;
    for document in documents? {
        let embedding = embedder.embed(&document.text).await?;
        if embedding.truncated {
            tracing::warn!(document_id = %document.id, "Document text truncated for embedding");
        }
        index.add(document.with_vector(embedding.vector))?;
        added += 1;
    }

    tracing::info!(documents = added, "Clinic documents indexed");
    Ok(added)
}

fn validate_identifier(name: &str) -> Result<(), PipelineError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "invalid table or column name '{}'",
            name
        )))
    }
}

/// SQLite columns are dynamically typed; accept text, integers and reals.
fn column_text(row: &SqliteRow, index: usize) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string());
    }
    None
}
