use std::{fs, path::Path};

use anyhow::Context as _;

use crate::storage::{JournalDocument, Storage};

/// Writes every stored entry to `path` as a journal document, so any backing
/// can be exported to the portable `{"entries": [...]}` shape.
pub async fn export_to_path(storage: &Storage, path: impl AsRef<Path>) -> anyhow::Result<u64> {
    let path = path.as_ref();
    let entries = storage.list().await?;
    let count = entries.len() as u64;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create export dir {}", parent.display()))?;
    }

    let document = JournalDocument { entries };
    let raw = serde_json::to_vec_pretty(&document).context("serialize export document")?;
    fs::write(path, raw).with_context(|| format!("write export {}", path.display()))?;
    Ok(count)
}

/// Reads a journal document and saves each entry into `storage`. Entries get
/// fresh ids and creation instants; the document's order is preserved oldest
/// first so relative recency survives the import.
pub async fn import_from_path(storage: &Storage, path: impl AsRef<Path>) -> anyhow::Result<u64> {
    let path = path.as_ref();
    let raw = fs::read(path).with_context(|| format!("read import {}", path.display()))?;
    let document: JournalDocument =
        serde_json::from_slice(&raw).with_context(|| format!("parse import {}", path.display()))?;

    let mut imported = 0u64;
    for entry in document.entries.into_iter().rev() {
        storage.save(entry.request, entry.response).await?;
        imported += 1;
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{export_to_path, import_from_path};
    use crate::{
        record::{BodyValue, RequestRecord, ResponseRecord, generate_id, now_unix_ms},
        storage::{Storage, StorageBackend},
    };

    fn request(path: &str) -> RequestRecord {
        RequestRecord {
            method: "GET".to_owned(),
            url: path.to_owned(),
            path: path.to_owned(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: BodyValue::Absent,
            id: generate_id(),
            captured_at_unix_ms: now_unix_ms().unwrap(),
        }
    }

    #[tokio::test]
    async fn export_then_import_carries_entries_across_backings() {
        let dir = tempfile::tempdir().unwrap();
        let source = Storage::open(StorageBackend::Journal, dir.path().join("src.json")).unwrap();
        source
            .save(request("/a"), ResponseRecord::json(200, json!({"n": 1})))
            .await
            .unwrap();
        source
            .save(request("/b"), ResponseRecord::json(201, json!({"n": 2})))
            .await
            .unwrap();

        let export_path = dir.path().join("export.json");
        let exported = export_to_path(&source, &export_path).await.unwrap();
        assert_eq!(exported, 2);

        let dest = Storage::open(StorageBackend::Sqlite, dir.path().join("dest.db")).unwrap();
        let imported = import_from_path(&dest, &export_path).await.unwrap();
        assert_eq!(imported, 2);
        assert_eq!(dest.count().await.unwrap(), 2);

        // Relative recency survives: /b was recorded after /a.
        let listed = dest.list().await.unwrap();
        assert_eq!(listed[0].request.path, "/b");
        assert_eq!(listed[1].request.path, "/a");
    }

    #[tokio::test]
    async fn import_rejects_malformed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let bad_path = dir.path().join("bad.json");
        std::fs::write(&bad_path, b"not json").unwrap();

        let dest = Storage::open(StorageBackend::Journal, dir.path().join("dest.json")).unwrap();
        assert!(import_from_path(&dest, &bad_path).await.is_err());
        assert_eq!(dest.count().await.unwrap(), 0);
    }
}
