//! Comprehensive tests for the chunk store abstraction layer

#[cfg(test)]
mod integration_tests {
    use crate::chunkstore::mock_store::MockChunkStore;
    use crate::chunkstore::sqlite_store::SQLiteChunkStore;
    use crate::chunkstore::{
        BlobId, ChunkStore, ChunkStoreError, Filter, FindQuery, Metadata, SortDirection,
        SortSpec, UploadOptions, Value,
    };
    use std::io::Cursor;
    use std::sync::Arc;
    use std::thread;

    fn backends() -> Vec<(&'static str, Arc<dyn ChunkStore>)> {
        vec![
            ("mock", Arc::new(MockChunkStore::new())),
            ("sqlite", Arc::new(SQLiteChunkStore::open_in_memory("fs").unwrap())),
        ]
    }

    fn options(hash: &str, ticket: Option<&str>, chunk_size: usize) -> UploadOptions {
        let mut metadata = Metadata::new();
        metadata.insert("sha256".into(), serde_json::Value::String(hash.into()));
        if let Some(t) = ticket {
            metadata.insert("ticketNumber".into(), serde_json::Value::String(t.into()));
        }
        UploadOptions { chunk_size_bytes: chunk_size, metadata }
    }

    #[test]
    fn test_chunk_store_contract_end_to_end() {
        for (name, store) in backends() {
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
            let id = store
                .upload_from_stream("pattern.bin", &mut Cursor::new(payload.clone()), &options("p", None, 64))
                .unwrap();

            let mut out = Vec::new();
            let written = store.download_to_stream(&id, &mut out).unwrap();
            assert_eq!(written, 1000, "backend {}", name);
            assert_eq!(out, payload, "backend {}", name);

            let found = store
                .find(&FindQuery::new(Filter::eq("_id", Value::Text(id.to_string()))))
                .unwrap();
            assert_eq!(found.len(), 1, "backend {}", name);
            assert_eq!(found[0].length, 1000);
            assert_eq!(found[0].chunk_size, 64);

            assert!(store.delete(&id).unwrap());
            let err = store.download_to_stream(&id, &mut Vec::new()).unwrap_err();
            assert!(matches!(err, ChunkStoreError::FileNotFound(_)), "backend {}", name);
        }
    }

    #[test]
    fn test_backends_agree_on_queries() {
        for (name, store) in backends() {
            store.create_unique_index("metadata.sha256").unwrap();
            let uploads = [
                ("gamma", "h1", Some("T-1")),
                ("alpha", "h2", Some("T-2")),
                ("beta", "h3", Some("T-1")),
                ("alpha", "h4", None),
            ];
            for (file, hash, ticket) in uploads {
                store
                    .upload_from_stream(file, &mut Cursor::new(hash.as_bytes().to_vec()), &options(hash, ticket, 16))
                    .unwrap();
            }

            let ticket_one = Filter::eq("metadata.ticketNumber", Value::Text("T-1".into()));
            assert_eq!(store.count_documents(&ticket_one).unwrap(), 2, "backend {}", name);
            assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 4);

            let sorted = FindQuery {
                sort: Some(SortSpec {
                    fields: vec!["filename".into(), "metadata.sha256".into()],
                    direction: SortDirection::Descending,
                }),
                ..FindQuery::default()
            };
            let hashes: Vec<String> = store
                .find(&sorted)
                .unwrap()
                .into_iter()
                .map(|f| f.metadata_str("sha256").unwrap().to_string())
                .collect();
            assert_eq!(hashes, vec!["h1", "h3", "h4", "h2"], "backend {}", name);

            let page = FindQuery { skip: 1, limit: 2, ..FindQuery::default() };
            let names: Vec<String> = store.find(&page).unwrap().into_iter().map(|f| f.filename).collect();
            assert_eq!(names, vec!["alpha", "beta"], "backend {}", name);

            let missing_ticket_sort = FindQuery {
                sort: Some(SortSpec {
                    fields: vec!["metadata.ticketNumber".into()],
                    direction: SortDirection::Ascending,
                }),
                ..FindQuery::default()
            };
            let first = store.find(&missing_ticket_sort).unwrap().remove(0);
            assert_eq!(first.metadata_str("sha256"), Some("h4"), "backend {}", name);

            let dup = store.upload_from_stream("again", &mut Cursor::new(b"h1".to_vec()), &options("h1", None, 16));
            assert!(matches!(dup, Err(ChunkStoreError::DuplicateKey { .. })), "backend {}", name);
            assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 4);
        }
    }

    #[test]
    fn test_delete_unknown_id_is_not_an_error() {
        for (name, store) in backends() {
            assert!(!store.delete(&BlobId::generate()).unwrap(), "backend {}", name);
        }
    }

    #[test]
    fn test_concurrent_operations() {
        for (_, store) in backends() {
            let handles: Vec<_> = (0..5)
                .map(|i| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        let data = format!("Concurrent test data {}", i).into_bytes();
                        let id = store
                            .upload_from_stream(
                                "concurrent.txt",
                                &mut Cursor::new(data.clone()),
                                &options(&format!("c{}", i), None, 5),
                            )
                            .unwrap();
                        let mut out = Vec::new();
                        store.download_to_stream(&id, &mut out).unwrap();
                        assert_eq!(out, data);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 5);
        }
    }
}
