// Remote document store client
//
// Collections of documents addressed by id, with merge-by-id upserts and
// conjunctive equality queries.

pub mod value;

pub use value::{ArrayValue, Document, FieldValue};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::http_client::StoreHttpClient;

/// Upper bound on documents returned by a single query
pub const MAX_QUERY_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct QueryRow {
    #[serde(default)]
    document: Option<Document>,
}

pub struct DocumentStore {
    http: StoreHttpClient,
    /// Base of the documents tree, e.g. `.../databases/(default)/documents`
    base_url: String,
}

impl DocumentStore {
    pub fn new(http: StoreHttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    /// Write the given fields into `collection/id`, creating it if absent.
    ///
    /// Fields not named in `document` are left untouched, so repeating an
    /// upsert yields the same stored state.
    pub async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Document,
    ) -> Result<(), BridgeError> {
        let mask: Vec<(&str, &str)> = document
            .field_paths()
            .map(|path| ("updateMask.fieldPaths", path))
            .collect();

        let request = self
            .http
            .client()
            .patch(self.document_url(collection, id))
            .query(&mask)
            .json(&json!({ "fields": document.fields }))
            .build()
            .map_err(|e| BridgeError::Internal(e.into()))?;

        self.http.execute(request).await?;
        tracing::debug!(collection, id, "Upserted document");
        Ok(())
    }

    /// Fetch `collection/id`; `None` if it does not exist
    pub async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Document>, BridgeError> {
        let request = self
            .http
            .client()
            .get(self.document_url(collection, id))
            .build()
            .map_err(|e| BridgeError::Internal(e.into()))?;

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(BridgeError::BackendError { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let document = response.json::<Document>().await.map_err(|e| {
            BridgeError::BackendError {
                status: 502,
                message: format!("Malformed document {}/{}: {}", collection, id, e),
            }
        })?;
        Ok(Some(document))
    }

    /// Documents in `collection` whose fields equal every given filter value
    pub async fn query(
        &self,
        collection: &str,
        filters: &[(&str, FieldValue)],
        limit: u32,
    ) -> Result<Vec<Document>, BridgeError> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);

        let mut structured = json!({
            "from": [{ "collectionId": collection }],
            "limit": limit,
        });
        if let Some(condition) = where_clause(filters) {
            structured["where"] = condition;
        }

        let request = self
            .http
            .client()
            .post(format!("{}:runQuery", self.base_url))
            .json(&json!({ "structuredQuery": structured }))
            .build()
            .map_err(|e| BridgeError::Internal(e.into()))?;

        let rows = self
            .http
            .execute(request)
            .await?
            .json::<Vec<QueryRow>>()
            .await
            .map_err(|e| BridgeError::BackendError {
                status: 502,
                message: format!("Malformed query result for {}: {}", collection, e),
            })?;

        let documents: Vec<Document> = rows.into_iter().filter_map(|row| row.document).collect();
        tracing::debug!(collection, count = documents.len(), "Query returned documents");
        Ok(documents)
    }

    /// Delete `collection/id`; deleting an absent document succeeds
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), BridgeError> {
        let request = self
            .http
            .client()
            .delete(self.document_url(collection, id))
            .build()
            .map_err(|e| BridgeError::Internal(e.into()))?;

        match self.http.execute(request).await {
            Ok(_) | Err(BridgeError::BackendError { status: 404, .. }) => {
                tracing::debug!(collection, id, "Deleted document");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn where_clause(filters: &[(&str, FieldValue)]) -> Option<Value> {
    let mut conditions: Vec<Value> = filters
        .iter()
        .map(|(field, value)| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": value,
                }
            })
        })
        .collect();

    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(json!({
            "compositeFilter": { "op": "AND", "filters": conditions }
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        CredentialManager, FetchMode, IdentityEvent, IdentityProvider, MemoryCredentialStore,
        RefreshPolicy, TokenGrant, User,
    };
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::Utc;
    use mockito::Matcher;
    use std::sync::Arc;

    struct StaticProvider(Arc<ManualClock>);

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        async fn fetch_token(&self, _mode: FetchMode) -> anyhow::Result<TokenGrant> {
            Ok(TokenGrant {
                token: "token".to_string(),
                expires_at: self.0.now() + chrono::Duration::hours(1),
                user: Some(User::new("uid-1")),
            })
        }
    }

    async fn store(base_url: String) -> DocumentStore {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let credentials = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(StaticProvider(clock.clone())),
            clock,
            RefreshPolicy::default(),
        );
        credentials
            .on_identity_change(IdentityEvent::SignedIn(User::new("uid-1")))
            .await
            .unwrap();
        let http = StoreHttpClient::new(credentials, 4, 5, 5, 0).unwrap();
        DocumentStore::new(http, base_url)
    }

    #[test]
    fn test_where_clause_shapes() {
        assert!(where_clause(&[]).is_none());

        let single = where_clause(&[("userId", FieldValue::from("u"))]).unwrap();
        assert_eq!(single["fieldFilter"]["op"], "EQUAL");
        assert_eq!(single["fieldFilter"]["value"]["stringValue"], "u");

        let both = where_clause(&[
            ("userId", FieldValue::from("u")),
            ("movieId", FieldValue::from("tt1")),
        ])
        .unwrap();
        assert_eq!(both["compositeFilter"]["op"], "AND");
        assert_eq!(both["compositeFilter"]["filters"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_sends_update_mask() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/docs/watchlist/uid-1_tt1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("updateMask.fieldPaths".into(), "title".into()),
                Matcher::UrlEncoded("updateMask.fieldPaths".into(), "userId".into()),
            ]))
            .match_body(Matcher::PartialJson(json!({
                "fields": {"title": {"stringValue": "Heat"}}
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        let doc = Document::new().with("title", "Heat").with("userId", "uid-1");
        store.upsert("watchlist", "uid-1_tt1", &doc).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_absent_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/docs/movies/tt404")
            .with_status(404)
            .with_body(r#"{"error":{"code":404}}"#)
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        assert!(store.fetch("movies", "tt404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_present() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/docs/movies/tt1")
            .with_status(200)
            .with_body(
                json!({
                    "name": "x/documents/movies/tt1",
                    "fields": {"title": {"stringValue": "Heat"}}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        let doc = store.fetch("movies", "tt1").await.unwrap().unwrap();
        assert_eq!(doc.id(), Some("tt1"));
        assert_eq!(doc.get_str("title"), Some("Heat"));
    }

    #[tokio::test]
    async fn test_query_clamps_limit_and_skips_empty_rows() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/docs:runQuery")
            .match_body(Matcher::PartialJson(json!({
                "structuredQuery": {"from": [{"collectionId": "ratings"}], "limit": 100}
            })))
            .with_status(200)
            .with_body(
                json!([
                    {"document": {"name": "a/ratings/1", "fields": {}}, "readTime": "2024-01-01T00:00:00Z"},
                    {"readTime": "2024-01-01T00:00:00Z"}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        let docs = store
            .query("ratings", &[("userId", FieldValue::from("uid-1"))], 500)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/docs/watchlist/gone")
            .with_status(404)
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        store.delete("watchlist", "gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_error_carries_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/docs/watchlist/x")
            .with_status(400)
            .with_body("bad request")
            .create_async()
            .await;

        let store = store(format!("{}/docs", server.url())).await;
        let err = store.delete("watchlist", "x").await.unwrap_err();
        match err {
            BridgeError::BackendError { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad request");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
