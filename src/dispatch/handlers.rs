// Privileged operations behind each request type

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::Dispatcher;
use crate::auth::{CredentialManager, User};
use crate::bridge::{
    AddMembership, AddOrUpdateRating, CheckMembership, GetRating, GetUser, ListMemberships,
    RemoveMembership, Search, SignIn, SignOut,
};
use crate::clock::Clock;
use crate::error::BridgeError;
use crate::models::{MembershipRecord, Movie, Rating, MAX_RATING};
use crate::store::{Document, DocumentStore, FieldValue};

const MOVIES: &str = "movies";
const WATCHLIST: &str = "watchlist";
const RATINGS: &str = "ratings";

/// Default page size for membership listings
pub const DEFAULT_LIST_LIMIT: u32 = 50;

static IMDB_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tt\d{7,}$").expect("valid regex"));

/// Collaborators shared by every handler
#[derive(Clone)]
pub struct HandlerContext {
    pub credentials: CredentialManager,
    pub documents: Arc<DocumentStore>,
    pub clock: Arc<dyn Clock>,
}

impl HandlerContext {
    async fn identity(&self) -> Result<User, BridgeError> {
        self.credentials
            .current_user()
            .await
            .ok_or(BridgeError::AuthRequired)
    }
}

/// Register a handler for every request type
pub fn register_all(dispatcher: &mut Dispatcher, ctx: HandlerContext) {
    let c = ctx.clone();
    dispatcher.register(move |req: Search| search(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: CheckMembership| check_membership(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: AddMembership| add_membership(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: RemoveMembership| remove_membership(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: ListMemberships| list_memberships(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: AddOrUpdateRating| add_or_update_rating(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: GetRating| get_rating(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: GetUser| get_user(c.clone(), req));
    let c = ctx.clone();
    dispatcher.register(move |req: SignIn| sign_in(c.clone(), req));
    dispatcher.register(move |req: SignOut| sign_out(ctx.clone(), req));
}

/// Movie ids become document ids, so they must be a single path segment
fn movie_key(movie_id: &str) -> Result<&str, BridgeError> {
    let trimmed = movie_id.trim();
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(BridgeError::ProtocolError(format!(
            "Invalid movie id: {:?}",
            movie_id
        )));
    }
    Ok(trimmed)
}

fn user_document_id(user: &User, movie_id: &str) -> String {
    format!("{}_{}", user.id, movie_id)
}

async fn search(ctx: HandlerContext, req: Search) -> Result<Option<Movie>, BridgeError> {
    let needle = req.id_or_title.trim();
    if needle.is_empty() {
        return Err(BridgeError::ProtocolError(
            "Search needs an id or a title".to_string(),
        ));
    }

    let document = if IMDB_ID.is_match(needle) {
        ctx.documents.fetch(MOVIES, needle).await?
    } else {
        let mut filters = vec![("title", FieldValue::from(needle))];
        if let Some(year) = req.year {
            filters.push(("year", FieldValue::from(year)));
        }
        ctx.documents
            .query(MOVIES, &filters, 1)
            .await?
            .into_iter()
            .next()
    };

    Ok(document.and_then(|doc| movie_from_document(&doc)))
}

fn movie_from_document(doc: &Document) -> Option<Movie> {
    let id = doc.get_str("id").or_else(|| doc.id())?.to_string();
    let Some(title) = doc.get_str("title") else {
        tracing::warn!(id = %id, "Movie document has no title");
        return None;
    };

    Some(Movie {
        id,
        title: title.to_string(),
        year: doc.get_i64("year"),
        poster_url: doc.get_str("posterUrl").map(str::to_string),
        genres: doc.get_strings("genres"),
    })
}

async fn check_membership(ctx: HandlerContext, req: CheckMembership) -> Result<bool, BridgeError> {
    let user = ctx.identity().await?;
    let movie_id = movie_key(&req.movie_id)?;

    let existing = ctx
        .documents
        .fetch(WATCHLIST, &user_document_id(&user, movie_id))
        .await?;
    Ok(existing.is_some())
}

async fn add_membership(ctx: HandlerContext, req: AddMembership) -> Result<(), BridgeError> {
    let user = ctx.identity().await?;
    let record = req.record;
    let movie_id = movie_key(&record.movie_id)?;

    let mut doc = Document::new()
        .with("userId", user.id.as_str())
        .with("movieId", movie_id)
        .with("title", record.title.as_str())
        .with("addedAt", record.added_at.unwrap_or_else(|| ctx.clock.now()));
    if let Some(year) = record.year {
        doc = doc.with("year", year);
    }
    if let Some(poster_url) = record.poster_url {
        doc = doc.with("posterUrl", poster_url);
    }

    ctx.documents
        .upsert(WATCHLIST, &user_document_id(&user, movie_id), &doc)
        .await?;
    tracing::info!(user = %user.id, movie = %movie_id, "Added to watchlist");
    Ok(())
}

async fn remove_membership(ctx: HandlerContext, req: RemoveMembership) -> Result<(), BridgeError> {
    let user = ctx.identity().await?;
    let movie_id = movie_key(&req.movie_id)?;

    ctx.documents
        .delete(WATCHLIST, &user_document_id(&user, movie_id))
        .await?;
    tracing::info!(user = %user.id, movie = %movie_id, "Removed from watchlist");
    Ok(())
}

async fn list_memberships(
    ctx: HandlerContext,
    req: ListMemberships,
) -> Result<Vec<MembershipRecord>, BridgeError> {
    let user = ctx.identity().await?;
    let limit = req.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    let documents = ctx
        .documents
        .query(
            WATCHLIST,
            &[("userId", FieldValue::from(user.id.as_str()))],
            limit,
        )
        .await?;

    let mut records: Vec<MembershipRecord> = documents
        .iter()
        .filter_map(membership_from_document)
        .collect();
    // Newest first; records without a timestamp go last
    records.sort_by(|a, b| b.added_at.cmp(&a.added_at));
    Ok(records)
}

fn membership_from_document(doc: &Document) -> Option<MembershipRecord> {
    Some(MembershipRecord {
        movie_id: doc.get_str("movieId")?.to_string(),
        title: doc.get_str("title").unwrap_or_default().to_string(),
        year: doc.get_i64("year"),
        poster_url: doc.get_str("posterUrl").map(str::to_string),
        added_at: doc.get_timestamp("addedAt"),
    })
}

async fn add_or_update_rating(
    ctx: HandlerContext,
    req: AddOrUpdateRating,
) -> Result<(), BridgeError> {
    let user = ctx.identity().await?;
    let movie_id = movie_key(&req.movie_id)?;

    if !req.rating.is_finite() || !(0.0..=MAX_RATING).contains(&req.rating) {
        return Err(BridgeError::ProtocolError(format!(
            "Rating must be between 0 and {}, got {}",
            MAX_RATING, req.rating
        )));
    }

    let doc = Document::new()
        .with("userId", user.id.as_str())
        .with("movieId", movie_id)
        .with("title", req.title.as_str())
        .with("rating", req.rating)
        .with("comment", req.comment)
        .with("updatedAt", ctx.clock.now());

    ctx.documents
        .upsert(RATINGS, &user_document_id(&user, movie_id), &doc)
        .await?;
    tracing::info!(user = %user.id, movie = %movie_id, rating = req.rating, "Rating saved");
    Ok(())
}

async fn get_rating(ctx: HandlerContext, req: GetRating) -> Result<Option<Rating>, BridgeError> {
    let user = ctx.identity().await?;
    let movie_id = movie_key(&req.movie_id)?;

    let document = ctx
        .documents
        .fetch(RATINGS, &user_document_id(&user, movie_id))
        .await?;

    Ok(document.and_then(|doc| {
        Some(Rating {
            movie_id: movie_id.to_string(),
            title: doc.get_str("title").unwrap_or_default().to_string(),
            rating: doc.get_f64("rating")?,
            comment: doc.get_str("comment").map(str::to_string),
            updated_at: doc.get_timestamp("updatedAt").or(doc.update_time)?,
        })
    }))
}

/// Identity surface; answers without touching the network
async fn get_user(ctx: HandlerContext, _req: GetUser) -> Result<Option<User>, BridgeError> {
    Ok(ctx.credentials.current_user().await)
}

async fn sign_in(ctx: HandlerContext, req: SignIn) -> Result<User, BridgeError> {
    ctx.credentials.sign_in(req.refresh_token).await
}

async fn sign_out(ctx: HandlerContext, _req: SignOut) -> Result<(), BridgeError> {
    ctx.credentials.sign_out().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        FetchMode, IdentityEvent, IdentityProvider, MemoryCredentialStore, RefreshPolicy,
        TokenGrant,
    };
    use crate::bridge::{RequestEnvelope, RequestType};
    use crate::clock::ManualClock;
    use crate::http_client::StoreHttpClient;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use serde_json::json;

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

    async fn setup(base_url: String, signed_in: bool) -> Arc<Dispatcher> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let credentials = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(StaticProvider(clock.clone())),
            clock.clone(),
            RefreshPolicy::default(),
        );
        if signed_in {
            credentials
                .on_identity_change(IdentityEvent::SignedIn(User::new("uid-1")))
                .await
                .unwrap();
        }
        let http = StoreHttpClient::new(credentials.clone(), 4, 5, 5, 0).unwrap();
        let ctx = HandlerContext {
            credentials,
            documents: Arc::new(DocumentStore::new(http, base_url)),
            clock,
        };

        let mut dispatcher = Dispatcher::new();
        register_all(&mut dispatcher, ctx);
        Arc::new(dispatcher)
    }

    async fn call(
        dispatcher: &Dispatcher,
        kind: RequestType,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        dispatcher
            .dispatch(RequestEnvelope::new(kind, payload))
            .await
            .unwrap()
            .into_result()
    }

    #[test]
    fn test_imdb_id_pattern() {
        assert!(IMDB_ID.is_match("tt0133093"));
        assert!(IMDB_ID.is_match("tt10872600"));
        assert!(!IMDB_ID.is_match("tt123"));
        assert!(!IMDB_ID.is_match("The Matrix"));
    }

    #[test]
    fn test_movie_key_rejects_paths() {
        assert_eq!(movie_key(" tt1 ").unwrap(), "tt1");
        assert!(movie_key("").is_err());
        assert!(movie_key("a/b").is_err());
    }

    #[tokio::test]
    async fn test_every_type_has_a_handler() {
        let dispatcher = setup("http://127.0.0.1:9".to_string(), false).await;
        for kind in RequestType::ALL {
            assert!(dispatcher.handles(kind), "{} has no handler", kind);
        }
    }

    #[tokio::test]
    async fn test_get_user_signed_out_is_null() {
        let dispatcher = setup("http://127.0.0.1:9".to_string(), false).await;
        let data = call(&dispatcher, RequestType::GetUser, json!({})).await.unwrap();
        assert_eq!(data, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_sign_in_then_sign_out() {
        let dispatcher = setup("http://127.0.0.1:9".to_string(), false).await;

        let user = call(&dispatcher, RequestType::SignIn, json!({})).await.unwrap();
        assert_eq!(user["id"], "uid-1");
        let data = call(&dispatcher, RequestType::GetUser, json!({})).await.unwrap();
        assert_eq!(data["id"], "uid-1");

        let data = call(&dispatcher, RequestType::SignOut, json!({})).await.unwrap();
        assert_eq!(data, serde_json::Value::Null);
        let data = call(&dispatcher, RequestType::GetUser, json!({})).await.unwrap();
        assert_eq!(data, serde_json::Value::Null);

        let err = call(&dispatcher, RequestType::CheckMembership, json!({"movieId": "tt1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AuthRequired));
    }

    #[tokio::test]
    async fn test_signed_out_membership_requires_auth() {
        let dispatcher = setup("http://127.0.0.1:9".to_string(), false).await;
        let err = call(&dispatcher, RequestType::CheckMembership, json!({"movieId": "tt1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AuthRequired));
    }

    #[tokio::test]
    async fn test_search_by_imdb_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/docs/movies/tt0113277")
            .with_status(200)
            .with_body(
                json!({
                    "name": "p/documents/movies/tt0113277",
                    "fields": {
                        "title": {"stringValue": "Heat"},
                        "year": {"integerValue": "1995"},
                        "genres": {"arrayValue": {"values": [{"stringValue": "Crime"}]}}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let dispatcher = setup(format!("{}/docs", server.url()), true).await;
        let data = call(&dispatcher, RequestType::Search, json!({"idOrTitle": "tt0113277"}))
            .await
            .unwrap();

        let movie: Movie = serde_json::from_value(data).unwrap();
        assert_eq!(movie.id, "tt0113277");
        assert_eq!(movie.year, Some(1995));
        assert_eq!(movie.genres, vec!["Crime".to_string()]);
    }

    #[tokio::test]
    async fn test_search_by_title_and_year_queries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/docs:runQuery")
            .match_body(Matcher::PartialJson(json!({
                "structuredQuery": {"limit": 1, "where": {"compositeFilter": {"op": "AND"}}}
            })))
            .with_status(200)
            .with_body("[{}]")
            .create_async()
            .await;

        let dispatcher = setup(format!("{}/docs", server.url()), true).await;
        let data = call(
            &dispatcher,
            RequestType::Search,
            json!({"idOrTitle": "Heat", "year": 1995}),
        )
        .await
        .unwrap();

        assert_eq!(data, serde_json::Value::Null);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_add_membership_writes_user_scoped_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/docs/watchlist/uid-1_tt1")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "fields": {
                    "userId": {"stringValue": "uid-1"},
                    "movieId": {"stringValue": "tt1"},
                    "title": {"stringValue": "Heat"},
                    "addedAt": {"timestampValue": "2024-03-01T12:00:00Z"}
                }
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let dispatcher = setup(format!("{}/docs", server.url()), true).await;
        let data = call(
            &dispatcher,
            RequestType::AddMembership,
            json!({"record": {"movieId": "tt1", "title": "Heat"}}),
        )
        .await
        .unwrap();

        assert_eq!(data, serde_json::Value::Null);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rating_out_of_range_is_rejected() {
        let dispatcher = setup("http://127.0.0.1:9".to_string(), true).await;
        let err = call(
            &dispatcher,
            RequestType::AddOrUpdateRating,
            json!({"movieId": "tt1", "title": "Heat", "rating": 11.0}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_get_rating_reads_document() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/docs/ratings/uid-1_tt1")
            .with_status(200)
            .with_body(
                json!({
                    "name": "p/documents/ratings/uid-1_tt1",
                    "fields": {
                        "title": {"stringValue": "Heat"},
                        "rating": {"doubleValue": 9},
                        "comment": {"nullValue": null},
                        "updatedAt": {"timestampValue": "2024-03-01T12:00:00Z"}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let dispatcher = setup(format!("{}/docs", server.url()), true).await;
        let data = call(&dispatcher, RequestType::GetRating, json!({"movieId": "tt1"}))
            .await
            .unwrap();

        let rating: Rating = serde_json::from_value(data).unwrap();
        assert_eq!(rating.rating, 9.0);
        assert_eq!(rating.comment, None);
    }

    #[tokio::test]
    async fn test_list_memberships_newest_first() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/docs:runQuery")
            .match_body(Matcher::PartialJson(json!({
                "structuredQuery": {"limit": 50}
            })))
            .with_status(200)
            .with_body(
                json!([
                    {"document": {"name": "w/uid-1_tt1", "fields": {
                        "movieId": {"stringValue": "tt1"},
                        "title": {"stringValue": "Old"},
                        "addedAt": {"timestampValue": "2024-01-01T00:00:00Z"}
                    }}},
                    {"document": {"name": "w/uid-1_tt2", "fields": {
                        "movieId": {"stringValue": "tt2"},
                        "title": {"stringValue": "New"},
                        "addedAt": {"timestampValue": "2024-02-01T00:00:00Z"}
                    }}}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let dispatcher = setup(format!("{}/docs", server.url()), true).await;
        let data = call(&dispatcher, RequestType::ListMemberships, json!({}))
            .await
            .unwrap();

        let records: Vec<MembershipRecord> = serde_json::from_value(data).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.movie_id.as_str()).collect();
        assert_eq!(ids, vec!["tt2", "tt1"]);
    }
}
