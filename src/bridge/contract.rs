// Typed request/response pairs
//
// Each request payload is bound to its tag and its response data type at
// compile time, so the page context and the dispatcher cannot disagree on
// what a given tag carries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::envelope::RequestType;
use crate::auth::User;
use crate::models::{MembershipRecord, Movie, Rating};

/// A request payload with a fixed tag and response type
pub trait BridgeRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: RequestType;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Look up a movie by IMDb id, or by title and optional year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Search {
    pub id_or_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
}

impl BridgeRequest for Search {
    const TYPE: RequestType = RequestType::Search;
    type Response = Option<Movie>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckMembership {
    pub movie_id: String,
}

impl BridgeRequest for CheckMembership {
    const TYPE: RequestType = RequestType::CheckMembership;
    type Response = bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembership {
    pub record: MembershipRecord,
}

impl BridgeRequest for AddMembership {
    const TYPE: RequestType = RequestType::AddMembership;
    type Response = ();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMembership {
    pub movie_id: String,
}

impl BridgeRequest for RemoveMembership {
    const TYPE: RequestType = RequestType::RemoveMembership;
    type Response = ();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMemberships {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl BridgeRequest for ListMemberships {
    const TYPE: RequestType = RequestType::ListMemberships;
    type Response = Vec<MembershipRecord>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOrUpdateRating {
    pub movie_id: String,
    pub title: String,
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl BridgeRequest for AddOrUpdateRating {
    const TYPE: RequestType = RequestType::AddOrUpdateRating;
    type Response = ();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRating {
    pub movie_id: String,
}

impl BridgeRequest for GetRating {
    const TYPE: RequestType = RequestType::GetRating;
    type Response = Option<Rating>;
}

/// Resolve the signed-in identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetUser {}

impl BridgeRequest for GetUser {
    const TYPE: RequestType = RequestType::GetUser;
    type Response = Option<User>;
}

/// Sign in through the identity provider, optionally with a new refresh token.
///
/// A refresh token for a different account switches the signed-in identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl BridgeRequest for SignIn {
    const TYPE: RequestType = RequestType::SignIn;
    type Response = User;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignOut {}

impl BridgeRequest for SignOut {
    const TYPE: RequestType = RequestType::SignOut;
    type Response = ();
}
