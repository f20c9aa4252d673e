// Wire units crossing the message transport

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::{BridgeError, ErrorKind};

/// Every request the privileged process understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Search,
    CheckMembership,
    AddMembership,
    RemoveMembership,
    ListMemberships,
    AddOrUpdateRating,
    GetRating,
    GetUser,
    SignIn,
    SignOut,
}

/// Response tag paired with each request tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    SearchResponse,
    CheckMembershipResponse,
    AddMembershipResponse,
    RemoveMembershipResponse,
    ListMembershipsResponse,
    AddOrUpdateRatingResponse,
    GetRatingResponse,
    GetUserResponse,
    SignInResponse,
    SignOutResponse,
}

impl RequestType {
    pub const ALL: [RequestType; 10] = [
        RequestType::Search,
        RequestType::CheckMembership,
        RequestType::AddMembership,
        RequestType::RemoveMembership,
        RequestType::ListMemberships,
        RequestType::AddOrUpdateRating,
        RequestType::GetRating,
        RequestType::GetUser,
        RequestType::SignIn,
        RequestType::SignOut,
    ];

    pub const fn response_type(self) -> ResponseType {
        match self {
            RequestType::Search => ResponseType::SearchResponse,
            RequestType::CheckMembership => ResponseType::CheckMembershipResponse,
            RequestType::AddMembership => ResponseType::AddMembershipResponse,
            RequestType::RemoveMembership => ResponseType::RemoveMembershipResponse,
            RequestType::ListMemberships => ResponseType::ListMembershipsResponse,
            RequestType::AddOrUpdateRating => ResponseType::AddOrUpdateRatingResponse,
            RequestType::GetRating => ResponseType::GetRatingResponse,
            RequestType::GetUser => ResponseType::GetUserResponse,
            RequestType::SignIn => ResponseType::SignInResponse,
            RequestType::SignOut => ResponseType::SignOutResponse,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RequestType::Search => "SEARCH",
            RequestType::CheckMembership => "CHECK_MEMBERSHIP",
            RequestType::AddMembership => "ADD_MEMBERSHIP",
            RequestType::RemoveMembership => "REMOVE_MEMBERSHIP",
            RequestType::ListMemberships => "LIST_MEMBERSHIPS",
            RequestType::AddOrUpdateRating => "ADD_OR_UPDATE_RATING",
            RequestType::GetRating => "GET_RATING",
            RequestType::GetUser => "GET_USER",
            RequestType::SignIn => "SIGN_IN",
            RequestType::SignOut => "SIGN_OUT",
        }
    }
}

impl ResponseType {
    pub const fn request_type(self) -> RequestType {
        match self {
            ResponseType::SearchResponse => RequestType::Search,
            ResponseType::CheckMembershipResponse => RequestType::CheckMembership,
            ResponseType::AddMembershipResponse => RequestType::AddMembership,
            ResponseType::RemoveMembershipResponse => RequestType::RemoveMembership,
            ResponseType::ListMembershipsResponse => RequestType::ListMemberships,
            ResponseType::AddOrUpdateRatingResponse => RequestType::AddOrUpdateRating,
            ResponseType::GetRatingResponse => RequestType::GetRating,
            ResponseType::GetUserResponse => RequestType::GetUser,
            ResponseType::SignInResponse => RequestType::SignIn,
            ResponseType::SignOutResponse => RequestType::SignOut,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_RESPONSE", self.request_type().as_str())
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, echoed back in the response
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(kind: RequestType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
        }
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ResponseEnvelope {
    pub fn success(request: &RequestEnvelope, data: Value) -> Self {
        Self {
            id: request.id,
            kind: request.kind.response_type(),
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            status: None,
        }
    }

    pub fn failure(request: &RequestEnvelope, error: &BridgeError) -> Self {
        Self {
            id: request.id,
            kind: request.kind.response_type(),
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            status: error.status(),
        }
    }

    /// Whether this envelope answers `request`
    pub fn answers(&self, id: Uuid, kind: RequestType) -> bool {
        self.id == id && self.kind == kind.response_type()
    }

    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::from_wire(
                self.error_kind,
                self.status,
                self.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}
