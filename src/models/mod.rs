// Data models shared by the bridge contract and the document store

pub mod film;

pub use film::{MembershipRecord, Movie, Rating, MAX_RATING};
