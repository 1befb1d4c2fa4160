//! Core workflow types: actors, stages, content references and timestamps
use super::error::WorkflowError;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub enum Role {
    #[n(0)]
    Issuer,
    #[n(1)]
    FirstSigner,
    #[n(2)]
    SecondSigner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Issuer => "issuer",
            Role::FirstSigner => "first_signer",
            Role::SecondSigner => "second_signer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified identity. Produced by an authenticator, never by the workflow itself.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    #[n(0)]
    id: String,
    #[n(1)]
    role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn role(&self) -> Role {
        self.role
    }
}

/// Lifecycle position of a certificate. The derived ordering is the workflow order.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub enum Stage {
    #[n(0)]
    Drafted,
    #[n(1)]
    IssuedUnsigned,
    #[n(2)]
    FirstSigned,
    #[n(3)]
    SecondSigned,
    #[n(4)]
    Delivered,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Drafted,
        Stage::IssuedUnsigned,
        Stage::FirstSigned,
        Stage::SecondSigned,
        Stage::Delivered,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// The role whose inbox receives a certificate that has just reached this stage.
    pub fn handoff_recipient(&self) -> Option<Role> {
        match self {
            Stage::Drafted => None,
            Stage::IssuedUnsigned => Some(Role::FirstSigner),
            Stage::FirstSigned => Some(Role::SecondSigner),
            Stage::SecondSigned | Stage::Delivered => Some(Role::Issuer),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Drafted => "drafted",
            Stage::IssuedUnsigned => "issued_unsigned",
            Stage::FirstSigned => "first_signed",
            Stage::SecondSigned => "second_signed",
            Stage::Delivered => "delivered",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// newtype over the hex sha256 of an artifact's bytes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(super::utils::content_hash(bytes))
    }

    /// Parse a ref received from a caller. Must be 32 bytes of lowercase hex.
    pub fn parse(value: &str) -> Result<Self, WorkflowError> {
        let invalid = || WorkflowError::ArtifactNotFound(value.to_string());
        let raw = hex::decode(value).map_err(|_| invalid())?;
        if raw.len() != 32 || value.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<C> minicbor::Encode<C> for ArtifactRef {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for ArtifactRef {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let digest = d.str()?;
        if digest.len() != 64 {
            return Err(minicbor::decode::Error::message(
                "artifact ref is not a sha256 hex digest",
            ));
        }

        Ok(ArtifactRef(digest.to_string()))
    }
}
