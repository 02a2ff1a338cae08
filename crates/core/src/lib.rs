#![forbid(unsafe_code)]

pub mod jobs;

pub mod ids {
    use serde::{Deserialize, Serialize};

    /// Primary key of a relational row.
    pub type EntityId = i64;

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct EntityType(String);

    impl EntityType {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, EntityTypeError> {
            let value = value.into();
            validate_entity_type(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for EntityType {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl TryFrom<String> for EntityType {
        type Error = EntityTypeError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::try_new(value)
        }
    }

    impl From<EntityType> for String {
        fn from(value: EntityType) -> Self {
            value.0
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum EntityTypeError {
        #[error("entity type must not be empty")]
        Empty,
        #[error("entity type is longer than 64 characters")]
        TooLong,
        #[error("entity type must start with a lowercase letter")]
        InvalidFirstChar,
        #[error("invalid character {ch:?} at index {index} in entity type")]
        InvalidChar { ch: char, index: usize },
    }

    fn validate_entity_type(value: &str) -> Result<(), EntityTypeError> {
        if value.is_empty() {
            return Err(EntityTypeError::Empty);
        }
        if value.len() > 64 {
            return Err(EntityTypeError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(EntityTypeError::Empty);
        };
        if !first.is_ascii_lowercase() {
            return Err(EntityTypeError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
                continue;
            }
            return Err(EntityTypeError::InvalidChar { ch, index });
        }
        Ok(())
    }

    /// Key of provisionally uploaded bytes in the temporary container.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TempKey(String);

    impl TempKey {
        pub fn new(value: impl Into<String>) -> Self {
            Self(value.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl std::fmt::Display for TempKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct JobId(String);

    impl JobId {
        /// `{reference}_{sequence}_{entity_type}`; stable so a worker can dedup
        /// redelivered jobs.
        pub fn compose(reference: &str, sequence: u64, entity_type: &EntityType) -> Self {
            Self(format!("{reference}_{sequence}_{entity_type}"))
        }

        pub fn from_raw(value: impl Into<String>) -> Self {
            Self(value.into())
        }

        pub fn with_suffix(&self, suffix: &str) -> Self {
            Self(format!("{}_{suffix}", self.0))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl std::fmt::Display for JobId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }
}

pub mod content {
    use crate::ids::EntityId;

    /// Widest child id that still fits the three-digit object key convention.
    pub const MAX_CHILD_ID: EntityId = 999;
    const CHILD_KEY_WIDTH: usize = 3;

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ContentAddress {
        pub container: String,
        pub key: String,
    }

    impl ContentAddress {
        /// Permanent location of a child's bytes: container is the owner id,
        /// key is the child id left-padded with zeros so keys sort lexicographically.
        pub fn permanent(
            owner_id: EntityId,
            child_id: EntityId,
        ) -> Result<Self, ContentAddressError> {
            if owner_id < 0 {
                return Err(ContentAddressError::NegativeOwner(owner_id));
            }
            if child_id < 0 {
                return Err(ContentAddressError::NegativeChild(child_id));
            }
            if child_id > MAX_CHILD_ID {
                return Err(ContentAddressError::ChildOutOfRange(child_id));
            }
            Ok(Self {
                container: owner_id.to_string(),
                key: format!("{child_id:0width$}", width = CHILD_KEY_WIDTH),
            })
        }
    }

    impl std::fmt::Display for ContentAddress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}/{}", self.container, self.key)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum ContentAddressError {
        #[error("owner id must not be negative (got {0})")]
        NegativeOwner(EntityId),
        #[error("child id must not be negative (got {0})")]
        NegativeChild(EntityId),
        #[error("child id {0} exceeds the three-digit key range")]
        ChildOutOfRange(EntityId),
    }
}

pub mod model {
    use crate::ids::{EntityId, EntityType, TempKey};

    /// A row that owns blob content at `(owner_id, child_id)`.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct AttachmentChange {
        pub owner_id: EntityId,
        pub child_id: EntityId,
        pub temp_key: Option<TempKey>,
    }

    /// One lifecycle event fired by the unit of work after a statement has run.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct EntityChange {
        pub entity_type: EntityType,
        pub id: EntityId,
        pub attachment: Option<AttachmentChange>,
    }

    impl EntityChange {
        pub fn row(entity_type: EntityType, id: EntityId) -> Self {
            Self {
                entity_type,
                id,
                attachment: None,
            }
        }

        pub fn with_attachment(mut self, attachment: AttachmentChange) -> Self {
            self.attachment = Some(attachment);
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::content::{ContentAddress, ContentAddressError};
    use super::ids::{EntityType, EntityTypeError, JobId};

    #[test]
    fn entity_type_accepts_snake_case() {
        let ty = EntityType::try_new("plan_file").expect("valid type");
        assert_eq!(ty.as_str(), "plan_file");
    }

    #[test]
    fn entity_type_rejects_bad_input() {
        assert_eq!(EntityType::try_new(""), Err(EntityTypeError::Empty));
        assert_eq!(
            EntityType::try_new("Plan"),
            Err(EntityTypeError::InvalidFirstChar)
        );
        assert_eq!(
            EntityType::try_new("plan-file"),
            Err(EntityTypeError::InvalidChar { ch: '-', index: 4 })
        );
        assert_eq!(
            EntityType::try_new("p".repeat(65)),
            Err(EntityTypeError::TooLong)
        );
    }

    #[test]
    fn job_id_is_reference_sequence_type() {
        let ty = EntityType::try_new("plan").expect("type");
        let id = JobId::compose("ref-1", 3, &ty);
        assert_eq!(id.as_str(), "ref-1_3_plan");
        assert_eq!(id.with_suffix("attachments").as_str(), "ref-1_3_plan_attachments");
    }

    #[test]
    fn permanent_address_pads_child_to_three_digits() {
        let address = ContentAddress::permanent(10, 3).expect("address");
        assert_eq!(address.container, "10");
        assert_eq!(address.key, "003");
        assert_eq!(address.to_string(), "10/003");

        let widest = ContentAddress::permanent(7, 999).expect("address");
        assert_eq!(widest.key, "999");
    }

    #[test]
    fn permanent_address_rejects_out_of_range_children() {
        assert_eq!(
            ContentAddress::permanent(1, 1000),
            Err(ContentAddressError::ChildOutOfRange(1000))
        );
        assert_eq!(
            ContentAddress::permanent(-1, 1),
            Err(ContentAddressError::NegativeOwner(-1))
        );
        assert_eq!(
            ContentAddress::permanent(1, -2),
            Err(ContentAddressError::NegativeChild(-2))
        );
    }
}
