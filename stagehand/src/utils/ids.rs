//! Identifier generation.

use uuid::Uuid;

/// Generates a new execution id.
///
/// Ids are UUIDv7 so their lexical order follows creation time.
#[must_use]
pub fn new_execution_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a new stage id.
#[must_use]
pub fn new_stage_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates an opaque lease owner token.
#[must_use]
pub fn new_lease_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_is_v7() {
        let id = Uuid::parse_str(&new_execution_id()).unwrap();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_lease_tokens_are_unique() {
        assert_ne!(new_lease_token(), new_lease_token());
    }
}
