//! Persistent volume resolution per (user, environment).

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::container::{ContainerRuntimeApi, LABEL_ENVIRONMENT, LABEL_MANAGED, LABEL_USER};

use super::error::{SessionError, SessionResult};

/// Prefix for every volume this service creates.
const VOLUME_PREFIX: &str = "sandterm";

/// Readable characters kept from the user ID.
const USER_PART_MAX: usize = 32;
/// Readable characters kept from the environment name.
const ENV_PART_MAX: usize = 16;
/// Hex digits of the identity digest.
const DIGEST_LEN: usize = 12;

/// Maps a user and environment onto a named runtime volume.
#[derive(Clone)]
pub struct VolumeResolver {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl VolumeResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    /// Deterministic volume name for a user and environment.
    ///
    /// The readable part is sanitized to `[a-z0-9_-]` and truncated, so it
    /// only serves display. Identity comes from the digest of the raw pair,
    /// which is always appended: distinct pairs never share a volume and the
    /// name length is bounded.
    pub fn volume_name(user_id: &str, environment: &str) -> String {
        let user = sanitize(user_id, USER_PART_MAX);
        let env = sanitize(environment, ENV_PART_MAX);

        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(environment.as_bytes());
        let digest = hex::encode(hasher.finalize());

        format!("{VOLUME_PREFIX}-{user}-{env}-{}", &digest[..DIGEST_LEN])
    }

    /// Get or create the volume for a user and environment.
    ///
    /// Idempotent: a concurrent creator winning the race is success.
    pub async fn ensure_volume(&self, user_id: &str, environment: &str) -> SessionResult<String> {
        let name = Self::volume_name(user_id, environment);
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_USER.to_string(), user_id.to_string()),
            (LABEL_ENVIRONMENT.to_string(), environment.to_string()),
        ]);

        match self.runtime.create_volume(&name, &labels).await {
            Ok(()) => {
                info!("Ensured volume {} for user {}", name, user_id);
                Ok(name)
            }
            Err(e) if e.is_already_exists() => {
                debug!("Volume {} already exists", name);
                Ok(name)
            }
            Err(source) => Err(SessionError::Volume {
                volume: name,
                source,
            }),
        }
    }
}

fn sanitize(raw: &str, max: usize) -> String {
    let cleaned: String = raw
        .chars()
        .take(max)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "x".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::validate_container_name;

    #[test]
    fn volume_name_is_deterministic() {
        let name = VolumeResolver::volume_name("u1", "default");
        assert!(name.starts_with("sandterm-u1-default-"));
        assert_eq!(name.len(), "sandterm-u1-default-".len() + DIGEST_LEN);
        assert_eq!(name, VolumeResolver::volume_name("u1", "default"));
    }

    #[test]
    fn separator_in_components_does_not_collide() {
        assert_ne!(
            VolumeResolver::volume_name("a-b", "c"),
            VolumeResolver::volume_name("a", "b-c")
        );
    }

    #[test]
    fn lossy_names_stay_distinct() {
        let a = VolumeResolver::volume_name("Alice@Example", "default");
        let b = VolumeResolver::volume_name("alice-example", "default");
        let c = VolumeResolver::volume_name("alice.example", "default");
        assert!(a.starts_with("sandterm-alice-example-default-"));
        assert!(b.starts_with("sandterm-alice-example-default-"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn long_user_ids_stay_within_name_limits() {
        let long = "u".repeat(200);
        let name = VolumeResolver::volume_name(&long, &"e".repeat(100));
        assert!(validate_container_name(&name).is_ok(), "{name}");

        // Same readable prefix, different identity.
        let other = VolumeResolver::volume_name(&"u".repeat(201), &"e".repeat(100));
        assert_ne!(name, other);
    }

    #[test]
    fn empty_inputs_produce_valid_names() {
        let name = VolumeResolver::volume_name("", "");
        assert!(validate_container_name(&name).is_ok());
    }
}
