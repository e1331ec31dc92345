//! Keel secret provisioning.
//!
//! [`ensure_managed_secret`] creates a credential secret at most once per
//! owner, refuses to adopt a secret it does not own, and records the
//! secret's name on the owner's spec.

#![forbid(unsafe_code)]

mod password;
mod provision;

pub use password::{generate_password, is_shell_safe, user_password, PASSWORD_KEY, USERNAME_KEY};
pub use provision::{
    decode_data, ensure_managed_secret, ownership_labels, SecretReference, SecretRequest, MAX_GENERATE_ATTEMPTS,
    OWNER_KIND_LABEL, OWNER_NAME_LABEL,
};
