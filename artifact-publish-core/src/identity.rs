//! Commit attribution: published commits carry the triggering author's identity.

use tracing::{error, info};

use crate::contract::{Identity, SourceRevision};
use crate::error::IdentityError;

/// Derive the author identity for a published commit from `revision`.
///
/// The result matches the revision's author fields exactly. Missing metadata
/// is an error; the automation's own identity is never substituted.
pub fn resolve_identity(revision: &SourceRevision) -> Result<Identity, IdentityError> {
    let name = revision.author_name.as_str();
    let email = revision.author_email.as_str();

    if name.trim().is_empty() {
        error!(revision = %revision.id, "[IDENTITY] Revision has no author name");
        return Err(IdentityError::MissingName {
            revision: revision.id.clone(),
        });
    }
    if email.trim().is_empty() {
        error!(revision = %revision.id, "[IDENTITY] Revision has no author email");
        return Err(IdentityError::MissingEmail {
            revision: revision.id.clone(),
        });
    }
    if !is_plausible_email(email.trim()) {
        error!(revision = %revision.id, email, "[IDENTITY] Author email is not usable");
        return Err(IdentityError::InvalidEmail {
            revision: revision.id.clone(),
            email: email.to_string(),
        });
    }

    info!(revision = %revision.id, name, email, "[IDENTITY] Resolved commit author");
    Ok(Identity {
        name: name.to_string(),
        email: email.to_string(),
    })
}

/// Accepts anything git would accept inside `<...>` with a local part and a domain.
fn is_plausible_email(email: &str) -> bool {
    if email.contains(['<', '>', '\n']) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    }
}
