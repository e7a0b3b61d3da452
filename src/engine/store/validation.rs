//! Validation hooks run before a revision is committed

use super::revision::Revision;

/// What a validator can see besides the incoming revision
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// The revision being replaced, if any
    pub current_revision: Option<Revision>,
}

/// Rejects a revision by returning a reason; the store aborts the write with
/// `Forbidden`.
pub trait Validator: Send + Sync {
    fn validate(&self, revision: &Revision, context: &ValidationContext) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&Revision, &ValidationContext) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, revision: &Revision, context: &ValidationContext) -> Result<(), String> {
        self(revision, context)
    }
}
