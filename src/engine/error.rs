use ulid::Ulid;

use super::validate::ValidationErrors;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The lend broke one or more validation rules.
    Invalid(ValidationErrors),
    /// Still referenced by lends or notes.
    InUse(Ulid),
    /// Another tag already uses this name.
    NameTaken(String),
    BadField(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Invalid(errors) => write!(f, "{errors}"),
            EngineError::InUse(id) => write!(f, "still in use: {id}"),
            EngineError::NameTaken(name) => write!(f, "name already taken: {name}"),
            EngineError::BadField(msg) => write!(f, "bad field: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationErrors> for EngineError {
    fn from(errors: ValidationErrors) -> Self {
        EngineError::Invalid(errors)
    }
}
