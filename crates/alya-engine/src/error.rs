use std::fmt;

/// Errors exposed at the collaborator-facing engine API (§6).
#[derive(Debug)]
pub enum EngineError {
    ProcessorAlreadyRegistered,
    NoProcessor,
    NotFound,
    AlreadyTerminal,
    InvalidInput(String),
    StoreUnavailable(String),
    CacheUnavailable(String),
    ObjectStoreUnavailable(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ProcessorAlreadyRegistered => {
                write!(f, "ENGINE_PROCESSOR_ALREADY_REGISTERED")
            }
            EngineError::NoProcessor => write!(f, "ENGINE_NO_PROCESSOR"),
            EngineError::NotFound => write!(f, "ENGINE_NOT_FOUND"),
            EngineError::AlreadyTerminal => write!(f, "ENGINE_ALREADY_TERMINAL"),
            EngineError::InvalidInput(detail) => write!(f, "ENGINE_INVALID_INPUT: {detail}"),
            EngineError::StoreUnavailable(detail) => write!(f, "ENGINE_STORE_UNAVAILABLE: {detail}"),
            EngineError::CacheUnavailable(detail) => write!(f, "ENGINE_CACHE_UNAVAILABLE: {detail}"),
            EngineError::ObjectStoreUnavailable(detail) => {
                write!(f, "ENGINE_OBJECTSTORE_UNAVAILABLE: {detail}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<alya_db::StoreError> for EngineError {
    fn from(err: alya_db::StoreError) -> Self {
        match err {
            alya_db::StoreError::NotFound => EngineError::NotFound,
            alya_db::StoreError::AlreadyTerminal => EngineError::AlreadyTerminal,
            alya_db::StoreError::Conflict => EngineError::StoreUnavailable("conflict".into()),
            alya_db::StoreError::StoreUnavailable(detail) => EngineError::StoreUnavailable(detail),
        }
    }
}

impl From<alya_cache::CacheError> for EngineError {
    fn from(err: alya_cache::CacheError) -> Self {
        match err {
            alya_cache::CacheError::CacheUnavailable(detail) => EngineError::CacheUnavailable(detail),
        }
    }
}

impl From<alya_objectstore::ObjectStoreError> for EngineError {
    fn from(err: alya_objectstore::ObjectStoreError) -> Self {
        match err {
            alya_objectstore::ObjectStoreError::NotFound => EngineError::NotFound,
            alya_objectstore::ObjectStoreError::ObjectStoreUnavailable(detail) => {
                EngineError::ObjectStoreUnavailable(detail)
            }
        }
    }
}

impl From<alya_registry::RegistryError> for EngineError {
    fn from(err: alya_registry::RegistryError) -> Self {
        match err {
            alya_registry::RegistryError::ProcessorAlreadyRegistered => {
                EngineError::ProcessorAlreadyRegistered
            }
            alya_registry::RegistryError::NoProcessor => EngineError::NoProcessor,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
