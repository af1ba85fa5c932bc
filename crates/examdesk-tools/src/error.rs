use thiserror::Error;

use examdesk_types::Collection;

use crate::query::Operation;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown collection `{0}`")]
    UnknownCollection(String),

    #[error("operation `{0}` is not supported; use `select`")]
    UnsupportedOperation(Operation),

    #[error("no {collection} row has {field} = {value}")]
    UnresolvedReference {
        collection: Collection,
        field: &'static str,
        value: String,
    },

    #[error("content store request to {collection} failed: {message}")]
    Store {
        collection: Collection,
        message: String,
    },

    #[error("unexpected {collection} row: {message}")]
    Decode {
        collection: Collection,
        message: String,
    },
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidArguments(_) => "QUERY_INVALID_ARGUMENTS",
            QueryError::UnknownCollection(_) => "QUERY_UNKNOWN_COLLECTION",
            QueryError::UnsupportedOperation(_) => "QUERY_UNSUPPORTED_OPERATION",
            QueryError::UnresolvedReference { .. } => "QUERY_UNRESOLVED_REFERENCE",
            QueryError::Store { .. } => "QUERY_STORE_FAILED",
            QueryError::Decode { .. } => "QUERY_DECODE_FAILED",
        }
    }

    pub(crate) fn store(collection: Collection, err: anyhow::Error) -> Self {
        QueryError::Store {
            collection,
            message: format!("{err:#}"),
        }
    }
}
