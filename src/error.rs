use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("version conflict on document `{0}`")]
    VersionConflict(String),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("field `{field}` is not covered by index `{index}`")]
    FieldNotIndexed { index: String, field: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True when a commit was rejected because an expected version no longer
    /// matched the stored one.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
