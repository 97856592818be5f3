use thiserror::Error;

/// Everything that can go wrong during one reconciliation cycle.
///
/// All four kinds are caught at the tick boundary and downgraded to a
/// reported error event; they never terminate the polling loop.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Network-level failure: timeout, connection refused, DNS.
    #[error("problems requesting feed: {0}")]
    Fetch(String),

    /// The feed answered with something other than 200 or 304.
    #[error("unable to fetch feed, status code: {0}")]
    HttpStatus(u16),

    /// The feed body was not valid JSON for the declared shape.
    #[error("unable to parse feed JSON: {0}")]
    Parse(String),

    /// Persistence failure. The cycle's writes have been rolled back.
    #[error("registry transaction failed: {0}")]
    Transaction(#[from] rusqlite::Error),
}

pub type FeedResult<T> = Result<T, FeedError>;
