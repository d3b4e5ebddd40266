#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Select at least two {0} nodes to merge")]
    NotEnoughNodes(&'static str),
    #[error("A {expected} node was expected, found a {found} node")]
    UnexpectedLevel {
        expected: &'static str,
        found: &'static str,
    },
    #[error("All selected studies must belong to the same patient")]
    StudiesNotUnderSamePatient,
    #[error("All selected series must belong to the same study")]
    SeriesNotUnderSameStudy,
    #[error("No instance files found under the primary node")]
    PrimaryHasNoFiles,
    #[error("Failed to read primary node metadata: {0}")]
    PrimaryRead(#[source] dcmkit_common::Error),
    #[error("Unknown node handle")]
    UnknownNode,
}

pub type Result<T> = std::result::Result<T, Error>;
