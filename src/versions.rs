//! Semantic version helpers.
use tap::Pipe;

/// Error parsing a version string.
pub type Error = semver::Error;
/// A semantic version.
pub type Version = semver::Version;

/// Parse a semver complaint version.
///
/// # Errors
///
/// Returns [`Error`] when the tag is not a valid semantic version.
pub fn parse_version(tag: &str) -> Result<Version, Error> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    Version::parse(tag)?.pipe(Ok)
}
