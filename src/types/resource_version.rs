use crate::CacheError;
use crate::Result;

/// Parses a request resource version. The unset value `""` parses as 0.
pub fn parse_resource_version(resource_version: &str) -> Result<u64> {
    if resource_version.is_empty() {
        return Ok(0);
    }
    resource_version
        .parse::<u64>()
        .map_err(|_| CacheError::InvalidResourceVersion(resource_version.to_string()).into())
}
