use crate::error::{EmbedditError, Result};

/// Validate a path segment used as a media or share id.
///
/// Ids are interpolated into upstream URLs and into output file names, so
/// only `[A-Za-z0-9_-]` is allowed. Rejects empty and oversized segments.
pub fn validate_media_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(EmbedditError::InvalidMediaId(id.to_string()));
    }
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(EmbedditError::InvalidMediaId(id.to_string()))
    }
}
