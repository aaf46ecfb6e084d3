//! Deterministic identifiers
//!
//! Batch ids and document ids are MD5 digests of case-normalized input.
//! The analytical store keys documents on these values, so the digest and the
//! normalization must never change between releases.

/// MD5 of the lowercased input, as 32 lowercase hex characters.
pub fn hashify(input: &str) -> String {
    format!("{:x}", md5::compute(input.to_lowercase().as_bytes()))
}

/// Concatenate `parts` without a separator and [`hashify`] the result.
pub fn hashify_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: String = parts.into_iter().map(|p| p.as_ref().to_string()).collect();
    hashify(&joined)
}
