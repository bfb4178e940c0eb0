use chat_utils::ArrayVec;

use crate::error::FramingError;

/// Hard ceiling on any single `BoundedString` payload, matching the 16-bit
/// wire length field and the protocol's maximum string length.
pub const MAX_STRING_LEN: usize = 4095;

/// A byte string capped at [`MAX_STRING_LEN`] bytes, carried over the wire as
/// a big-endian 16-bit length followed by that many bytes.
///
/// Contents are not required to be UTF-8; sanitisation (see
/// [`crate::sanitize`]) is what narrows them to printable ASCII.
#[derive(Clone, Copy, Default)]
pub struct BoundedString {
    bytes: ArrayVec<u8, MAX_STRING_LEN>,
}

impl BoundedString {
    pub const fn new() -> Self {
        Self { bytes: ArrayVec::new() }
    }

    /// Builds a `BoundedString` from a slice already known to fit.
    ///
    /// Returns `FramingError::OversizeLength` if `data` is longer than
    /// [`MAX_STRING_LEN`].
    pub fn from_slice(data: &[u8]) -> Result<Self, FramingError> {
        if data.len() > MAX_STRING_LEN {
            return Err(FramingError::OversizeLength(data.len() as u16));
        }
        let mut bytes = ArrayVec::new();
        bytes.extend(data.iter().copied());
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Renders as `str` for logging/diagnostics. Lossy: non-UTF-8 bytes
    /// (only possible before sanitisation) are replaced.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl From<&str> for BoundedString {
    /// Truncates to [`MAX_STRING_LEN`] bytes rather than panicking; callers
    /// building server-originated text are expected to stay well under the
    /// limit.
    fn from(s: &str) -> Self {
        let truncated = &s.as_bytes()[..s.len().min(MAX_STRING_LEN)];
        let mut bytes = ArrayVec::new();
        bytes.extend(truncated.iter().copied());
        Self { bytes }
    }
}

impl std::fmt::Debug for BoundedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoundedString({:?})", self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_within_capacity() {
        let s = BoundedString::from_slice(b"ali").unwrap();
        assert_eq!(s.as_bytes(), b"ali");
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn from_slice_empty() {
        let s = BoundedString::from_slice(b"").unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn from_slice_at_max() {
        let data = vec![b'x'; MAX_STRING_LEN];
        let s = BoundedString::from_slice(&data).unwrap();
        assert_eq!(s.len(), MAX_STRING_LEN);
    }

    #[test]
    fn from_slice_over_max_rejected() {
        let data = vec![b'x'; MAX_STRING_LEN + 1];
        let err = BoundedString::from_slice(&data).unwrap_err();
        assert!(matches!(err, FramingError::OversizeLength(_)));
    }

    #[test]
    fn from_str_truncates_rather_than_panics() {
        let huge = "y".repeat(MAX_STRING_LEN + 10);
        let s = BoundedString::from(huge.as_str());
        assert_eq!(s.len(), MAX_STRING_LEN);
    }
}
