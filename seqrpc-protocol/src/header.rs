//! Per-message envelope.

use serde::{Deserialize, Serialize};

/// Envelope preceding every request and every response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Target method, by convention `"Service.Method"`.
    pub service_method: String,
    /// Sequence number chosen by the client; unique among its in-flight calls.
    pub seq: u64,
    /// Server-side failure message; empty on success.
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Returns whether this header reports a server-side failure.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Splits `"Service.Method"` at the last dot.
    pub fn split_method(&self) -> Option<(&str, &str)> {
        let (service, method) = self.service_method.rsplit_once('.')?;
        if service.is_empty() || method.is_empty() {
            return None;
        }
        Some((service, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_new_has_no_error() {
        let h = Header::new("User.Sum", 3);
        assert_eq!(h.seq, 3);
        assert!(!h.is_error());
    }

    #[test]
    fn test_split_method() {
        let h = Header::new("User.Sum", 1);
        assert_eq!(h.split_method(), Some(("User", "Sum")));

        let h = Header::new("pkg.User.Sum", 1);
        assert_eq!(h.split_method(), Some(("pkg.User", "Sum")));

        assert_eq!(Header::new("Sum", 1).split_method(), None);
        assert_eq!(Header::new("User.", 1).split_method(), None);
        assert_eq!(Header::new(".Sum", 1).split_method(), None);
    }

    #[test]
    fn test_header_field_names() {
        let json = serde_json::to_value(Header::new("User.Sum", 7)).unwrap();
        assert_eq!(json["serviceMethod"], "User.Sum");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["error"], "");
    }
}
