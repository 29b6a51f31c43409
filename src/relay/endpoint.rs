// src/relay/endpoint.rs
//! Route parsing and endpoint identities
//!
//! Inbound paths look like `/{service}/{token}/{endpoint-path}`. The
//! endpoint path is classified once into a closed `Endpoint` enum; every
//! downstream decision matches on it exhaustively.

use hyper::Method;

/// Inbound path split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath {
    pub service: String,
    pub token: String,
    /// Remainder including the leading slash, forwarded to the upstream
    pub endpoint_path: String,
}

impl RoutePath {
    /// `None` when the path does not start with `/{service}/{token}/`
    pub fn parse(path: &str, service: &str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        let rest = rest.strip_prefix(service)?;
        let rest = rest.strip_prefix('/')?;
        let (token, endpoint) = rest.split_once('/')?;
        if token.is_empty() {
            return None;
        }

        Some(Self {
            service: service.to_string(),
            token: token.to_string(),
            endpoint_path: format!("/{}", endpoint),
        })
    }
}

/// Known reading-services endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// GET `/api/v3/content/{book}/annotations`
    GetAnnotations { book_id: String },

    /// PATCH `/api/v3/content/{book}/annotations`
    PatchAnnotations { book_id: String },

    /// POST `/api/v3/content/checkforchanges`
    CheckForChanges,

    /// Any method on `/api/UserStorage/{subpath}`
    UserStorage { subpath: String },

    /// Everything else, always forwarded
    Other,
}

impl Endpoint {
    pub fn classify(method: &Method, endpoint_path: &str) -> Self {
        let segments: Vec<&str> = endpoint_path
            .trim_start_matches('/')
            .split('/')
            .collect();

        match segments.as_slice() {
            ["api", "v3", "content", "checkforchanges"] if *method == Method::POST => {
                Endpoint::CheckForChanges
            }
            ["api", "v3", "content", book, "annotations"] if !book.is_empty() => {
                let book_id = book.to_string();
                match *method {
                    Method::GET => Endpoint::GetAnnotations { book_id },
                    Method::PATCH => Endpoint::PatchAnnotations { book_id },
                    _ => Endpoint::Other,
                }
            }
            ["api", "UserStorage", rest @ ..] if !rest.is_empty() => Endpoint::UserStorage {
                subpath: rest.join("/"),
            },
            _ => Endpoint::Other,
        }
    }

    /// Only side-effect-free reads may be answered locally
    pub fn is_emulation_eligible(&self) -> bool {
        match self {
            Endpoint::GetAnnotations { .. } => true,
            Endpoint::PatchAnnotations { .. } => false,
            Endpoint::CheckForChanges => false,
            Endpoint::UserStorage { .. } => false,
            Endpoint::Other => false,
        }
    }

    /// Whether the request changes state on the upstream service.
    ///
    /// Passthrough endpoints count as mutations unless known otherwise.
    pub fn is_mutation(&self) -> bool {
        match self {
            Endpoint::GetAnnotations { .. } => false,
            Endpoint::PatchAnnotations { .. } => true,
            Endpoint::CheckForChanges => false,
            Endpoint::UserStorage { .. } => true,
            Endpoint::Other => true,
        }
    }

    pub fn book_id(&self) -> Option<&str> {
        match self {
            Endpoint::GetAnnotations { book_id } | Endpoint::PatchAnnotations { book_id } => {
                Some(book_id)
            }
            Endpoint::CheckForChanges | Endpoint::UserStorage { .. } | Endpoint::Other => None,
        }
    }

    /// Stable label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::GetAnnotations { .. } => "get_annotations",
            Endpoint::PatchAnnotations { .. } => "patch_annotations",
            Endpoint::CheckForChanges => "check_for_changes",
            Endpoint::UserStorage { .. } => "user_storage",
            Endpoint::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse() {
        let route = RoutePath::parse(
            "/readingservices/tok123/api/v3/content/b1/annotations",
            "readingservices",
        )
        .unwrap();
        assert_eq!(route.token, "tok123");
        assert_eq!(route.endpoint_path, "/api/v3/content/b1/annotations");
    }

    #[test]
    fn test_route_parse_rejects_foreign_paths() {
        assert!(RoutePath::parse("/other/tok/api", "readingservices").is_none());
        assert!(RoutePath::parse("/readingservices/tok", "readingservices").is_none());
        assert!(RoutePath::parse("/readingservices//api", "readingservices").is_none());
        assert!(RoutePath::parse("/readingservicesX/tok/api", "readingservices").is_none());
    }

    #[test]
    fn test_classify_annotations() {
        assert_eq!(
            Endpoint::classify(&Method::GET, "/api/v3/content/b1/annotations"),
            Endpoint::GetAnnotations { book_id: "b1".into() }
        );
        assert_eq!(
            Endpoint::classify(&Method::PATCH, "/api/v3/content/b1/annotations"),
            Endpoint::PatchAnnotations { book_id: "b1".into() }
        );
        assert_eq!(
            Endpoint::classify(&Method::DELETE, "/api/v3/content/b1/annotations"),
            Endpoint::Other
        );
    }

    #[test]
    fn test_classify_passthrough() {
        assert_eq!(
            Endpoint::classify(&Method::POST, "/api/v3/content/checkforchanges"),
            Endpoint::CheckForChanges
        );
        assert_eq!(
            Endpoint::classify(&Method::GET, "/api/UserStorage/Metadata"),
            Endpoint::UserStorage { subpath: "Metadata".into() }
        );
        assert_eq!(Endpoint::classify(&Method::GET, "/api/v3/other"), Endpoint::Other);
    }

    #[test]
    fn test_only_reads_are_eligible() {
        let endpoints = [
            Endpoint::GetAnnotations { book_id: "b".into() },
            Endpoint::PatchAnnotations { book_id: "b".into() },
            Endpoint::CheckForChanges,
            Endpoint::UserStorage { subpath: "Metadata".into() },
            Endpoint::Other,
        ];
        for endpoint in endpoints {
            if endpoint.is_mutation() {
                assert!(!endpoint.is_emulation_eligible(), "{:?}", endpoint);
            }
        }
    }
}
