//! Artwork resolution for presence assets.
//!
//! Resolution is asynchronous and unbounded in latency, so it is modeled as
//! an explicit task whose completion gates a session's *first* presence
//! update only; once settled (resolved or absent) it never blocks again.

use async_trait::async_trait;

use crate::media::MediaItem;

/// Identifies an external resource backing an artwork reference, to be
/// released once the owning session ends.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ResourceHandle(pub u64);

/// An externally reachable artwork reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artwork {
    /// Image reference understood by the gateway.
    pub image: String,

    /// Secondary text shown alongside the image.
    pub caption: Option<String>,

    /// Cleanup handle for the backing resource, when one exists.
    pub handle: Option<ResourceHandle>,
}

/// Progress of a session's artwork fetch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArtworkStatus {
    /// Fetch still in flight; the session's first update is gated on it.
    Pending,
    /// Fetch produced a usable reference.
    Resolved(Artwork),
    /// Fetch finished without artwork; presence proceeds without it.
    Absent,
}

impl ArtworkStatus {
    /// Whether the fetch has finished, either way.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The resolved artwork, if any.
    #[must_use]
    pub fn artwork(&self) -> Option<&Artwork> {
        match self {
            Self::Resolved(artwork) => Some(artwork),
            _ => None,
        }
    }
}

/// Resolves media items to artwork references.
///
/// Invoked once per playback session. Implementations must degrade to
/// `None` on failure rather than propagate errors; a missing poster is not
/// worth blocking presence over.
#[async_trait]
pub trait ArtworkResolver: Send + Sync {
    async fn resolve(&self, item: &MediaItem) -> Option<Artwork>;

    /// Releases the external resource behind a previously returned handle.
    async fn release(&self, handle: ResourceHandle) {
        let _ = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_not_settled() {
        assert!(!ArtworkStatus::Pending.is_settled());
        assert!(ArtworkStatus::Absent.is_settled());
        assert!(ArtworkStatus::Resolved(Artwork {
            image: "https://img.example/poster.jpg".to_string(),
            caption: None,
            handle: None,
        })
        .is_settled());
    }

    #[test]
    fn artwork_accessor_only_yields_resolved() {
        assert!(ArtworkStatus::Pending.artwork().is_none());
        assert!(ArtworkStatus::Absent.artwork().is_none());

        let artwork = Artwork {
            image: "https://img.example/poster.jpg".to_string(),
            caption: Some("Heat (1995)".to_string()),
            handle: Some(ResourceHandle(42)),
        };
        let status = ArtworkStatus::Resolved(artwork.clone());
        assert_eq!(status.artwork(), Some(&artwork));
    }
}
