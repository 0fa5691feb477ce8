/// Download Sources
///
/// A source is an endpoint able to serve bytes for a content hash: either a
/// peer in the overlay or a conventional mirror. Sources are stateless
/// handles; every mutable observation about them lives in the peer scorer or
/// the per-job source tracker. The actual wire protocol is injected as a
/// [`Transport`], which keeps the engine testable against scripted
/// transports.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Byte-fetch operations a transport must support for a content hash.
///
/// `fetch_range` uses half-open `[start, end)` offsets. Implementations may
/// return fewer bytes than requested; the engine treats a short read as a
/// failed attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_range(&self, hash: &str, start: u64, end: u64) -> Result<Bytes>;
    async fn fetch_full(&self, hash: &str) -> Result<Bytes>;
}

/// Whether a source is a peer in the overlay or a plain mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Peer,
    Mirror,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Peer => write!(f, "peer"),
            SourceKind::Mirror => write!(f, "mirror"),
        }
    }
}

enum Endpoint {
    Peer { peer_id: String },
    Mirror { url: String },
}

/// A handle to one endpoint serving package bytes.
#[derive(Clone)]
pub struct Source {
    endpoint: Arc<Endpoint>,
    transport: Arc<dyn Transport>,
}

impl Source {
    pub fn peer(peer_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint: Arc::new(Endpoint::Peer {
                peer_id: peer_id.into(),
            }),
            transport,
        }
    }

    pub fn mirror(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint: Arc::new(Endpoint::Mirror { url: url.into() }),
            transport,
        }
    }

    /// Stable identifier: the peer id for peers, the URL for mirrors.
    pub fn id(&self) -> &str {
        match self.endpoint.as_ref() {
            Endpoint::Peer { peer_id } => peer_id,
            Endpoint::Mirror { url } => url,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.endpoint.as_ref() {
            Endpoint::Peer { .. } => SourceKind::Peer,
            Endpoint::Mirror { .. } => SourceKind::Mirror,
        }
    }

    /// Peer id when this source is a peer; used for per-peer throttling and
    /// scoring. Mirrors have no peer id and are charged only globally.
    pub fn peer_id(&self) -> Option<&str> {
        match self.endpoint.as_ref() {
            Endpoint::Peer { peer_id } => Some(peer_id),
            Endpoint::Mirror { .. } => None,
        }
    }

    /// Fetch the half-open byte range `[start, end)`. `end = 0` means "to
    /// the end of the file" and degrades to a full fetch.
    pub async fn download(&self, hash: &str, start: u64, end: u64) -> Result<Bytes> {
        if end == 0 {
            let data = self.transport.fetch_full(hash).await?;
            if start > 0 {
                let start = (start as usize).min(data.len());
                return Ok(data.slice(start..));
            }
            return Ok(data);
        }
        self.transport.fetch_range(hash, start, end).await
    }

    /// Fetch the whole artifact in one request.
    pub async fn download_full(&self, hash: &str) -> Result<Bytes> {
        self.transport.fetch_full(hash).await
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticTransport {
        data: Vec<u8>,
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn fetch_range(&self, _hash: &str, start: u64, end: u64) -> Result<Bytes> {
            let end = (end as usize).min(self.data.len());
            Ok(Bytes::copy_from_slice(&self.data[start as usize..end]))
        }

        async fn fetch_full(&self, _hash: &str) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(&self.data))
        }
    }

    #[tokio::test]
    async fn range_fetch_is_half_open() {
        let transport = Arc::new(StaticTransport {
            data: (0u8..100).collect(),
        });
        let source = Source::peer("peer-1", transport);

        let bytes = source.download("h", 10, 20).await.unwrap();
        assert_eq!(bytes.as_ref(), &(10u8..20).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn zero_end_means_to_end() {
        let transport = Arc::new(StaticTransport {
            data: (0u8..50).collect(),
        });
        let source = Source::mirror("http://mirror.example/pool", transport);

        let bytes = source.download("h", 30, 0).await.unwrap();
        assert_eq!(bytes.as_ref(), &(30u8..50).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn identity_and_kind() {
        let transport = Arc::new(StaticTransport { data: vec![] });
        let peer = Source::peer("12D3KooWabc", transport.clone());
        let mirror = Source::mirror("http://deb.example/pool/x.deb", transport);

        assert_eq!(peer.kind(), SourceKind::Peer);
        assert_eq!(peer.id(), "12D3KooWabc");
        assert_eq!(peer.peer_id(), Some("12D3KooWabc"));
        assert_eq!(mirror.kind(), SourceKind::Mirror);
        assert_eq!(mirror.peer_id(), None);
    }
}
