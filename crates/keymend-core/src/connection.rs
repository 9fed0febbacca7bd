//! Data-node connection over the binary protocol
//!
//! One [`NodeConnection`] is one TCP (or TLS) stream with buffered packet
//! I/O. Opening it performs the full handshake: HELLO feature negotiation,
//! SASL PLAIN authentication and bucket selection.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{KvError, Result};
use crate::node::{AddOutcome, DeleteOutcome, GetOutcome, KvNode, NodeConnector, Xattrs};
use crate::protocol::{
    encode_request, parse_response, Feature, Opcode, Request, Response, Status, DATATYPE_JSON,
    SUBDOC_FLAG_XATTR_PATH,
};
use crate::topology::ClusterMap;
use crate::vbucket::VBucketId;

/// Default read/write buffer size (16 KB)
const DEFAULT_BUF_SIZE: usize = 16 * 1024;

/// Virtual xattr listing every attribute name of a document
const XATTR_TOC_PATH: &str = "$XTOC";

/// TLS options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Extra CA certificate (PEM)
    pub ca_file: Option<PathBuf>,
    /// Verify the server certificate chain
    pub verify: bool,
}

/// Configuration shared by every node connection of a run
#[derive(Clone)]
pub struct ConnectionConfig {
    pub bucket: String,
    pub username: String,
    pub password: String,
    /// `Some` to wrap every connection in TLS
    pub tls: Option<TlsSettings>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Negotiate collection-prefixed keys
    pub collections: bool,
    /// Agent name sent with HELLO
    pub agent: String,
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bucket: "default".into(),
            username: "Administrator".into(),
            password: String::new(),
            tls: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            collections: true,
            agent: "keymend".into(),
            buffer_size: DEFAULT_BUF_SIZE,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("bucket", &self.bucket)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("collections", &self.collections)
            .field("agent", &self.agent)
            .finish()
    }
}

impl ConnectionConfig {
    /// Features requested in HELLO
    pub fn requested_features(&self) -> Vec<Feature> {
        let mut features = vec![Feature::SelectBucket, Feature::Json, Feature::Xattr];
        if self.collections {
            features.push(Feature::Collections);
        }
        features
    }
}

/// Abstraction over plain TCP and TLS streams.
enum Stream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// An authenticated, bucket-bound connection to one data node
pub struct NodeConnection {
    addr: String,
    stream: Stream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_opaque: u32,
    request_timeout: Duration,
    features: Vec<Feature>,
    /// Set once the stream can no longer be trusted to be in sync
    broken: bool,
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("addr", &self.addr)
            .field("features", &self.features)
            .field("broken", &self.broken)
            .finish()
    }
}

impl NodeConnection {
    /// Open and authenticate a connection to `host:port`
    pub async fn connect(
        config: &ConnectionConfig,
        tls: Option<&TlsConnector>,
        host: &str,
        port: u16,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        debug!(%addr, "connecting to data node");

        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                KvError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    addr, config.connect_timeout
                ))
            })?
            .map_err(|e| KvError::Connection(format!("connect to {} failed: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let stream = match tls {
            Some(connector) => {
                let domain = crate::tls::server_name(host)?;
                let tls_stream =
                    tokio::time::timeout(config.connect_timeout, connector.connect(domain, tcp))
                        .await
                        .map_err(|_| {
                            KvError::Connection(format!("TLS handshake with {} timed out", addr))
                        })?
                        .map_err(|e| {
                            KvError::Connection(format!("TLS handshake with {} failed: {}", addr, e))
                        })?;
                Stream::Tls(Box::new(tls_stream))
            }
            None => Stream::Tcp(tcp),
        };

        let mut conn = Self {
            addr,
            stream,
            read_buf: BytesMut::with_capacity(config.buffer_size),
            write_buf: BytesMut::with_capacity(config.buffer_size),
            next_opaque: 0,
            request_timeout: config.request_timeout,
            features: Vec::new(),
            broken: false,
        };

        conn.hello(&config.agent, &config.requested_features()).await?;
        if config.collections && !conn.features.contains(&Feature::Collections) {
            return Err(KvError::ConfigInconsistency(format!(
                "{} did not enable collections",
                conn.addr
            )));
        }
        conn.authenticate(&config.username, &config.password).await?;
        conn.select_bucket(&config.bucket).await?;

        debug!(addr = %conn.addr, features = ?conn.features, "data node ready");
        Ok(conn)
    }

    /// Address this connection was dialled on
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Features the server agreed to
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    async fn hello(&mut self, agent: &str, features: &[Feature]) -> Result<()> {
        let mut value = BytesMut::with_capacity(features.len() * 2);
        for feature in features {
            value.put_u16(*feature as u16);
        }
        let req = Request::new(Opcode::Hello)
            .with_key(Bytes::copy_from_slice(agent.as_bytes()))
            .with_value(value.freeze());
        let resp = self.execute(req).await?;
        if !resp.status.is_success() {
            return Err(KvError::Connection(format!(
                "HELLO rejected by {}: {}",
                self.addr, resp.status
            )));
        }

        self.features = resp
            .value
            .chunks_exact(2)
            .filter_map(|c| Feature::from_u16(u16::from_be_bytes([c[0], c[1]])))
            .collect();
        Ok(())
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mut token = BytesMut::with_capacity(username.len() + password.len() + 2);
        token.put_u8(0);
        token.put_slice(username.as_bytes());
        token.put_u8(0);
        token.put_slice(password.as_bytes());

        let req = Request::new(Opcode::SaslAuth)
            .with_key(&b"PLAIN"[..])
            .with_value(token.freeze());
        let resp = self.execute(req).await?;
        match resp.status {
            Status::SUCCESS => Ok(()),
            Status::AUTH_ERROR => Err(KvError::Auth(format!(
                "{} rejected credentials for user {:?}",
                self.addr, username
            ))),
            status => Err(KvError::Auth(format!(
                "SASL PLAIN on {} failed: {}",
                self.addr, status
            ))),
        }
    }

    async fn select_bucket(&mut self, bucket: &str) -> Result<()> {
        let req = Request::new(Opcode::SelectBucket)
            .with_key(Bytes::copy_from_slice(bucket.as_bytes()));
        let resp = self.execute(req).await?;
        if !resp.status.is_success() {
            return Err(KvError::Auth(format!(
                "cannot select bucket {:?} on {}: {}",
                bucket, self.addr, resp.status
            )));
        }
        Ok(())
    }

    async fn subdoc_get(
        &mut self,
        vbucket: VBucketId,
        key: &[u8],
        path: &str,
    ) -> Result<Option<Bytes>> {
        let path_len = u16::try_from(path.len())
            .map_err(|_| KvError::InvalidArgument(format!("subdoc path {:?}", path)))?;
        let mut extras = BytesMut::with_capacity(3);
        extras.put_u16(path_len);
        extras.put_u8(SUBDOC_FLAG_XATTR_PATH);

        let req = Request::new(Opcode::SubdocGet)
            .with_vbucket(vbucket)
            .with_key(Bytes::copy_from_slice(key))
            .with_extras(extras.freeze())
            .with_value(Bytes::copy_from_slice(path.as_bytes()));
        let resp = self.execute(req).await?;
        match resp.status {
            Status::SUCCESS => Ok(Some(resp.value)),
            Status::SUBDOC_PATH_NOT_FOUND => Ok(None),
            status => Err(KvError::Server {
                opcode: Opcode::SubdocGet,
                status,
            }),
        }
    }

    /// Send one request and wait for its response
    ///
    /// Any I/O failure, timeout or framing error leaves the stream in an
    /// unknown state, so the connection refuses further requests.
    async fn execute(&mut self, mut req: Request) -> Result<Response> {
        if self.broken {
            return Err(KvError::Connection(format!(
                "connection to {} is unusable after an earlier failure",
                self.addr
            )));
        }

        self.next_opaque = self.next_opaque.wrapping_add(1);
        req.opaque = self.next_opaque;

        let timeout = self.request_timeout;
        let result = match tokio::time::timeout(timeout, self.round_trip(&req)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Connection(format!(
                "{} to {} timed out after {:?}",
                req.opcode, self.addr, timeout
            ))),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };
        if resp.opaque != req.opaque {
            self.broken = true;
            return Err(KvError::Protocol(format!(
                "{} answered opaque {} to request {}",
                self.addr, resp.opaque, req.opaque
            )));
        }
        Ok(resp)
    }

    async fn round_trip(&mut self, req: &Request) -> Result<Response> {
        self.write_buf.clear();
        encode_request(req, &mut self.write_buf)?;

        match &mut self.stream {
            Stream::Tcp(tcp) => {
                tcp.write_all(&self.write_buf).await?;
                tcp.flush().await?;
            }
            Stream::Tls(tls) => {
                tls.write_all(&self.write_buf).await?;
                tls.flush().await?;
            }
        }
        self.write_buf.clear();

        loop {
            if let Some(resp) = parse_response(&mut self.read_buf)? {
                return Ok(resp);
            }

            let n = match &mut self.stream {
                Stream::Tcp(tcp) => tcp.read_buf(&mut self.read_buf).await?,
                Stream::Tls(tls) => tls.read_buf(&mut self.read_buf).await?,
            };

            if n == 0 {
                return Err(KvError::Connection(format!(
                    "{} closed the connection",
                    self.addr
                )));
            }
        }
    }
}

#[async_trait]
impl KvNode for NodeConnection {
    async fn cluster_config(&mut self) -> Result<ClusterMap> {
        let resp = self.execute(Request::new(Opcode::GetClusterConfig)).await?;
        if !resp.status.is_success() {
            return Err(KvError::Server {
                opcode: Opcode::GetClusterConfig,
                status: resp.status,
            });
        }
        ClusterMap::from_json(&resp.value)
    }

    async fn get(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<GetOutcome> {
        let req = Request::new(Opcode::Get)
            .with_vbucket(vbucket)
            .with_key(Bytes::copy_from_slice(key));
        let resp = self.execute(req).await?;
        match resp.status {
            Status::SUCCESS => {
                let flags = match resp.extras.get(..4) {
                    Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                    None => 0,
                };
                Ok(GetOutcome::Found {
                    value: resp.value,
                    cas: resp.cas,
                    flags,
                    datatype: resp.datatype,
                })
            }
            Status::KEY_NOT_FOUND => Ok(GetOutcome::NotFound),
            status => Err(KvError::Server {
                opcode: Opcode::Get,
                status,
            }),
        }
    }

    async fn add(
        &mut self,
        vbucket: VBucketId,
        key: &[u8],
        value: &[u8],
        flags: u32,
        datatype: u8,
    ) -> Result<AddOutcome> {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(flags);
        extras.put_u32(0);

        let req = Request::new(Opcode::Add)
            .with_vbucket(vbucket)
            .with_key(Bytes::copy_from_slice(key))
            .with_extras(extras.freeze())
            .with_value(Bytes::copy_from_slice(value))
            .with_datatype(datatype & DATATYPE_JSON);
        let resp = self.execute(req).await?;
        match resp.status {
            Status::SUCCESS => Ok(AddOutcome::Created { cas: resp.cas }),
            Status::KEY_EXISTS => Ok(AddOutcome::AlreadyExists),
            status => Err(KvError::Server {
                opcode: Opcode::Add,
                status,
            }),
        }
    }

    async fn delete(&mut self, vbucket: VBucketId, key: &[u8], cas: u64) -> Result<DeleteOutcome> {
        let req = Request::new(Opcode::Delete)
            .with_vbucket(vbucket)
            .with_key(Bytes::copy_from_slice(key))
            .with_cas(cas);
        let resp = self.execute(req).await?;
        match resp.status {
            Status::SUCCESS => Ok(DeleteOutcome::Deleted),
            Status::KEY_NOT_FOUND => Ok(DeleteOutcome::NotFound),
            Status::KEY_EXISTS => Ok(DeleteOutcome::CasMismatch),
            status => Err(KvError::Server {
                opcode: Opcode::Delete,
                status,
            }),
        }
    }

    async fn xattrs(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<Xattrs> {
        let mut xattrs = Xattrs::new();
        let Some(toc) = self.subdoc_get(vbucket, key, XATTR_TOC_PATH).await? else {
            return Ok(xattrs);
        };
        let names: Vec<String> = serde_json::from_slice(&toc)
            .map_err(|e| KvError::Protocol(format!("malformed {}: {}", XATTR_TOC_PATH, e)))?;

        for name in names {
            if let Some(raw) = self.subdoc_get(vbucket, key, &name).await? {
                let value = serde_json::from_slice(&raw).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&raw).into_owned())
                });
                xattrs.insert(name, value);
            }
        }
        Ok(xattrs)
    }

    async fn close(&mut self) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        self.broken = true;
        debug!(addr = %self.addr, "closing data node connection");
        match &mut self.stream {
            Stream::Tcp(tcp) => tcp.shutdown().await?,
            Stream::Tls(tls) => tls.shutdown().await?,
        }
        Ok(())
    }
}

/// Opens [`NodeConnection`]s with one shared configuration
#[derive(Clone)]
pub struct KvConnector {
    config: Arc<ConnectionConfig>,
    tls: Option<TlsConnector>,
}

impl KvConnector {
    /// Prepare a connector, building the TLS context once if enabled
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(settings) => Some(crate::tls::build_connector(settings)?),
            None => None,
        };
        Ok(Self {
            config: Arc::new(config),
            tls,
        })
    }

    /// Returns the settings shared by every connection this connector opens.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl NodeConnector for KvConnector {
    type Node = NodeConnection;

    async fn connect(&self, host: &str, port: u16) -> Result<NodeConnection> {
        NodeConnection::connect(&self.config, self.tls.as_ref(), host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_features() {
        let mut config = ConnectionConfig::default();
        assert!(config.requested_features().contains(&Feature::Collections));
        config.collections = false;
        assert_eq!(
            config.requested_features(),
            vec![Feature::SelectBucket, Feature::Json, Feature::Xattr]
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = NodeConnection::connect(&ConnectionConfig::default(), None, "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Connection(_)));
    }
}
