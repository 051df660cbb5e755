//! SOCKS5 front door
//!
//! RFC 1928 server with optional RFC 1929 username/password. Credentials
//! are isolation identifiers, not secrets: any non-empty pair is accepted.
//! CONNECT only; BIND and UDP ASSOCIATE are refused. DNS is never resolved
//! locally: DOMAIN targets travel to the exit in RELAY BEGIN, and `.onion`
//! targets are routed through the rendezvous client.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::events::{Event, EventSink, SharedEventSink};
use crate::isolation::{IsolationKey, IsolationLevel, RequestAttributes};
use crate::onion::{is_onion_hostname, OnionAddress, OnionClient};
use crate::path::LastHop;
use crate::pool::CircuitPool;
use crate::protocol::{TorStream, END_REASON_DONE};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// The SOCKS5 server.
pub struct SocksServer {
    pool: Arc<CircuitPool>,
    onion: Arc<OnionClient>,
    isolation_level: IsolationLevel,
    isolate_destinations: bool,
    isolate_socks_auth: bool,
    isolate_client_port: bool,
    stream_timeout: std::time::Duration,
    limit: Arc<Semaphore>,
    events: SharedEventSink,
}

impl SocksServer {
    pub fn new(
        pool: Arc<CircuitPool>,
        onion: Arc<OnionClient>,
        config: &TorConfig,
        events: SharedEventSink,
    ) -> Self {
        Self {
            pool,
            onion,
            isolation_level: config.isolation_level,
            isolate_destinations: config.isolate_destinations,
            isolate_socks_auth: config.isolate_socks_auth,
            isolate_client_port: config.isolate_client_port,
            stream_timeout: config.stream_connect_timeout,
            limit: Arc::new(Semaphore::new(config.max_socks_connections)),
            events,
        }
    }

    fn wants_credentials(&self) -> bool {
        self.isolate_socks_auth
            || matches!(
                self.isolation_level,
                IsolationLevel::Credential | IsolationLevel::Session
            )
    }

    /// Accept loop; runs until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        log::info!(
            "SOCKS5 listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(permit) = self.limit.clone().try_acquire_owned() else {
                        log::warn!("SOCKS connection limit reached; refusing {}", peer);
                        drop(stream);
                        continue;
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            log::debug!("SOCKS connection from {}: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("SOCKS5 listener draining");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut tcp: TcpStream, peer: SocketAddr) -> Result<()> {
        let username = self.negotiate(&mut tcp).await?;
        let request = read_request(&mut tcp).await;

        let (host, port) = match request {
            Ok(target) => target,
            Err(RequestError::Unsupported(reply)) => {
                write_reply(&mut tcp, reply).await?;
                return Ok(());
            }
            Err(RequestError::Io(e)) => return Err(e),
        };

        let attributes = RequestAttributes {
            username,
            source_port: peer.port(),
            dest_host: host.clone(),
            dest_port: port,
        };
        let key = IsolationKey::compute(
            self.isolation_level,
            self.isolate_destinations,
            self.isolate_socks_auth,
            self.isolate_client_port,
            &attributes,
        );

        match self.open_target_stream(&host, port, &key).await {
            Ok(stream) => {
                self.events.publish(Event::StreamOpened {
                    circ_id: stream.circuit().circ_id,
                    stream_id: stream.stream_id(),
                    target: format!("{}:{}", host, port),
                });
                write_reply(&mut tcp, REPLY_SUCCESS).await?;
                let (circ_id, stream_id) = (stream.circuit().circ_id, stream.stream_id());
                pump(tcp, stream).await;
                self.events
                    .publish(Event::StreamClosed { circ_id, stream_id });
                Ok(())
            }
            Err(e) => {
                log::info!("SOCKS connect {}:{} failed: {}", host, port, e);
                write_reply(&mut tcp, e.socks5_reply()).await?;
                Ok(())
            }
        }
    }

    /// Method negotiation plus optional RFC 1929 exchange. Returns the
    /// username when one was presented.
    async fn negotiate(&self, tcp: &mut TcpStream) -> Result<Option<String>> {
        let mut head = [0u8; 2];
        tcp.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(TorError::Protocol(format!(
                "SOCKS version {} unsupported",
                head[0]
            )));
        }
        let mut methods = vec![0u8; head[1] as usize];
        tcp.read_exact(&mut methods).await?;

        let offer_userpass = methods.contains(&AUTH_USERPASS);
        let offer_none = methods.contains(&AUTH_NONE);

        let method = if self.wants_credentials() && offer_userpass {
            AUTH_USERPASS
        } else if offer_none {
            AUTH_NONE
        } else if offer_userpass {
            AUTH_USERPASS
        } else {
            tcp.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Err(TorError::Protocol("no acceptable auth method".into()));
        };
        tcp.write_all(&[SOCKS_VERSION, method]).await?;

        if method != AUTH_USERPASS {
            return Ok(None);
        }

        // RFC 1929 subnegotiation
        let mut ver = [0u8; 2];
        tcp.read_exact(&mut ver).await?;
        let mut username = vec![0u8; ver[1] as usize];
        tcp.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        tcp.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        tcp.read_exact(&mut password).await?;

        if username.is_empty() {
            tcp.write_all(&[0x01, 0x01]).await?;
            return Err(TorError::Protocol("empty SOCKS username".into()));
        }
        tcp.write_all(&[0x01, 0x00]).await?;
        Ok(Some(String::from_utf8_lossy(&username).into_owned()))
    }

    async fn open_target_stream(
        &self,
        host: &str,
        port: u16,
        key: &IsolationKey,
    ) -> Result<TorStream> {
        if is_onion_hostname(host) {
            let address = OnionAddress::parse(host)?;
            let circuit = self.onion.connect(&address, key).await?;
            return TorStream::open(&circuit, host, port, self.stream_timeout).await;
        }

        let circuit = self.pool.acquire(key, LastHop::Exit { port }).await?;
        let stream = TorStream::open(&circuit, host, port, self.stream_timeout).await;
        match stream {
            Ok(stream) => {
                // Circuit stays checked out while the stream lives; it goes
                // back to the pool when the stream winds down.
                self.pool.release(circuit).await;
                Ok(stream)
            }
            Err(e) => {
                self.pool.release(circuit).await;
                Err(e)
            }
        }
    }
}

enum RequestError {
    /// Refused with a specific SOCKS reply code
    Unsupported(u8),
    Io(TorError),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Io(e.into())
    }
}

/// Read the CONNECT request, returning (host, port).
async fn read_request(tcp: &mut TcpStream) -> std::result::Result<(String, u16), RequestError> {
    let mut head = [0u8; 4];
    tcp.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(RequestError::Io(TorError::Protocol(
            "bad request version".into(),
        )));
    }
    if head[1] != CMD_CONNECT {
        return Err(RequestError::Unsupported(REPLY_COMMAND_NOT_SUPPORTED));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            tcp.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            tcp.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            tcp.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            tcp.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        _ => return Err(RequestError::Unsupported(REPLY_ADDRESS_NOT_SUPPORTED)),
    };

    let mut port = [0u8; 2];
    tcp.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Write a reply with BND.ADDR = 0.0.0.0:0.
async fn write_reply(tcp: &mut TcpStream, reply: u8) -> Result<()> {
    tcp.write_all(&[
        SOCKS_VERSION,
        reply,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ])
    .await?;
    Ok(())
}

/// Bidirectional copy between the client TCP socket and the Tor stream.
async fn pump(mut tcp: TcpStream, mut tor: TorStream) {
    let (mut tcp_r, mut tcp_w) = tcp.split();
    let mut tcp_buf = [0u8; 4096];
    let mut tor_buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = tcp_r.read(&mut tcp_buf) => match read {
                Ok(0) | Err(_) => {
                    tor.close(END_REASON_DONE).await;
                    break;
                }
                Ok(n) => {
                    if tor.write_all(&tcp_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            read = tor.read(&mut tor_buf) => match read {
                Ok(0) => {
                    let _ = tcp_w.shutdown().await;
                    tor.close(END_REASON_DONE).await;
                    break;
                }
                Ok(n) => {
                    if tcp_w.write_all(&tor_buf[..n]).await.is_err() {
                        tor.close(END_REASON_DONE).await;
                        break;
                    }
                }
                Err(_) => {
                    let _ = tcp_w.shutdown().await;
                    break;
                }
            },
        }
    }
}
