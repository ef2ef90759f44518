use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use deadpool::managed;
use smol::Timer;
use smol::io::{AsyncRead, AsyncWrite, BufReader};
use smol::net::{TcpStream, unix::UnixStream};

use crate::config::{ClientConfig, ServerAddr};
use crate::error::{Error, Result};
use crate::protocol::{Command, Reply, execute_cmd, execute_pipeline};

/// Opens byte streams to servers. The client picks one implementation when
/// it is constructed; [`SocketTransport`] covers TCP and Unix domain sockets.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, addr: &ServerAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            Socket::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_close(cx),
            Socket::Unix(s) => Pin::new(s).poll_close(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTransport;

impl Transport for SocketTransport {
    type Stream = Socket;

    async fn connect(&self, addr: &ServerAddr) -> io::Result<Socket> {
        match addr {
            ServerAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Socket::Tcp(stream))
            }
            ServerAddr::Unix(path) => Ok(Socket::Unix(UnixStream::connect(path).await?)),
        }
    }
}

/// Runs `fut`, failing with a `TimedOut` network error once `limit` elapses.
/// The future is dropped at that point.
pub async fn deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    smol::future::or(fut, async {
        Timer::after(limit).await;
        Err(Error::Network(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response within {limit:?}"),
        )))
    })
    .await
}

/// One open stream to one server. Carries a single request/response
/// exchange at a time.
pub struct Connection<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn execute(&mut self, cmd: &Command<'_>) -> Result<Reply> {
        execute_cmd(&mut self.stream, cmd).await
    }

    pub async fn pipeline(&mut self, cmds: &[Command<'_>]) -> Result<Vec<Result<Reply>>> {
        execute_pipeline(&mut self.stream, cmds).await
    }
}

/// Idle time after which a pooled connection is probed with `version`
/// before being handed out again.
const PROBE_AFTER_IDLE: Duration = Duration::from_secs(10);

pub struct Manager<T: Transport> {
    addr: ServerAddr,
    transport: Arc<T>,
    connect_timeout: Duration,
    socket_timeout: Duration,
}

impl<T: Transport> Manager<T> {
    pub fn new(
        addr: ServerAddr,
        transport: Arc<T>,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            transport,
            connect_timeout,
            socket_timeout,
        }
    }
}

impl<T: Transport> managed::Manager for Manager<T> {
    type Type = Connection<T::Stream>;
    type Error = Error;

    async fn create(&self) -> Result<Connection<T::Stream>> {
        let stream = deadline(self.connect_timeout, async {
            Ok(self.transport.connect(&self.addr).await?)
        })
        .await?;
        tracing::debug!(server = %self.addr, "opened connection");
        Ok(Connection::new(stream))
    }

    async fn recycle(
        &self,
        conn: &mut Connection<T::Stream>,
        metrics: &managed::Metrics,
    ) -> managed::RecycleResult<Error> {
        if metrics.last_used() < PROBE_AFTER_IDLE {
            return Ok(());
        }
        match deadline(self.socket_timeout, conn.execute(&Command::Version)).await {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub type Pool<T> = managed::Pool<Manager<T>>;

type Pooled<T> = managed::Object<Manager<T>>;

/// Per-server connection pools. Every operation checks a connection out
/// for its own exclusive use and gives it back when done; a connection that
/// saw any error is closed instead of being returned.
pub struct ConnectionManager<T: Transport> {
    pools: Vec<Pool<T>>,
    socket_timeout: Duration,
    checkout_timeout: Duration,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(addrs: &[ServerAddr], transport: Arc<T>, config: &ClientConfig) -> Result<Self> {
        let socket_timeout = config.socket_timeout_duration();
        let connect_timeout = config.connect_timeout_duration();
        let pools = addrs
            .iter()
            .map(|addr| {
                let mgr = Manager::new(
                    addr.clone(),
                    transport.clone(),
                    connect_timeout,
                    socket_timeout,
                );
                managed::Pool::builder(mgr)
                    .max_size(config.max_connections_per_server)
                    .build()
                    .map_err(|e| Error::Config(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pools,
            socket_timeout,
            checkout_timeout: connect_timeout + socket_timeout,
        })
    }

    async fn checkout(&self, idx: usize) -> Result<Pooled<T>> {
        let get = async {
            self.pools[idx].get().await.map_err(|e| match e {
                managed::PoolError::Backend(e) => e,
                other => Error::Pool(other.to_string()),
            })
        };
        let waited = async {
            Timer::after(self.checkout_timeout).await;
            Err(Error::PoolTimeout)
        };
        smol::future::or(get, waited).await
    }

    pub async fn execute(&self, idx: usize, cmd: &Command<'_>) -> Result<Reply> {
        let mut conn = self.checkout(idx).await?;
        let result = deadline(self.socket_timeout, conn.execute(cmd)).await;
        if result.is_err() {
            discard(conn);
        }
        result
    }

    pub async fn pipeline(&self, idx: usize, cmds: &[Command<'_>]) -> Result<Vec<Result<Reply>>> {
        let mut conn = self.checkout(idx).await?;
        let result = deadline(self.socket_timeout, conn.pipeline(cmds)).await;
        let clean = match &result {
            Ok(replies) => replies.iter().all(Result::is_ok),
            Err(_) => false,
        };
        if !clean {
            discard(conn);
        }
        result
    }

    /// Drops every idle connection to server `idx`.
    pub fn close_all(&self, idx: usize) {
        self.pools[idx].retain(|_, _| false);
    }

    #[cfg(test)]
    pub fn idle_connections(&self, idx: usize) -> usize {
        self.pools[idx].status().available
    }
}

fn discard<T: Transport>(conn: Pooled<T>) {
    drop(managed::Object::take(conn));
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::block_on;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn config() -> ClientConfig {
        ClientConfig::new(["127.0.0.1:1"])
            .socket_timeout(Duration::from_millis(200))
            .connect_timeout(Duration::from_millis(200))
    }

    // Answers every `version` line until the client hangs up.
    fn version_server() -> ServerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                thread::spawn(move || {
                    let mut reader = StdBufReader::new(stream.try_clone().unwrap());
                    let mut line = String::new();
                    while reader.read_line(&mut line).unwrap_or(0) > 0 {
                        if line.starts_with("version") {
                            stream.write_all(b"VERSION 1.6.21\r\n").unwrap();
                        }
                        line.clear();
                    }
                });
            }
        });
        ServerAddr::Tcp(addr.to_string())
    }

    // Accepts connections and never answers.
    fn silent_server() -> ServerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });
        ServerAddr::Tcp(addr.to_string())
    }

    fn closed_port() -> ServerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        ServerAddr::Tcp(addr.to_string())
    }

    #[test]
    fn test_deadline() {
        block_on(async {
            let r: Result<()> = deadline(Duration::from_millis(10), smol::future::pending()).await;
            match r {
                Err(Error::Network(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
                other => panic!("unexpected {other:?}"),
            }

            let r = deadline(Duration::from_secs(5), async { Ok(7) }).await;
            assert_eq!(r.unwrap(), 7);
        })
    }

    #[test]
    fn test_execute_reuses_connection() {
        block_on(async {
            let addr = version_server();
            let mgr =
                ConnectionManager::new(&[addr], Arc::new(SocketTransport), &config()).unwrap();

            for _ in 0..3 {
                assert_eq!(
                    mgr.execute(0, &Command::Version).await.unwrap(),
                    Reply::Version("1.6.21".to_string())
                );
            }
            assert_eq!(mgr.idle_connections(0), 1);

            mgr.close_all(0);
            assert_eq!(mgr.idle_connections(0), 0);
        })
    }

    #[test]
    fn test_connect_refused() {
        block_on(async {
            let mgr = ConnectionManager::new(&[closed_port()], Arc::new(SocketTransport), &config())
                .unwrap();
            let err = mgr.execute(0, &Command::Version).await.unwrap_err();
            assert!(err.is_network(), "{err:?}");
        })
    }

    #[test]
    fn test_read_timeout_discards_connection() {
        block_on(async {
            let mgr = ConnectionManager::new(&[silent_server()], Arc::new(SocketTransport), &config())
                .unwrap();
            let err = mgr.execute(0, &Command::Version).await.unwrap_err();
            match err {
                Error::Network(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(mgr.idle_connections(0), 0);
        })
    }
}
