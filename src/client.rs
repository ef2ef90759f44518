use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, SocketTransport, Transport};
use crate::error::{Error, Result, ServerErrorKind};
use crate::protocol::{Command, Item, Reply, StoreStatus, StoreVerb, check_key};
use crate::ring::ServerPool;
use crate::value::{JsonSerializer, Serializer, ValueCodec};

/// Outcome of [`Client::cas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Stored,
    /// The value changed since the token was read.
    Exists,
    /// The key expired or was evicted.
    NotFound,
    /// No server could be reached, or the server refused the write.
    Failed,
}

/// A value together with the CAS token it was read with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub cas_token: u64,
}

/// Per-server operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub get_hits: u64,
    pub get_misses: u64,
    pub sets: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ClientStats {
        ClientStats {
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn unexpected_reply(cmd: &str, reply: Reply) -> Error {
    Error::Protocol(format!("{cmd}: unexpected reply {reply:?}"))
}

/// Memcached client over a weighted set of servers.
///
/// Keys are spread over the servers with [`ServerPool`]. A server that fails
/// a request is marked dead and skipped until its retry interval passes;
/// single-key requests are retried once on the next server. Single-key reads
/// degrade to misses and writes to `false` when no server answers, even when
/// every server is dead. Multi-key and server-wide calls report that last
/// case as [`Error::NoServersAvailable`]. Invalid keys, oversized values and
/// protocol errors are always returned as errors.
///
/// The client is `Send + Sync`; share it behind an `Arc` to use it from
/// several tasks at once.
///
/// # Example
///
/// ```rust,no_run
/// use mcring::{Client, ClientConfig};
/// # use smol::block_on;
/// #
/// # block_on(async {
/// let config = ClientConfig::new(["127.0.0.1:11211", "127.0.0.1:11212:2"]);
/// let client = Client::new(&config)?;
///
/// assert!(client.set("user:1", &vec![1, 2, 3], 0).await?);
/// let value: Option<Vec<u32>> = client.get("user:1").await?;
/// assert_eq!(value, Some(vec![1, 2, 3]));
/// # Ok::<(), mcring::Error>(())
/// # }).unwrap()
/// ```
pub struct Client<T: Transport = SocketTransport, S: Serializer = JsonSerializer> {
    ring: ServerPool,
    connections: ConnectionManager<T>,
    values: ValueCodec<S>,
    counters: Vec<Counters>,
    noreply: bool,
    debug: bool,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_transport(config, SocketTransport, JsonSerializer)
    }
}

impl<T: Transport, S: Serializer> Client<T, S> {
    /// Builds a client that opens connections through `transport` and
    /// encodes values with `serializer`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mcring::{Client, ClientConfig, JsonSerializer, SocketTransport};
    /// # use smol::block_on;
    /// #
    /// # block_on(async {
    /// let config = ClientConfig::new(["127.0.0.1:11211"]);
    /// let client = Client::with_transport(&config, SocketTransport, JsonSerializer)?;
    /// assert!(client.set("k", &1u32, 0).await?);
    /// # Ok::<(), mcring::Error>(())
    /// # }).unwrap()
    /// ```
    pub fn with_transport(config: &ClientConfig, transport: T, serializer: S) -> Result<Self> {
        let servers = config.parse_servers()?;
        let addrs: Vec<_> = servers.iter().map(|(addr, _)| addr.clone()).collect();
        let connections = ConnectionManager::new(&addrs, Arc::new(transport), config)?;
        let ring = ServerPool::new(servers, config.dead_retry_duration());
        tracing::debug!(servers = addrs.len(), "memcached client created");
        Ok(Self {
            counters: addrs.iter().map(|_| Counters::default()).collect(),
            ring,
            connections,
            values: ValueCodec::new(
                serializer,
                config.compression_threshold,
                config.max_value_size,
            ),
            noreply: config.noreply,
            debug: config.debug,
        })
    }

    /// The ring this client routes keys with, including live/dead state.
    pub fn server_pool(&self) -> &ServerPool {
        &self.ring
    }

    async fn send(&self, idx: usize, cmd: &Command<'_>) -> Result<Reply> {
        if self.debug {
            tracing::debug!(
                server = %self.ring.server(idx).addr,
                command = cmd.name(),
                "sending command"
            );
        }
        self.connections.execute(idx, cmd).await
    }

    async fn send_pipeline(&self, idx: usize, cmds: &[Command<'_>]) -> Result<Vec<Result<Reply>>> {
        if self.debug {
            tracing::debug!(
                server = %self.ring.server(idx).addr,
                commands = cmds.len(),
                "sending pipeline"
            );
        }
        self.connections.pipeline(idx, cmds).await
    }

    fn fail_server(&self, idx: usize, err: &Error) {
        tracing::warn!(server = %self.ring.server(idx).addr, error = %err, "request failed");
        self.ring.mark_dead(idx);
        self.connections.close_all(idx);
    }

    /// Sends a single-key command to the key's server, retrying once on the
    /// next candidate if the first one fails at the network level.
    async fn dispatch(&self, key: &str, cmd: &Command<'_>) -> Result<(usize, Reply)> {
        let candidates = self.ring.resolve(key.as_bytes());
        if candidates.is_empty() {
            return Err(Error::NoServersAvailable);
        }
        let mut last = None;
        for &idx in candidates.iter().take(2) {
            match self.send(idx, cmd).await {
                Ok(reply) => return Ok((idx, reply)),
                Err(e) if e.is_network() => {
                    self.fail_server(idx, &e);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(Error::NoServersAvailable))
    }

    /// Groups keys by the server that currently owns each of them.
    fn route<'k>(&self, keys: impl Iterator<Item = &'k str>) -> Result<BTreeMap<usize, Vec<&'k str>>> {
        let mut groups: BTreeMap<usize, Vec<&'k str>> = BTreeMap::new();
        for key in keys {
            let idx = *self
                .ring
                .resolve(key.as_bytes())
                .first()
                .ok_or(Error::NoServersAvailable)?;
            groups.entry(idx).or_default().push(key);
        }
        Ok(groups)
    }

    async fn retrieve(&self, key: &str, cas: bool) -> Result<Option<Item>> {
        check_key(key)?;
        let cmd = Command::Get {
            keys: vec![key],
            cas,
        };
        match self.dispatch(key, &cmd).await {
            Ok((idx, Reply::Items(items))) => {
                let item = items.into_iter().find(|item| item.key == key);
                let counters = &self.counters[idx];
                bump(
                    if item.is_some() {
                        &counters.get_hits
                    } else {
                        &counters.get_misses
                    },
                    1,
                );
                Ok(item)
            }
            Ok((_, reply)) => Err(unexpected_reply(cmd.name(), reply)),
            Err(e) if e.is_unavailable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetches and deserializes `key`. `None` for a miss, including when the
    /// key's servers cannot be reached.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.retrieve(key, false).await? {
            Some(item) => Ok(Some(self.values.decode(&item.data_block, item.flags)?)),
            None => Ok(None),
        }
    }

    /// Like [`Client::get`] but returns the stored bytes, decompressed,
    /// without deserializing them.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.retrieve(key, false).await? {
            Some(item) => Ok(Some(self.values.decode_raw(item.data_block, item.flags)?)),
            None => Ok(None),
        }
    }

    /// Fetches `key` along with the CAS token needed by [`Client::cas`].
    pub async fn gets<V: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<V>>> {
        let Some(item) = self.retrieve(key, true).await? else {
            return Ok(None);
        };
        let cas_token = item
            .cas_unique
            .ok_or_else(|| Error::Protocol(format!("gets reply for {key:?} has no cas token")))?;
        Ok(Some(Versioned {
            value: self.values.decode(&item.data_block, item.flags)?,
            cas_token,
        }))
    }

    async fn store(
        &self,
        verb: StoreVerb,
        key: &str,
        data: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<Option<StoreStatus>> {
        let cmd = Command::Store {
            verb,
            key,
            flags,
            exptime,
            noreply: self.noreply && !matches!(verb, StoreVerb::Cas(_)),
            data,
        };
        match self.dispatch(key, &cmd).await {
            Ok((idx, Reply::Store(status))) => {
                if status == StoreStatus::Stored {
                    bump(&self.counters[idx].sets, 1);
                }
                Ok(Some(status))
            }
            Ok((_, reply)) => Err(unexpected_reply(cmd.name(), reply)),
            Err(e) if e.is_unavailable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn store_value<V: Serialize + ?Sized>(
        &self,
        verb: StoreVerb,
        key: &str,
        value: &V,
        exptime: u32,
    ) -> Result<Option<StoreStatus>> {
        check_key(key)?;
        let (data, flags) = self.values.encode(value)?;
        self.store(verb, key, &data, flags, exptime).await
    }

    async fn store_raw(
        &self,
        verb: StoreVerb,
        key: &str,
        bytes: &[u8],
        exptime: u32,
    ) -> Result<Option<StoreStatus>> {
        check_key(key)?;
        let (data, flags) = self.values.encode_raw(bytes)?;
        self.store(verb, key, &data, flags, exptime).await
    }

    /// Stores `value` under `key`. `exptime` is seconds from now, a unix
    /// timestamp, or 0 for no expiry.
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, exptime: u32) -> Result<bool> {
        let status = self.store_value(StoreVerb::Set, key, value, exptime).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Stores `bytes` as they are, skipping the serializer. Values above the
    /// compression threshold are still compressed; [`Client::get_raw`]
    /// undoes that.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use mcring::{Client, ClientConfig};
    /// # use smol::block_on;
    /// #
    /// # block_on(async {
    /// # let client = Client::new(&ClientConfig::new(["127.0.0.1:11211"]))?;
    /// assert!(client.set_raw("page", b"<html>", 60).await?);
    /// assert_eq!(client.get_raw("page").await?, Some(b"<html>".to_vec()));
    /// # Ok::<(), mcring::Error>(())
    /// # }).unwrap()
    /// ```
    pub async fn set_raw(&self, key: &str, bytes: &[u8], exptime: u32) -> Result<bool> {
        let status = self.store_raw(StoreVerb::Set, key, bytes, exptime).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Stores only if the key is absent.
    pub async fn add<V: Serialize + ?Sized>(&self, key: &str, value: &V, exptime: u32) -> Result<bool> {
        let status = self.store_value(StoreVerb::Add, key, value, exptime).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Stores only if the key is present.
    pub async fn replace<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        exptime: u32,
    ) -> Result<bool> {
        let status = self.store_value(StoreVerb::Replace, key, value, exptime).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Appends raw bytes to an existing raw value.
    pub async fn append(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        check_key(key)?;
        crate::protocol::check_value_len(bytes.len(), self.values.max_value_size())?;
        let status = self.store(StoreVerb::Append, key, bytes, 0, 0).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Prepends raw bytes to an existing raw value.
    pub async fn prepend(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        check_key(key)?;
        crate::protocol::check_value_len(bytes.len(), self.values.max_value_size())?;
        let status = self.store(StoreVerb::Prepend, key, bytes, 0, 0).await?;
        Ok(status == Some(StoreStatus::Stored))
    }

    /// Writes `value` only if the key still carries `cas_token`, as read by
    /// [`Client::gets`].
    pub async fn cas<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        exptime: u32,
        cas_token: u64,
    ) -> Result<CasResult> {
        let status = self
            .store_value(StoreVerb::Cas(cas_token), key, value, exptime)
            .await?;
        Ok(match status {
            Some(StoreStatus::Stored) => CasResult::Stored,
            Some(StoreStatus::Exists) => CasResult::Exists,
            Some(StoreStatus::NotFound) => CasResult::NotFound,
            Some(StoreStatus::NotStored) | None => CasResult::Failed,
        })
    }

    /// `true` if the key existed and was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let cmd = Command::Delete {
            key,
            noreply: self.noreply,
        };
        match self.dispatch(key, &cmd).await {
            Ok((idx, Reply::Deleted(deleted))) => {
                if deleted {
                    bump(&self.counters[idx].deletes, 1);
                }
                Ok(deleted)
            }
            Ok((_, reply)) => Err(unexpected_reply(cmd.name(), reply)),
            Err(e) if e.is_unavailable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn counter(&self, key: &str, cmd: Command<'_>) -> Result<Option<u64>> {
        check_key(key)?;
        match self.dispatch(key, &cmd).await {
            Ok((_, Reply::Counter(value))) => Ok(value),
            Ok((_, reply)) => Err(unexpected_reply(cmd.name(), reply)),
            Err(Error::Server {
                kind: ServerErrorKind::ClientError,
                message,
            }) => {
                tracing::debug!(key, %message, "counter rejected by server");
                Ok(None)
            }
            Err(e) if e.is_unavailable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Adds `delta` to a decimal value. `None` if the key is missing, does
    /// not hold a number, or cannot be reached.
    pub async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter(key, Command::Incr { key, delta }).await
    }

    /// Subtracts `delta` from a decimal value; the server clamps at zero.
    pub async fn decr(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter(key, Command::Decr { key, delta }).await
    }

    /// Updates the expiry of an existing key.
    pub async fn touch(&self, key: &str, exptime: u32) -> Result<bool> {
        check_key(key)?;
        let cmd = Command::Touch {
            key,
            exptime,
            noreply: self.noreply,
        };
        match self.dispatch(key, &cmd).await {
            Ok((_, Reply::Touched(touched))) => Ok(touched),
            Ok((_, reply)) => Err(unexpected_reply(cmd.name(), reply)),
            Err(e) if e.is_unavailable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetches many keys with one `get` per server, sent concurrently. Keys
    /// that miss, whose server fails, or whose value cannot be decoded are
    /// absent from the result.
    pub async fn get_multi<V, K>(&self, keys: &[K]) -> Result<HashMap<String, V>>
    where
        V: DeserializeOwned,
        K: AsRef<str>,
    {
        for key in keys {
            check_key(key.as_ref())?;
        }
        let mut unique: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let groups = self.route(unique.into_iter())?;

        let replies = join_all(groups.into_iter().map(|(idx, keys)| async move {
            let requested = keys.len() as u64;
            let cmd = Command::Get { keys, cas: false };
            (idx, requested, self.send(idx, &cmd).await)
        }))
        .await;

        let mut result = HashMap::new();
        for (idx, requested, reply) in replies {
            match reply {
                Ok(Reply::Items(items)) => {
                    let hits = items.len() as u64;
                    bump(&self.counters[idx].get_hits, hits);
                    bump(&self.counters[idx].get_misses, requested.saturating_sub(hits));
                    for item in items {
                        match self.values.decode(&item.data_block, item.flags) {
                            Ok(value) => {
                                result.insert(item.key, value);
                            }
                            Err(e) => {
                                tracing::warn!(key = %item.key, error = %e, "dropping undecodable value")
                            }
                        }
                    }
                }
                Ok(reply) => return Err(unexpected_reply("get", reply)),
                Err(e) if e.is_network() => self.fail_server(idx, &e),
                Err(Error::PoolTimeout) => {
                    tracing::warn!(server = %self.ring.server(idx).addr, "no connection available")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Writes every pair, pipelined per server. Returns the keys that were
    /// not stored. Pipelined commands always wait for replies, even when
    /// the client is configured with `noreply`.
    pub async fn set_multi<V, K>(&self, pairs: &[(K, V)], exptime: u32) -> Result<Vec<String>>
    where
        V: Serialize,
        K: AsRef<str>,
    {
        let mut encoded = HashMap::with_capacity(pairs.len());
        for (key, value) in pairs {
            let key = key.as_ref();
            check_key(key)?;
            encoded.insert(key, self.values.encode(value)?);
        }
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        let groups = self.route(encoded.keys().copied())?;
        // An error line to a noreply command would be read as the next key's reply.
        let noreply = false;

        let outcomes = join_all(groups.into_iter().map(|(idx, keys)| {
            let encoded = &encoded;
            async move {
                let cmds: Vec<Command<'_>> = keys
                    .iter()
                    .map(|&key| {
                        let (data, flags) = &encoded[key];
                        Command::Store {
                            verb: StoreVerb::Set,
                            key,
                            flags: *flags,
                            exptime,
                            noreply,
                            data: data.as_slice(),
                        }
                    })
                    .collect();
                let replies = self.send_pipeline(idx, &cmds).await;
                (idx, keys, replies)
            }
        }))
        .await;

        let mut failed = Vec::new();
        for (idx, keys, replies) in outcomes {
            match replies {
                Ok(replies) => {
                    for (key, reply) in keys.into_iter().zip(replies) {
                        match reply {
                            Ok(Reply::Store(StoreStatus::Stored)) => {
                                bump(&self.counters[idx].sets, 1)
                            }
                            _ => failed.push(key.to_string()),
                        }
                    }
                }
                Err(e) if e.is_unavailable() => {
                    if e.is_network() {
                        self.fail_server(idx, &e);
                    }
                    failed.extend(keys.into_iter().map(str::to_string));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    /// Deletes many keys, pipelined per server. Returns the keys whose
    /// server could not be reached or refused the command; keys that were
    /// already absent count as deleted.
    pub async fn delete_multi<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<String>> {
        for key in keys {
            check_key(key.as_ref())?;
        }
        let mut unique: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let groups = self.route(unique.into_iter())?;
        let noreply = false;

        let outcomes = join_all(groups.into_iter().map(|(idx, keys)| async move {
            let cmds: Vec<Command<'_>> = keys
                .iter()
                .map(|&key| Command::Delete { key, noreply })
                .collect();
            let replies = self.send_pipeline(idx, &cmds).await;
            (idx, keys, replies)
        }))
        .await;

        let mut failed = Vec::new();
        for (idx, keys, replies) in outcomes {
            match replies {
                Ok(replies) => {
                    for (key, reply) in keys.into_iter().zip(replies) {
                        match reply {
                            Ok(Reply::Deleted(true)) => bump(&self.counters[idx].deletes, 1),
                            Ok(Reply::Deleted(false)) => {}
                            _ => failed.push(key.to_string()),
                        }
                    }
                }
                Err(e) if e.is_unavailable() => {
                    if e.is_network() {
                        self.fail_server(idx, &e);
                    }
                    failed.extend(keys.into_iter().map(str::to_string));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    /// Sends `cmd` to every alive server concurrently. Servers that fail at
    /// the network level are marked dead and left out.
    async fn broadcast(&self, cmd: &Command<'_>) -> Result<Vec<(usize, Reply)>> {
        let alive = self.ring.alive_servers();
        if alive.is_empty() {
            return Err(Error::NoServersAvailable);
        }
        let replies = join_all(
            alive
                .into_iter()
                .map(|idx| async move { (idx, self.send(idx, cmd).await) }),
        )
        .await;

        let mut result = Vec::new();
        for (idx, reply) in replies {
            match reply {
                Ok(reply) => result.push((idx, reply)),
                Err(e) if e.is_network() => self.fail_server(idx, &e),
                Err(Error::PoolTimeout) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// `stats` from every reachable server, keyed by server address.
    pub async fn stats(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        let mut result = HashMap::new();
        for (idx, reply) in self.broadcast(&Command::Stats).await? {
            match reply {
                Reply::Stats(stats) => {
                    result.insert(self.ring.server(idx).addr.to_string(), stats);
                }
                reply => return Err(unexpected_reply("stats", reply)),
            }
        }
        Ok(result)
    }

    /// Invalidates every item on every alive server, optionally after
    /// `delay` seconds. `true` if all alive servers acknowledged.
    pub async fn flush_all(&self, delay: Option<u32>) -> Result<bool> {
        let expected = self.ring.alive_servers().len();
        let cmd = Command::FlushAll {
            delay,
            noreply: self.noreply,
        };
        let replies = self.broadcast(&cmd).await?;
        for (_, reply) in &replies {
            if *reply != Reply::Ok {
                return Err(unexpected_reply("flush_all", reply.clone()));
            }
        }
        Ok(replies.len() == expected)
    }

    /// Server version strings keyed by server address.
    pub async fn version(&self) -> Result<HashMap<String, String>> {
        let mut result = HashMap::new();
        for (idx, reply) in self.broadcast(&Command::Version).await? {
            match reply {
                Reply::Version(version) => {
                    result.insert(self.ring.server(idx).addr.to_string(), version);
                }
                reply => return Err(unexpected_reply("version", reply)),
            }
        }
        Ok(result)
    }

    /// Closes every idle pooled connection. Later requests reconnect.
    pub fn disconnect_all(&self) {
        for idx in 0..self.ring.servers().len() {
            self.connections.close_all(idx);
        }
    }

    /// Counters for every configured server, keyed by server address.
    pub fn client_stats(&self) -> HashMap<String, ClientStats> {
        self.ring
            .servers()
            .iter()
            .zip(&self.counters)
            .map(|(server, counters)| (server.addr.to_string(), counters.snapshot()))
            .collect()
    }
}
