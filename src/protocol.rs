//! Memcached text protocol: request framing, response parsing and the
//! client-side checks that run before anything is written.
//!
//! Requests are always emitted with CRLF terminators. Responses are accepted
//! with either CRLF or bare LF.

use std::collections::HashMap;

use smol::io::{AsyncBufRead, AsyncWrite};
use smol::prelude::*;

use crate::error::{Error, Result, ServerErrorKind};

pub const MAX_KEY_LENGTH: usize = 250;

/// Largest data block accepted in a `VALUE` reply, memcached's own ceiling
/// on item size. Longer claims are treated as a corrupt stream.
pub const MAX_DATA_BLOCK: usize = 1024 * 1024 * 1024;

// Initial buffer for a data block; it grows only as bytes actually arrive.
const DATA_BLOCK_CHUNK: usize = 64 * 1024;

/// Rejects keys the server would refuse or misparse: empty, longer than
/// [`MAX_KEY_LENGTH`] bytes, or containing whitespace / control bytes.
pub fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::invalid_key(key, "longer than 250 bytes"));
    }
    if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(Error::invalid_key(
            key,
            "contains whitespace or control characters",
        ));
    }
    Ok(())
}

pub fn check_value_len(len: usize, limit: usize) -> Result<()> {
    if len > limit {
        return Err(Error::ValueTooLarge { size: len, limit });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub cas_unique: Option<u64>,
    pub data_block: Vec<u8>,
}

/// Outcome of a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas(u64),
}

impl StoreVerb {
    fn name(&self) -> &'static [u8] {
        match self {
            StoreVerb::Set => b"set",
            StoreVerb::Add => b"add",
            StoreVerb::Replace => b"replace",
            StoreVerb::Append => b"append",
            StoreVerb::Prepend => b"prepend",
            StoreVerb::Cas(_) => b"cas",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get {
        keys: Vec<&'a str>,
        cas: bool,
    },
    Store {
        verb: StoreVerb,
        key: &'a str,
        flags: u32,
        exptime: u32,
        noreply: bool,
        data: &'a [u8],
    },
    Delete {
        key: &'a str,
        noreply: bool,
    },
    Incr {
        key: &'a str,
        delta: u64,
    },
    Decr {
        key: &'a str,
        delta: u64,
    },
    Touch {
        key: &'a str,
        exptime: u32,
        noreply: bool,
    },
    Stats,
    FlushAll {
        delay: Option<u32>,
        noreply: bool,
    },
    Version,
}

impl Command<'_> {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Get { keys, cas: true } => build_retrieval_cmd(b"gets", keys),
            Command::Get { keys, cas: false } => build_retrieval_cmd(b"get", keys),
            Command::Store {
                verb,
                key,
                flags,
                exptime,
                noreply,
                data,
            } => build_storage_cmd(*verb, key.as_bytes(), *flags, *exptime, *noreply, data),
            Command::Delete { key, noreply } => build_delete_cmd(key.as_bytes(), *noreply),
            Command::Incr { key, delta } => build_incr_decr_cmd(b"incr", key.as_bytes(), *delta),
            Command::Decr { key, delta } => build_incr_decr_cmd(b"decr", key.as_bytes(), *delta),
            Command::Touch {
                key,
                exptime,
                noreply,
            } => build_touch_cmd(key.as_bytes(), *exptime, *noreply),
            Command::Stats => b"stats\r\n".to_vec(),
            Command::FlushAll { delay, noreply } => build_flush_all_cmd(*delay, *noreply),
            Command::Version => b"version\r\n".to_vec(),
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { cas: false, .. } => "get",
            Command::Get { cas: true, .. } => "gets",
            Command::Store { verb, .. } => match verb {
                StoreVerb::Set => "set",
                StoreVerb::Add => "add",
                StoreVerb::Replace => "replace",
                StoreVerb::Append => "append",
                StoreVerb::Prepend => "prepend",
                StoreVerb::Cas(_) => "cas",
            },
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::Touch { .. } => "touch",
            Command::Stats => "stats",
            Command::FlushAll { .. } => "flush_all",
            Command::Version => "version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Store(StoreStatus),
    Items(Vec<Item>),
    Deleted(bool),
    Counter(Option<u64>),
    Touched(bool),
    Stats(HashMap<String, String>),
    Ok,
    Version(String),
}

fn noreply_suffix(noreply: bool) -> &'static [u8] {
    if noreply { b" noreply" } else { b"" }
}

fn build_storage_cmd(
    verb: StoreVerb,
    key: &[u8],
    flags: u32,
    exptime: u32,
    noreply: bool,
    data_block: &[u8],
) -> Vec<u8> {
    let cas = match verb {
        StoreVerb::Cas(token) => format!(" {token}"),
        _ => String::new(),
    };
    [
        verb.name(),
        b" ",
        key,
        b" ",
        flags.to_string().as_bytes(),
        b" ",
        exptime.to_string().as_bytes(),
        b" ",
        data_block.len().to_string().as_bytes(),
        cas.as_bytes(),
        noreply_suffix(noreply),
        b"\r\n",
        data_block,
        b"\r\n",
    ]
    .concat()
}

fn build_retrieval_cmd(command_name: &[u8], keys: &[&str]) -> Vec<u8> {
    let mut cmd = command_name.to_vec();
    for key in keys {
        cmd.push(b' ');
        cmd.extend_from_slice(key.as_bytes());
    }
    cmd.extend_from_slice(b"\r\n");
    cmd
}

fn build_delete_cmd(key: &[u8], noreply: bool) -> Vec<u8> {
    [b"delete ", key, noreply_suffix(noreply), b"\r\n"].concat()
}

fn build_incr_decr_cmd(command_name: &[u8], key: &[u8], delta: u64) -> Vec<u8> {
    [
        command_name,
        b" ",
        key,
        b" ",
        delta.to_string().as_bytes(),
        b"\r\n",
    ]
    .concat()
}

fn build_touch_cmd(key: &[u8], exptime: u32, noreply: bool) -> Vec<u8> {
    [
        b"touch ",
        key,
        b" ",
        exptime.to_string().as_bytes(),
        noreply_suffix(noreply),
        b"\r\n",
    ]
    .concat()
}

fn build_flush_all_cmd(delay: Option<u32>, noreply: bool) -> Vec<u8> {
    let d = match delay {
        Some(x) => format!(" {x}"),
        None => String::new(),
    };
    [b"flush_all", d.as_bytes(), noreply_suffix(noreply), b"\r\n"].concat()
}

/// Reads one response line with its terminator stripped.
async fn read_line<S: AsyncBufRead + Unpin>(s: &mut S) -> Result<String> {
    let mut buf = Vec::new();
    if s.read_until(b'\n', &mut buf).await? == 0 {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if buf.pop() != Some(b'\n') {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        )));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| Error::Protocol(String::from_utf8_lossy(e.as_bytes()).into()))
}

/// Maps a line that matched none of the expected replies to an error,
/// recognising the server's own error lines.
fn unexpected(line: String) -> Error {
    let (kind, message) = if line == "ERROR" {
        (ServerErrorKind::Error, "")
    } else if let Some(msg) = line.strip_prefix("CLIENT_ERROR") {
        (ServerErrorKind::ClientError, msg.trim_start())
    } else if let Some(msg) = line.strip_prefix("SERVER_ERROR") {
        (ServerErrorKind::ServerError, msg.trim_start())
    } else {
        tracing::error!(line = %line, "unexpected response from server");
        return Error::Protocol(line);
    };
    Error::Server {
        kind,
        message: message.to_string(),
    }
}

async fn parse_storage_rp<S: AsyncBufRead + Unpin>(s: &mut S, noreply: bool) -> Result<StoreStatus> {
    if noreply {
        return Ok(StoreStatus::Stored);
    };
    let line = read_line(s).await?;
    match line.as_str() {
        "STORED" => Ok(StoreStatus::Stored),
        "NOT_STORED" => Ok(StoreStatus::NotStored),
        "EXISTS" => Ok(StoreStatus::Exists),
        "NOT_FOUND" => Ok(StoreStatus::NotFound),
        _ => Err(unexpected(line)),
    }
}

fn parse_value_line(line: &str) -> Option<(String, u32, usize, Option<u64>)> {
    let mut split = line.split(' ');
    if split.next()? != "VALUE" {
        return None;
    }
    let key = split.next()?.to_string();
    let flags = split.next()?.parse::<u32>().ok()?;
    let bytes = split.next()?.parse::<usize>().ok()?;
    let cas_unique = match split.next() {
        Some(x) => Some(x.parse::<u64>().ok()?),
        None => None,
    };
    if split.next().is_some() {
        return None;
    }
    Some((key, flags, bytes, cas_unique))
}

async fn parse_retrieval_rp<S: AsyncBufRead + Unpin>(s: &mut S) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut line = read_line(s).await?;
    while line.starts_with("VALUE ") {
        let Some((key, flags, bytes, cas_unique)) = parse_value_line(&line) else {
            return Err(unexpected(line));
        };
        if bytes > MAX_DATA_BLOCK {
            tracing::error!(key = %key, bytes, "data block length out of range");
            return Err(Error::Protocol(format!(
                "VALUE {key} claims {bytes} bytes, above the {MAX_DATA_BLOCK} byte ceiling"
            )));
        }
        let mut data_block = Vec::with_capacity(bytes.min(DATA_BLOCK_CHUNK));
        (&mut *s).take(bytes as u64).read_to_end(&mut data_block).await?;
        if data_block.len() < bytes {
            return Err(Error::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-value",
            )));
        }
        let end = read_line(s).await?;
        if !end.is_empty() {
            return Err(Error::Protocol(format!(
                "data block for {key:?} longer than {bytes} bytes"
            )));
        }
        items.push(Item {
            key,
            flags,
            cas_unique,
            data_block,
        });
        line = read_line(s).await?;
    }
    if line == "END" {
        Ok(items)
    } else {
        Err(unexpected(line))
    }
}

async fn parse_delete_rp<S: AsyncBufRead + Unpin>(s: &mut S, noreply: bool) -> Result<bool> {
    if noreply {
        return Ok(true);
    };
    let line = read_line(s).await?;
    match line.as_str() {
        "DELETED" => Ok(true),
        "NOT_FOUND" => Ok(false),
        _ => Err(unexpected(line)),
    }
}

async fn parse_incr_decr_rp<S: AsyncBufRead + Unpin>(s: &mut S) -> Result<Option<u64>> {
    let line = read_line(s).await?;
    if line == "NOT_FOUND" {
        return Ok(None);
    };
    match line.trim_end().parse::<u64>() {
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(unexpected(line)),
    }
}

async fn parse_touch_rp<S: AsyncBufRead + Unpin>(s: &mut S, noreply: bool) -> Result<bool> {
    if noreply {
        return Ok(true);
    };
    let line = read_line(s).await?;
    match line.as_str() {
        "TOUCHED" => Ok(true),
        "NOT_FOUND" => Ok(false),
        _ => Err(unexpected(line)),
    }
}

async fn parse_stats_rp<S: AsyncBufRead + Unpin>(s: &mut S) -> Result<HashMap<String, String>> {
    let mut items = HashMap::new();
    loop {
        let line = read_line(s).await?;
        if line == "END" {
            return Ok(items);
        }
        let mut split = line.splitn(3, ' ');
        match (split.next(), split.next(), split.next()) {
            (Some("STAT"), Some(name), value) => {
                items.insert(name.to_string(), value.unwrap_or_default().to_string());
            }
            _ => return Err(unexpected(line)),
        }
    }
}

async fn parse_ok_rp<S: AsyncBufRead + Unpin>(s: &mut S, noreply: bool) -> Result<()> {
    if noreply {
        return Ok(());
    };
    let line = read_line(s).await?;
    if line == "OK" {
        Ok(())
    } else {
        Err(unexpected(line))
    }
}

async fn parse_version_rp<S: AsyncBufRead + Unpin>(s: &mut S) -> Result<String> {
    let line = read_line(s).await?;
    match line.strip_prefix("VERSION ") {
        Some(version) => Ok(version.to_string()),
        None => Err(unexpected(line)),
    }
}

/// Reads the reply that `cmd` produces.
pub async fn read_reply<S: AsyncBufRead + Unpin>(s: &mut S, cmd: &Command<'_>) -> Result<Reply> {
    Ok(match cmd {
        Command::Get { .. } => Reply::Items(parse_retrieval_rp(s).await?),
        Command::Store { noreply, .. } => Reply::Store(parse_storage_rp(s, *noreply).await?),
        Command::Delete { noreply, .. } => Reply::Deleted(parse_delete_rp(s, *noreply).await?),
        Command::Incr { .. } | Command::Decr { .. } => {
            Reply::Counter(parse_incr_decr_rp(s).await?)
        }
        Command::Touch { noreply, .. } => Reply::Touched(parse_touch_rp(s, *noreply).await?),
        Command::Stats => Reply::Stats(parse_stats_rp(s).await?),
        Command::FlushAll { noreply, .. } => {
            parse_ok_rp(s, *noreply).await?;
            Reply::Ok
        }
        Command::Version => Reply::Version(parse_version_rp(s).await?),
    })
}

pub async fn execute_cmd<S>(s: &mut S, cmd: &Command<'_>) -> Result<Reply>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    s.write_all(&cmd.encode()).await?;
    s.flush().await?;
    read_reply(s, cmd).await
}

/// Writes every command in one flush, then reads the replies back in order.
///
/// The outer error means the stream itself failed. Per-command errors are
/// reported in place; once one command gets an error reply the remaining
/// replies are not read and are reported as lost.
pub async fn execute_pipeline<S>(s: &mut S, cmds: &[Command<'_>]) -> Result<Vec<Result<Reply>>>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    if cmds.is_empty() {
        return Ok(Vec::new());
    }
    let buf: Vec<u8> = cmds.iter().flat_map(|cmd| cmd.encode()).collect();
    s.write_all(&buf).await?;
    s.flush().await?;

    let mut result = Vec::with_capacity(cmds.len());
    let mut failed = false;
    for cmd in cmds {
        if failed {
            result.push(Err(Error::Protocol(format!(
                "{} reply lost after an earlier error",
                cmd.name()
            ))));
            continue;
        }
        match read_reply(s, cmd).await {
            Ok(reply) => result.push(Ok(reply)),
            Err(e @ Error::Server { .. }) => {
                failed = true;
                result.push(Err(e));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(result)
}
