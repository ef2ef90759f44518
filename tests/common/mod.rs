//! In-process memcached stand-in for the integration tests.
//!
//! Every mock listens on its own loopback port and serves each connection on
//! a thread. Items live in memory with memcached's CAS bookkeeping; expiry
//! times are accepted and ignored.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use mcring::{ServerAddr, Socket, SocketTransport, Transport};

/// How the mock answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Behave like memcached.
    Normal,
    /// Hang up on every request and every new connection.
    Down,
    /// Answer every request with `ERROR`.
    Error,
    /// Answer every request with a line no client understands.
    Garbage,
    /// Accept every request and never answer.
    Silent,
}

#[derive(Debug, Clone)]
pub struct StoredItem {
    pub flags: u32,
    pub data: Vec<u8>,
    pub cas: u64,
}

#[derive(Default)]
struct State {
    items: Mutex<HashMap<String, StoredItem>>,
    next_cas: AtomicU64,
    requests: AtomicUsize,
    mode: Mutex<Option<Mode>>,
}

impl State {
    fn mode(&self) -> Mode {
        self.mode.lock().unwrap().unwrap_or(Mode::Normal)
    }
}

pub struct MockMemcached {
    addr: String,
    state: Arc<State>,
}

impl MockMemcached {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State::default());

        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                if shared.mode() == Mode::Down {
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                let state = shared.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &state);
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.state.mode.lock().unwrap() = Some(mode);
    }

    pub fn stop(&self) {
        self.set_mode(Mode::Down);
    }

    pub fn resume(&self) {
        self.set_mode(Mode::Normal);
    }

    /// Command lines received so far, including rejected ones.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn item(&self, key: &str) -> Option<StoredItem> {
        self.state.items.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.items.lock().unwrap().len()
    }
}

/// `n` distinct loopback addresses nothing listens on.
pub fn closed_ports(n: usize) -> Vec<String> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect()
}

/// [`SocketTransport`] that counts connection attempts.
#[derive(Clone, Default)]
pub struct CountingTransport {
    pub connects: Arc<AtomicUsize>,
}

impl CountingTransport {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for CountingTransport {
    type Stream = Socket;

    async fn connect(&self, addr: &ServerAddr) -> io::Result<Socket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        SocketTransport.connect(addr).await
    }
}

fn serve(stream: TcpStream, state: &State) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        state.requests.fetch_add(1, Ordering::SeqCst);
        match state.mode() {
            Mode::Down => return writer.shutdown(Shutdown::Both),
            Mode::Error => {
                skip_data_block(&line, &mut reader)?;
                writer.write_all(b"ERROR\r\n")?;
                continue;
            }
            Mode::Garbage => {
                skip_data_block(&line, &mut reader)?;
                writer.write_all(b"WAT\r\n")?;
                continue;
            }
            Mode::Silent => {
                skip_data_block(&line, &mut reader)?;
                continue;
            }
            Mode::Normal => {}
        }
        let response = handle(line.trim_end(), &mut reader, state)?;
        writer.write_all(&response)?;
    }
}

fn skip_data_block(line: &str, reader: &mut impl Read) -> io::Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if let ["set" | "add" | "replace" | "append" | "prepend" | "cas", _, _, _, bytes, ..] =
        parts.as_slice()
        && let Ok(n) = bytes.parse::<usize>()
    {
        read_block(reader, n)?;
    }
    Ok(())
}

fn read_block(reader: &mut impl Read, n: usize) -> io::Result<Vec<u8>> {
    let mut data = vec![0; n + 2];
    reader.read_exact(&mut data)?;
    data.truncate(n);
    Ok(data)
}

fn handle(line: &str, reader: &mut impl Read, state: &State) -> io::Result<Vec<u8>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        return Ok(b"ERROR\r\n".to_vec());
    };
    let noreply = args.last() == Some(&"noreply");
    let mut items = state.items.lock().unwrap();
    let next_cas = || state.next_cas.fetch_add(1, Ordering::SeqCst) + 1;

    let response = match cmd {
        "get" | "gets" => {
            let mut out = Vec::new();
            for key in args {
                if let Some(item) = items.get(*key) {
                    let header = if cmd == "gets" {
                        format!("VALUE {key} {} {} {}\r\n", item.flags, item.data.len(), item.cas)
                    } else {
                        format!("VALUE {key} {} {}\r\n", item.flags, item.data.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(&item.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
            let (Some(key), Some(flags), Some(bytes)) = (
                args.first(),
                args.get(1).and_then(|f| f.parse::<u32>().ok()),
                args.get(3).and_then(|b| b.parse::<usize>().ok()),
            ) else {
                return Ok(b"CLIENT_ERROR bad command line format\r\n".to_vec());
            };
            let data = read_block(reader, bytes)?;
            let key = key.to_string();
            let status: &[u8] = match cmd {
                "add" if items.contains_key(&key) => b"NOT_STORED\r\n",
                "replace" if !items.contains_key(&key) => b"NOT_STORED\r\n",
                "append" | "prepend" => match items.get_mut(&key) {
                    Some(item) => {
                        if cmd == "append" {
                            item.data.extend_from_slice(&data);
                        } else {
                            item.data = [data, std::mem::take(&mut item.data)].concat();
                        }
                        item.cas = next_cas();
                        b"STORED\r\n"
                    }
                    None => b"NOT_STORED\r\n",
                },
                "cas" => {
                    let token = args.get(4).and_then(|t| t.parse::<u64>().ok());
                    match items.get(&key).map(|item| item.cas) {
                        None => b"NOT_FOUND\r\n",
                        Some(current) if Some(current) != token => b"EXISTS\r\n",
                        Some(_) => {
                            let cas = next_cas();
                            items.insert(key, StoredItem { flags, data, cas });
                            b"STORED\r\n"
                        }
                    }
                }
                _ => {
                    let cas = next_cas();
                    items.insert(key, StoredItem { flags, data, cas });
                    b"STORED\r\n"
                }
            };
            status.to_vec()
        }
        "delete" => match args.first().and_then(|key| items.remove(*key)) {
            Some(_) => b"DELETED\r\n".to_vec(),
            None => b"NOT_FOUND\r\n".to_vec(),
        },
        "touch" => match args.first().and_then(|key| items.get(*key)) {
            Some(_) => b"TOUCHED\r\n".to_vec(),
            None => b"NOT_FOUND\r\n".to_vec(),
        },
        "incr" | "decr" => {
            let delta = args.get(1).and_then(|d| d.parse::<u64>().ok()).unwrap_or(0);
            match args.first().and_then(|key| items.get_mut(*key)) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(item) => match std::str::from_utf8(&item.data)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                {
                    None => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                        .to_vec(),
                    Some(current) => {
                        let value = if cmd == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        item.data = value.to_string().into_bytes();
                        item.cas = next_cas();
                        format!("{value}\r\n").into_bytes()
                    }
                },
            }
        }
        "stats" => format!(
            "STAT pid 1\r\nSTAT curr_items {}\r\nSTAT version 1.6.21-mock\r\nEND\r\n",
            items.len()
        )
        .into_bytes(),
        "flush_all" => {
            items.clear();
            b"OK\r\n".to_vec()
        }
        "version" => b"VERSION 1.6.21-mock\r\n".to_vec(),
        _ => b"ERROR\r\n".to_vec(),
    };
    Ok(if noreply { Vec::new() } else { response })
}
