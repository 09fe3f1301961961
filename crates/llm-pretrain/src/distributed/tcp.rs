//! Portable collectives over TCP.
//!
//! Star topology: every worker holds one connection to rank 0, which reduces
//! in rank order and fans the result back out. Frames are a little-endian
//! `u64` byte length followed by the payload.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::{Backend, ProcessGroup};
use crate::error::{TrainError, TrainResult};

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

fn net_err(what: &str, e: std::io::Error) -> TrainError {
    TrainError::Distributed(format!("{}: {}", what, e))
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> TrainResult<()> {
    stream
        .write_all(&(payload.len() as u64).to_le_bytes())
        .and_then(|_| stream.write_all(payload))
        .and_then(|_| stream.flush())
        .map_err(|e| net_err("send failed", e))
}

fn read_frame(stream: &mut TcpStream) -> TrainResult<Vec<u8>> {
    let mut len = [0u8; 8];
    stream
        .read_exact(&mut len)
        .map_err(|e| net_err("receive failed", e))?;
    let mut payload = vec![0u8; u64::from_le_bytes(len) as usize];
    stream
        .read_exact(&mut payload)
        .map_err(|e| net_err("receive failed", e))?;
    Ok(payload)
}

fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_f32(bytes: &[u8], expected: usize) -> TrainResult<Vec<f32>> {
    if bytes.len() != expected * 4 {
        return Err(TrainError::Distributed(format!(
            "collective size mismatch: expected {} floats, peer sent {} bytes",
            expected,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// TCP process group.
///
/// On rank 0 `peers[i]` is the connection to rank `i + 1`; on workers it
/// holds the single connection to rank 0.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    peers: Vec<Mutex<TcpStream>>,
}

impl TcpGroup {
    /// Rank 0: bind the rendezvous address and wait for every worker.
    pub fn listen(endpoint: &str, world_size: usize) -> TrainResult<Self> {
        let listener = TcpListener::bind(endpoint)
            .map_err(|e| net_err(&format!("cannot bind {}", endpoint), e))?;
        Self::accept_workers(listener, world_size)
    }

    /// Rank 0 with an already-bound listener.
    pub fn accept_workers(listener: TcpListener, world_size: usize) -> TrainResult<Self> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, addr) = listener
                .accept()
                .map_err(|e| net_err("accept failed", e))?;
            stream
                .set_nodelay(true)
                .map_err(|e| net_err("set_nodelay failed", e))?;
            let hello = read_frame(&mut stream)?;
            let peer_rank = match <[u8; 8]>::try_from(hello.as_slice()) {
                Ok(bytes) => u64::from_le_bytes(bytes) as usize,
                Err(_) => {
                    return Err(TrainError::Distributed(format!(
                        "malformed handshake from {}",
                        addr
                    )))
                }
            };
            if peer_rank == 0 || peer_rank >= world_size || slots[peer_rank - 1].is_some() {
                return Err(TrainError::Distributed(format!(
                    "unexpected handshake for rank {} from {}",
                    peer_rank, addr
                )));
            }
            tracing::debug!(peer_rank, %addr, "Worker joined process group");
            slots[peer_rank - 1] = Some(stream);
        }

        let peers = slots.into_iter().flatten().map(Mutex::new).collect();
        Ok(Self {
            rank: 0,
            world_size,
            peers,
        })
    }

    /// Workers: connect to rank 0, retrying while it comes up.
    pub fn connect(endpoint: &str, rank: usize, world_size: usize) -> TrainResult<Self> {
        let addr = endpoint
            .to_socket_addrs()
            .map_err(|e| net_err(&format!("cannot resolve {}", endpoint), e))?
            .next()
            .ok_or_else(|| TrainError::Distributed(format!("{} resolved to no address", endpoint)))?;

        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| net_err("set_nodelay failed", e))?;
                    write_frame(&mut stream, &(rank as u64).to_le_bytes())?;
                    return Ok(Self {
                        rank,
                        world_size,
                        peers: vec![Mutex::new(stream)],
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(TrainError::Distributed(format!(
            "rank {} could not reach {}: {}",
            rank,
            endpoint,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Rendezvous for this rank: rank 0 listens, everyone else connects.
    pub fn rendezvous(endpoint: &str, rank: usize, world_size: usize) -> TrainResult<Self> {
        if rank == 0 {
            Self::listen(endpoint, world_size)
        } else {
            Self::connect(endpoint, rank, world_size)
        }
    }

    fn with_peer<T>(&self, idx: usize, f: impl FnOnce(&mut TcpStream) -> TrainResult<T>) -> TrainResult<T> {
        let mut stream = self.peers[idx]
            .lock()
            .map_err(|_| TrainError::Distributed("peer connection lock poisoned".to_string()))?;
        f(&mut *stream)
    }

    /// Rank 0's bytes delivered to every rank.
    pub fn broadcast_bytes(&self, payload: &[u8]) -> TrainResult<Vec<u8>> {
        if self.rank == 0 {
            for idx in 0..self.peers.len() {
                self.with_peer(idx, |s| write_frame(s, payload))?;
            }
            Ok(payload.to_vec())
        } else {
            self.with_peer(0, read_frame)
        }
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn backend(&self) -> Backend {
        Backend::Tcp
    }

    fn barrier(&self) -> TrainResult<()> {
        self.all_reduce_sum(&mut [])
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> TrainResult<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            // Fixed rank order keeps the sum bitwise identical everywhere.
            for idx in 0..self.peers.len() {
                let theirs = bytes_to_f32(&self.with_peer(idx, read_frame)?, buf.len())?;
                for (acc, v) in buf.iter_mut().zip(theirs) {
                    *acc += v;
                }
            }
            let reduced = f32_to_bytes(buf);
            for idx in 0..self.peers.len() {
                self.with_peer(idx, |s| write_frame(s, &reduced))?;
            }
        } else {
            let reduced = self.with_peer(0, |s| {
                write_frame(s, &f32_to_bytes(buf))?;
                read_frame(s)
            })?;
            buf.copy_from_slice(&bytes_to_f32(&reduced, buf.len())?);
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32]) -> TrainResult<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let received = self.broadcast_bytes(&f32_to_bytes(buf))?;
        if self.rank != 0 {
            buf.copy_from_slice(&bytes_to_f32(&received, buf.len())?);
        }
        Ok(())
    }
}
