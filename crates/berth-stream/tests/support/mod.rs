//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use berth_common::error::{BerthError, Result};
use berth_stream::transport::{Closer, Method, StreamResponse, StreamTransport};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};

/// One scripted reply to an `open_stream` call.
pub enum Reply {
    /// A complete body delivered at once.
    Body(u16, Vec<u8>),
    /// A live body fed through a channel; ends when the feeder is dropped.
    Live(u16, ChannelBody),
    /// A transport failure.
    Fail(String),
    /// Another reply, given only after the open has blocked this long.
    Delayed(Duration, Box<Reply>),
}

/// Transport answering requests from per-path-prefix reply queues.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, VecDeque<Reply>)>>,
    opened: Mutex<Vec<(Method, String)>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reply` for the next request whose path starts with `prefix`.
    pub fn push(&self, prefix: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        if let Some((_, queue)) = routes.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(reply);
        } else {
            routes.push((prefix.to_string(), VecDeque::from([reply])));
        }
    }

    /// Queues a live body and returns the feeder for it.
    pub fn push_live(&self, prefix: &str) -> Feeder {
        let (feeder, body) = channel_body();
        self.push(prefix, Reply::Live(200, body));
        feeder
    }

    /// Every path opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }

    pub fn opened_with(&self) -> Vec<(Method, String)> {
        self.opened.lock().unwrap().clone()
    }

    /// Live bodies handed out and not yet dropped.
    pub fn live_bodies(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl StreamTransport for ScriptedTransport {
    fn open_stream(&self, method: Method, path: &str, _body: Option<&[u8]>) -> Result<StreamResponse> {
        self.opened.lock().unwrap().push((method, path.to_string()));
        let reply = self
            .routes
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .and_then(|(_, queue)| queue.pop_front());
        match reply {
            Some(reply) => self.answer(reply),
            None => Err(BerthError::Transport {
                message: format!("connection refused: {path}"),
            }),
        }
    }
}

impl ScriptedTransport {
    fn answer(&self, reply: Reply) -> Result<StreamResponse> {
        match reply {
            Reply::Body(status, bytes) => Ok(StreamResponse::new(status, io::Cursor::new(bytes))),
            Reply::Live(status, mut body) => {
                body.track(Arc::clone(&self.live));
                let closer = body.closer();
                Ok(StreamResponse::new(status, body).with_closer(closer))
            }
            Reply::Fail(message) => Err(BerthError::Transport { message }),
            Reply::Delayed(delay, reply) => {
                std::thread::sleep(delay);
                self.answer(*reply)
            }
        }
    }
}

/// Write side of a [`ChannelBody`].
#[derive(Clone)]
pub struct Feeder(Sender<Vec<u8>>);

impl Feeder {
    /// Sends bytes; silently ignored once the reader has hung up.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.0.send(bytes.into());
    }

    pub fn line(&self, json: &str) {
        self.send(format!("{json}\n"));
    }
}

/// Blocking body whose bytes arrive through a channel.
///
/// Its closer ends a blocked read with end of stream.
pub struct ChannelBody {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    live: Option<Arc<AtomicUsize>>,
}

pub fn channel_body() -> (Feeder, ChannelBody) {
    let (tx, rx) = unbounded();
    let (wake_tx, wake_rx) = bounded(1);
    (
        Feeder(tx),
        ChannelBody {
            rx,
            pending: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
            live: None,
        },
    )
}

impl ChannelBody {
    fn closer(&self) -> Closer {
        let closed = Arc::clone(&self.closed);
        let wake = self.wake_tx.clone();
        Closer::new(move || {
            closed.store(true, Ordering::SeqCst);
            let _ = wake.try_send(());
        })
    }

    fn track(&mut self, live: Arc<AtomicUsize>) {
        let _ = live.fetch_add(1, Ordering::SeqCst);
        self.live = Some(live);
    }
}

impl Drop for ChannelBody {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            let _ = live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Read for ChannelBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            select! {
                recv(self.rx) -> chunk => match chunk {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                },
                recv(self.wake_rx) -> _ => {}
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        let _ = self.pending.drain(..n);
        Ok(n)
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
