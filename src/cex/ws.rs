//! WebSocket plumbing shared by the streaming connectors.
//!
//! Each live connector owns one I/O worker that reads the socket, answers
//! protocol pings, and feeds decoded frames into a bounded queue; one
//! dispatcher task drains the queue into the connector's routing code. When
//! the queue saturates the oldest frame is dropped and logged.

use crate::cex::StreamCallback;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// How Binary frames decode into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    Utf8,
    /// HTX wraps every frame in gzip.
    Gzip,
}

pub fn decode_binary(data: &[u8], codec: FrameCodec) -> Option<String> {
    match codec {
        FrameCodec::Utf8 => String::from_utf8(data.to_vec()).ok(),
        FrameCodec::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = String::new();
            match decoder.read_to_string(&mut out) {
                Ok(_) => Some(out),
                Err(_) => String::from_utf8(data.to_vec()).ok(),
            }
        }
    }
}

/// Bounded frame queue between the I/O worker and the dispatcher.
pub struct EventQueue {
    frames: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn push(&self, frame: String) {
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                frames.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event queue saturated, dropping oldest frame");
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Next frame, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct WsSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSender {
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }
}

pub struct WsWorker {
    pub sender: WsSender,
    pub handle: JoinHandle<()>,
}

/// Connects and spawns the I/O worker. Inbound frames land in `queue`;
/// outbound messages go through the returned sender. The worker answers
/// protocol pings itself and closes the queue when the transport drops.
pub async fn connect(url: &str, codec: FrameCodec, queue: Arc<EventQueue>) -> Result<WsWorker> {
    let (ws_stream, _) = connect_async(url)
        .await
        .with_context(|| format!("ws connect failed: {}", url))?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => queue.push(text),
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(text) = decode_binary(&data, codec) {
                            queue.push(text);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "ws transport error");
                        break;
                    }
                },
            }
        }
        queue.close();
    });

    Ok(WsWorker {
        sender: WsSender { tx },
        handle,
    })
}

/// Streaming state every connector carries: the callback, the live sender,
/// spawned task handles, and the desired symbol set (`None` = all symbols).
///
/// All operations are synchronous and bounded, so `stop` completes even when
/// the transport is unresponsive: tasks are aborted, not joined.
pub struct StreamCore {
    cb: RwLock<Option<Arc<dyn StreamCallback>>>,
    sender: Mutex<Option<WsSender>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
    depth: AtomicBool,
    desired: Mutex<Option<Vec<String>>>,
}

impl Default for StreamCore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCore {
    pub fn new() -> Self {
        Self {
            cb: RwLock::new(None),
            sender: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            depth: AtomicBool::new(true),
            desired: Mutex::new(None),
        }
    }

    /// Claims the connector for streaming. Errors if already active.
    pub fn try_begin(
        &self,
        cb: Arc<dyn StreamCallback>,
        depth: bool,
        desired: Option<Vec<String>>,
    ) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            anyhow::bail!("stream already active; call stop() first");
        }
        *self.cb.write() = Some(cb);
        self.depth.store(depth, Ordering::Relaxed);
        *self.desired.lock() = desired;
        Ok(())
    }

    /// Rolls back a failed `try_begin` (e.g. the connect failed).
    pub fn rollback_begin(&self) {
        *self.cb.write() = None;
        *self.sender.lock() = None;
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn attach_worker(&self, worker: WsWorker) {
        *self.sender.lock() = Some(worker.sender.clone());
        self.tasks.lock().push(worker.handle);
    }

    pub fn attach_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn depth_enabled(&self) -> bool {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn callback(&self) -> Option<Arc<dyn StreamCallback>> {
        self.cb.read().clone()
    }

    pub fn sender(&self) -> Option<WsSender> {
        self.sender.lock().clone()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match self.sender() {
            Some(sender) => sender.send_json(value),
            None => false,
        }
    }

    pub fn desired_symbols(&self) -> Option<Vec<String>> {
        self.desired.lock().clone()
    }

    /// Extends the desired set. A `None` set means "all symbols" and stays
    /// that way.
    pub fn add_desired(&self, tokens: &[String]) {
        let mut desired = self.desired.lock();
        if let Some(list) = desired.as_mut() {
            for token in tokens {
                if !list.contains(token) {
                    list.push(token.clone());
                }
            }
        }
    }

    pub fn remove_desired(&self, tokens: &[String]) {
        let mut desired = self.desired.lock();
        if let Some(list) = desired.as_mut() {
            list.retain(|sym| !tokens.contains(sym));
        }
    }

    /// Aborts the worker and dispatcher, forgets the callback, and frees the
    /// claim. Safe to call repeatedly.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.sender.lock() = None;
        *self.cb.write() = None;
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookDepth, BookTicker, CandleStick};

    #[tokio::test]
    async fn test_queue_fifo_and_close() {
        let queue = EventQueue::new(4);
        queue.push("a".to_string());
        queue.push("b".to_string());
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = EventQueue::new(2);
        queue.push("1".to_string());
        queue.push("2".to_string());
        queue.push("3".to_string());
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.as_deref(), Some("2"));
        assert_eq!(queue.pop().await.as_deref(), Some("3"));
    }

    #[test]
    fn test_gzip_decode_falls_back_to_utf8() {
        assert_eq!(
            decode_binary(b"{\"ping\":1}", FrameCodec::Gzip).as_deref(),
            Some("{\"ping\":1}")
        );
        assert_eq!(
            decode_binary(b"{}", FrameCodec::Utf8).as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn test_gzip_decode_real_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ch\":\"market.btcusdt.bbo\"}").unwrap();
        let data = encoder.finish().unwrap();
        assert_eq!(
            decode_binary(&data, FrameCodec::Gzip).as_deref(),
            Some("{\"ch\":\"market.btcusdt.bbo\"}")
        );
    }

    struct NullCallback;
    impl StreamCallback for NullCallback {
        fn handle(
            &self,
            _book: Option<BookTicker>,
            _depth: Option<BookDepth>,
            _kline: Option<CandleStick>,
        ) {
        }
    }

    #[tokio::test]
    async fn test_stream_core_double_start_and_idempotent_stop() {
        let core = StreamCore::new();
        assert!(!core.is_active());
        core.try_begin(Arc::new(NullCallback), true, None).unwrap();
        assert!(core.is_active());
        assert!(core.try_begin(Arc::new(NullCallback), true, None).is_err());

        core.stop();
        assert!(!core.is_active());
        core.stop(); // idempotent
        assert!(core.try_begin(Arc::new(NullCallback), false, None).is_ok());
    }

    #[test]
    fn test_desired_set_tracking() {
        let core = StreamCore::new();
        // None means "all": additions keep it that way.
        core.add_desired(&["BTC/USDT".to_string()]);
        assert!(core.desired_symbols().is_none());

        let core = StreamCore::new();
        core.try_begin(Arc::new(NullCallback), true, Some(vec!["BTC/USDT".to_string()]))
            .unwrap();
        core.add_desired(&["ETH/USDT".to_string(), "BTC/USDT".to_string()]);
        assert_eq!(
            core.desired_symbols().unwrap(),
            vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]
        );
        core.remove_desired(&["BTC/USDT".to_string()]);
        assert_eq!(core.desired_symbols().unwrap(), vec!["ETH/USDT".to_string()]);
    }
}
