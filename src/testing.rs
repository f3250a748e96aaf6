//! Scripted collaborators shared by unit tests.

use crate::cache::{ContentCache, Download, Transport};
use crate::config::{CacheSettings, RetrySettings};
use crate::error::{Error, Result};
use crate::media::backend::{DecodeBackend, DecoderFactory};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub enum Reply {
    Fail(Error),
    Body(Vec<Vec<u8>>),
    /// One chunk, then the body never ends.
    Stall(&'static [u8]),
    /// First chunk at once, the rest after the gate is notified.
    Gated(Vec<Vec<u8>>, Arc<Notify>),
}

impl Reply {
    pub fn body(chunks: &[&[u8]]) -> Self {
        Reply::Body(chunks.iter().map(|c| c.to_vec()).collect())
    }

    pub fn owned(chunks: Vec<Vec<u8>>) -> Self {
        Reply::Body(chunks)
    }
}

/// Transport answering from a script, one reply per `open`.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Serve `body` for every request.
    pub fn serving(body: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(body.to_vec()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<Download> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        let reply = match (reply, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(body)) => Reply::Body(vec![body.clone()]),
            (None, None) => Reply::Fail(Error::permanent(format!("unscripted request {}", url))),
        };

        match reply {
            Reply::Fail(e) => Err(e),
            Reply::Body(chunks) => {
                let total = chunks.iter().map(|c| c.len() as u64).sum();
                let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed();
                Ok(Download {
                    total: Some(total),
                    body,
                })
            }
            Reply::Stall(chunk) => {
                let body = stream::iter(vec![Ok(Bytes::from_static(chunk))])
                    .chain(stream::pending())
                    .boxed();
                Ok(Download { total: None, body })
            }
            Reply::Gated(chunks, gate) => {
                let total = chunks.iter().map(|c| c.len() as u64).sum();
                let mut chunks = chunks.into_iter();
                let first: Vec<Vec<u8>> = chunks.next().into_iter().collect();
                let rest: Vec<Vec<u8>> = chunks.collect();
                let body = stream::iter(first.into_iter().map(|c| Ok(Bytes::from(c))))
                    .chain(
                        stream::once(async move {
                            gate.notified().await;
                            stream::iter(rest.into_iter().map(|c| Ok(Bytes::from(c))))
                        })
                        .flatten(),
                    )
                    .boxed();
                Ok(Download {
                    total: Some(total),
                    body,
                })
            }
        }
    }
}

pub fn test_cache(dir: &TempDir, transport: Arc<ScriptedTransport>) -> ContentCache {
    let settings = CacheSettings {
        dir: dir.path().to_path_buf(),
        max_size_mb: 16,
        max_concurrent_downloads: 4,
        progress_interval_ms: 10,
        progress_step_bytes: 1024,
    };
    let retry = RetrySettings {
        max_attempts: 2,
        base_delay_ms: 10,
        max_delay_ms: 10,
        jitter: false,
    };
    ContentCache::open(&settings, retry, transport).unwrap()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::new(width, height);
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Observations of one scripted decoder.
#[derive(Clone, Default)]
pub struct DecoderLog {
    playing: Arc<AtomicBool>,
    disposals: Arc<AtomicUsize>,
}

impl DecoderLog {
    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

/// How a scripted decoder's `initialize` behaves.
#[derive(Clone)]
pub enum Outcome {
    Succeed(Option<Duration>),
    Fail(&'static str),
    Hang,
}

/// Decoder whose `initialize` optionally waits for a gate, then follows
/// its outcome.
pub struct ScriptedDecoder {
    outcome: Outcome,
    gate: Option<Arc<Notify>>,
    log: DecoderLog,
}

impl ScriptedDecoder {
    pub fn new(duration: Option<Duration>) -> (Self, DecoderLog) {
        Self::scripted(Outcome::Succeed(duration), None)
    }

    pub fn scripted(outcome: Outcome, gate: Option<Arc<Notify>>) -> (Self, DecoderLog) {
        let log = DecoderLog::default();
        (
            Self {
                outcome,
                gate,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl DecodeBackend for ScriptedDecoder {
    async fn initialize(&self, _source: &Path) -> Result<Option<Duration>> {
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        match self.outcome {
            Outcome::Succeed(duration) => Ok(duration),
            Outcome::Fail(msg) => Err(Error::load(msg)),
            Outcome::Hang => std::future::pending().await,
        }
    }

    fn play(&self) -> Result<()> {
        self.log.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.log.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) {
        self.log.playing.store(false, Ordering::SeqCst);
        self.log.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out scripted decoders in order, then a default one.
pub struct ScriptedDecoders {
    scripts: Mutex<VecDeque<(Outcome, Option<Arc<Notify>>)>>,
    default_duration: Option<Duration>,
    logs: Mutex<Vec<DecoderLog>>,
}

impl ScriptedDecoders {
    pub fn new(default_duration: Option<Duration>) -> Arc<Self> {
        Self::with_scripts(default_duration, vec![])
    }

    pub fn with_scripts(
        default_duration: Option<Duration>,
        scripts: Vec<(Outcome, Option<Arc<Notify>>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            default_duration,
            logs: Mutex::new(Vec::new()),
        })
    }

    /// Logs of every decoder created so far, in creation order.
    pub fn logs(&self) -> Vec<DecoderLog> {
        self.logs.lock().unwrap().clone()
    }
}

impl DecoderFactory for ScriptedDecoders {
    fn create(&self) -> Box<dyn DecodeBackend> {
        let (outcome, gate) = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((Outcome::Succeed(self.default_duration), None));
        let (decoder, log) = ScriptedDecoder::scripted(outcome, gate);
        self.logs.lock().unwrap().push(log);
        Box::new(decoder)
    }
}
