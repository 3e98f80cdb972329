// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    CancelOutcome, EVENT_CHANNEL_CAPACITY, TransferEvent, TransferRequest, TransferSession,
};
use crate::error::TransferError;
use crate::http::{ByteRange, HttpClient};
use crate::record::{ResumeToken, TaskId};

/// Transfers allowed to move bytes at the same time
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Read buffer used when hashing an existing partial file
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// What the HTTP session stores inside a resume token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResumeState {
    url: Url,
    partial_path: PathBuf,
    bytes_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl ResumeState {
    fn decode(token: &ResumeToken) -> Result<Self, TransferError> {
        serde_json::from_slice(token.as_bytes()).map_err(TransferError::InvalidResumeToken)
    }

    fn encode(&self) -> Option<ResumeToken> {
        serde_json::to_vec(self).ok().map(ResumeToken::new)
    }
}

struct RunningTransfer {
    cancel: CancellationToken,
    /// Set by `cancel`; answered by the worker once it has stopped
    reply: Option<oneshot::Sender<CancelOutcome>>,
}

type RunningMap = Arc<Mutex<HashMap<TaskId, RunningTransfer>>>;

/// Transfer session that streams HTTP downloads into `.partial` files.
///
/// Each transfer runs as its own tokio task; a semaphore holds transfers
/// beyond `max_concurrent` in a FIFO queue until a slot frees up.
pub struct HttpTransferSession<C> {
    client: C,
    limiter: Arc<Semaphore>,
    max_concurrent: usize,
    next_id: AtomicU64,
    running: RunningMap,
    events: mpsc::Sender<TransferEvent>,
}

impl<C: HttpClient + Clone + 'static> HttpTransferSession<C> {
    /// Create a session and the channel its transfers report on
    pub fn new(client: C, max_concurrent: usize) -> (Self, mpsc::Receiver<TransferEvent>) {
        let max_concurrent = max_concurrent.max(1);
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let session = Self {
            client,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            next_id: AtomicU64::new(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (session, rx)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Transfers started and not yet finished, queued ones included
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

#[async_trait]
impl<C: HttpClient + Clone + 'static> TransferSession for HttpTransferSession<C> {
    async fn start(&self, request: TransferRequest) -> Result<TaskId, TransferError> {
        let resume = request
            .resume_token
            .as_ref()
            .map(ResumeState::decode)
            .transpose()?;

        let task_id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        self.running.lock().await.insert(
            task_id,
            RunningTransfer {
                cancel: cancel.clone(),
                reply: None,
            },
        );

        debug!(
            task = %task_id,
            url = %request.url,
            resuming = resume.is_some(),
            "transfer queued"
        );

        let worker = Worker {
            client: self.client.clone(),
            task_id,
            events: self.events.clone(),
            running: Arc::clone(&self.running),
        };
        tokio::spawn(worker.run(request, resume, cancel, Arc::clone(&self.limiter)));

        Ok(task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Option<CancelOutcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut running = self.running.lock().await;
            let transfer = running.get_mut(&task_id)?;
            transfer.reply = Some(tx);
            transfer.cancel.cancel();
        }
        // The worker drops the sender unanswered if it finished first
        rx.await.ok()
    }
}

enum Outcome {
    Finished {
        path: PathBuf,
        bytes: u64,
        content_hash: String,
    },
    Canceled(CancelOutcome),
}

struct Worker<C> {
    client: C,
    task_id: TaskId,
    events: mpsc::Sender<TransferEvent>,
    running: RunningMap,
}

impl<C: HttpClient> Worker<C> {
    async fn run(
        self,
        request: TransferRequest,
        resume: Option<ResumeState>,
        cancel: CancellationToken,
        limiter: Arc<Semaphore>,
    ) {
        // Canceled while still queued: hand back whatever the caller resumed from
        let queued = CancelOutcome {
            resume_token: request.resume_token.clone(),
            bytes_received: resume.as_ref().map_or(0, |state| state.bytes_received),
            bytes_expected: None,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Outcome::Canceled(queued)),
            permit = limiter.acquire_owned() => match permit {
                Ok(_permit) => self.transfer(&request, resume.as_ref(), &cancel).await,
                Err(_) => Err(TransferError::SessionClosed),
            },
        };

        let reply = self
            .running
            .lock()
            .await
            .remove(&self.task_id)
            .and_then(|transfer| transfer.reply);

        let event = match result {
            Ok(Outcome::Canceled(outcome)) => {
                debug!(task = %self.task_id, bytes = outcome.bytes_received, "transfer canceled");
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
                return;
            }
            Ok(Outcome::Finished {
                path,
                bytes,
                content_hash,
            }) => {
                info!(task = %self.task_id, path = %path.display(), bytes, "transfer finished");
                TransferEvent::Finished {
                    task_id: self.task_id,
                    path,
                    bytes,
                    content_hash: Some(content_hash),
                }
            }
            Err(e) => {
                warn!(task = %self.task_id, url = %request.url, error = %e, "transfer failed");
                TransferEvent::Failed {
                    task_id: self.task_id,
                    reason: e.to_string(),
                }
            }
        };

        if self.events.send(event).await.is_err() {
            debug!(task = %self.task_id, "event receiver gone");
        }
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        resume: Option<&ResumeState>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, TransferError> {
        let url = request.url.as_str();
        let partial_path = resume
            .map(|state| state.partial_path.clone())
            .unwrap_or_else(|| partial_path_for(&request.destination));
        let range = match resume.filter(|state| state.bytes_received > 0) {
            Some(state) => {
                let on_disk = tokio::fs::metadata(&partial_path)
                    .await
                    .map(|meta| meta.len())
                    .ok();
                if on_disk == Some(state.bytes_received) {
                    Some(ByteRange {
                        start: state.bytes_received,
                        if_range: state.etag.clone(),
                    })
                } else {
                    warn!(
                        task = %self.task_id,
                        expected = state.bytes_received,
                        on_disk = ?on_disk,
                        "partial file does not match resume data, restarting"
                    );
                    None
                }
            }
            None => None,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(Outcome::Canceled(CancelOutcome {
                    resume_token: request.resume_token.clone(),
                    bytes_received: range.as_ref().map_or(0, |r| r.start),
                    bytes_expected: None,
                }));
            }
            response = self.client.get_stream(url, range.as_ref()) => {
                response.map_err(|e| TransferError::HttpFailed {
                    url: url.to_string(),
                    source: e,
                })?
            }
        };

        if response.status >= 400 {
            return Err(TransferError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let mut hasher = Sha256::new();
        // A 200 answer to a range request means the server restarted the body
        let (mut file, mut written) = if range.is_some() && response.status == 206 {
            let existing = hash_file(&partial_path, &mut hasher).await?;
            let file = OpenOptions::new()
                .append(true)
                .open(&partial_path)
                .await
                .map_err(|e| TransferError::FileCreateFailed {
                    path: partial_path.clone(),
                    source: e,
                })?;
            (file, existing)
        } else {
            if let Some(parent) = partial_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TransferError::FileCreateFailed {
                        path: parent.to_path_buf(),
                        source: e,
                    }
                })?;
            }
            let file =
                File::create(&partial_path)
                    .await
                    .map_err(|e| TransferError::FileCreateFailed {
                        path: partial_path.clone(),
                        source: e,
                    })?;
            (file, 0)
        };

        let bytes_expected = response.content_length.map(|len| len + written);
        let etag = response
            .etag
            .clone()
            .or_else(|| resume.and_then(|state| state.etag.clone()));
        let mut body = response.body;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flush(&mut file, &partial_path).await?;
                    let resume_token = (written > 0)
                        .then(|| {
                            ResumeState {
                                url: request.url.clone(),
                                partial_path: partial_path.clone(),
                                bytes_received: written,
                                etag: etag.clone(),
                            }
                            .encode()
                        })
                        .flatten();
                    return Ok(Outcome::Canceled(CancelOutcome {
                        resume_token,
                        bytes_received: written,
                        bytes_expected,
                    }));
                }
                chunk = body.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk.map_err(|e| TransferError::StreamFailed {
                        url: url.to_string(),
                        source: e,
                    })?;

                    file.write_all(&chunk)
                        .await
                        .map_err(|e| TransferError::FileWriteFailed {
                            path: partial_path.clone(),
                            source: e,
                        })?;
                    hasher.update(&chunk);
                    written += chunk.len() as u64;

                    let _ = self
                        .events
                        .send(TransferEvent::Progress {
                            task_id: self.task_id,
                            bytes_written: written,
                            bytes_expected,
                        })
                        .await;
                }
            }
        }

        flush(&mut file, &partial_path).await?;
        drop(file);

        tokio::fs::rename(&partial_path, &request.destination)
            .await
            .map_err(|e| TransferError::FileWriteFailed {
                path: request.destination.clone(),
                source: e,
            })?;

        Ok(Outcome::Finished {
            path: request.destination.clone(),
            bytes: written,
            content_hash: format!("sha256:{:x}", hasher.finalize()),
        })
    }
}

/// Feed a file through `hasher` in chunks, returning its length
async fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<u64, TransferError> {
    let read_failed = |e| TransferError::FileReadFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).await.map_err(read_failed)?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut total = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(read_failed)?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

async fn flush(file: &mut File, path: &Path) -> Result<(), TransferError> {
    file.flush()
        .await
        .map_err(|e| TransferError::FileWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Where the body of an unfinished transfer lives
pub(crate) fn partial_path_for(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(".partial");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpResponse};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    const DATA_LEN: usize = 100;

    fn audio() -> Vec<u8> {
        (0..DATA_LEN).map(|i| (i % 251) as u8).collect()
    }

    fn sha256_of(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    /// Serves `audio()` in 10-byte chunks. The first request can be made to
    /// stall after `stall_after` bytes.
    #[derive(Clone)]
    struct ScriptedClient {
        status: u16,
        stall_after: Option<usize>,
        honor_range: bool,
        requests: Arc<std::sync::Mutex<Vec<Option<ByteRange>>>>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                status: 200,
                stall_after: None,
                honor_range: true,
                requests: Arc::new(std::sync::Mutex::new(Vec::new())),
            }
        }

        fn requests(&self) -> Vec<Option<ByteRange>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn get_bytes(&self, _url: &str) -> Result<Bytes, reqwest::Error> {
            Ok(Bytes::from(audio()))
        }

        async fn get_stream(
            &self,
            _url: &str,
            range: Option<&ByteRange>,
        ) -> Result<HttpResponse, reqwest::Error> {
            let nth = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(range.cloned());
                requests.len()
            };

            if self.status >= 400 {
                return Ok(HttpResponse {
                    status: self.status,
                    content_length: None,
                    etag: None,
                    body: Box::pin(futures::stream::empty::<Result<Bytes, reqwest::Error>>()),
                });
            }

            let start = match range {
                Some(range) if self.honor_range => range.start as usize,
                _ => 0,
            };
            let remaining = audio()[start..].to_vec();
            let chunks: Vec<Result<Bytes, reqwest::Error>> = remaining
                .chunks(10)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let body: ByteStream = match self.stall_after {
                Some(n) if nth == 1 => Box::pin(
                    futures::stream::iter(chunks.into_iter().take(n / 10))
                        .chain(futures::stream::pending()),
                ),
                _ => Box::pin(futures::stream::iter(chunks)),
            };

            Ok(HttpResponse {
                status: if start > 0 { 206 } else { 200 },
                content_length: Some(remaining.len() as u64),
                etag: Some("\"v1\"".to_string()),
                body,
            })
        }
    }

    fn request(dir: &Path, resume_token: Option<ResumeToken>) -> TransferRequest {
        TransferRequest {
            url: Url::parse("https://example.com/ep.mp3").unwrap(),
            destination: dir.join("ep.mp3"),
            resume_token,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transfer event")
            .expect("event channel closed")
    }

    async fn wait_for_terminal(rx: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        loop {
            let event = next_event(rx).await;
            if !matches!(event, TransferEvent::Progress { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn transfer_writes_file_and_reports_progress() {
        let dir = tempdir().unwrap();
        let (session, mut rx) = HttpTransferSession::new(ScriptedClient::new(), 5);

        let task_id = session.start(request(dir.path(), None)).await.unwrap();
        assert_eq!(task_id, TaskId(1));

        let first = next_event(&mut rx).await;
        assert_eq!(
            first,
            TransferEvent::Progress {
                task_id,
                bytes_written: 10,
                bytes_expected: Some(100),
            }
        );

        match wait_for_terminal(&mut rx).await {
            TransferEvent::Finished {
                path,
                bytes,
                content_hash,
                ..
            } => {
                assert_eq!(bytes, 100);
                assert_eq!(std::fs::read(&path).unwrap(), audio());
                assert_eq!(content_hash, Some(sha256_of(&audio())));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert!(!partial_path_for(&dir.path().join("ep.mp3")).exists());
        assert_eq!(session.running_count().await, 0);
    }

    #[tokio::test]
    async fn http_error_reports_failure() {
        let dir = tempdir().unwrap();
        let client = ScriptedClient {
            status: 404,
            ..ScriptedClient::new()
        };
        let (session, mut rx) = HttpTransferSession::new(client, 5);

        session.start(request(dir.path(), None)).await.unwrap();

        match next_event(&mut rx).await {
            TransferEvent::Failed { reason, .. } => assert!(reason.contains("404")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(!dir.path().join("ep.mp3").exists());
    }

    #[tokio::test]
    async fn cancel_then_resume_continues_with_range() {
        let dir = tempdir().unwrap();
        let client = ScriptedClient {
            stall_after: Some(30),
            ..ScriptedClient::new()
        };
        let (session, mut rx) = HttpTransferSession::new(client.clone(), 5);

        let first = session.start(request(dir.path(), None)).await.unwrap();
        loop {
            if let TransferEvent::Progress { bytes_written: 30, .. } = next_event(&mut rx).await {
                break;
            }
        }

        let outcome = session.cancel(first).await.unwrap();
        assert_eq!(outcome.bytes_received, 30);
        assert_eq!(outcome.bytes_expected, Some(100));
        let token = outcome.resume_token.expect("resume token after 30 bytes");
        assert_eq!(
            std::fs::read(partial_path_for(&dir.path().join("ep.mp3")))
                .unwrap()
                .len(),
            30
        );

        let second = session
            .start(request(dir.path(), Some(token)))
            .await
            .unwrap();
        assert_ne!(first, second);

        match wait_for_terminal(&mut rx).await {
            TransferEvent::Finished {
                task_id,
                bytes,
                path,
                content_hash,
            } => {
                assert_eq!(task_id, second);
                assert_eq!(bytes, 100);
                assert_eq!(std::fs::read(path).unwrap(), audio());
                assert_eq!(content_hash, Some(sha256_of(&audio())));
            }
            other => panic!("expected Finished, got {other:?}"),
        }

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1],
            Some(ByteRange {
                start: 30,
                if_range: Some("\"v1\"".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn resume_restarts_when_server_ignores_range() {
        let dir = tempdir().unwrap();
        let client = ScriptedClient {
            stall_after: Some(30),
            honor_range: false,
            ..ScriptedClient::new()
        };
        let (session, mut rx) = HttpTransferSession::new(client, 5);

        let first = session.start(request(dir.path(), None)).await.unwrap();
        loop {
            if let TransferEvent::Progress { bytes_written: 30, .. } = next_event(&mut rx).await {
                break;
            }
        }
        let token = session.cancel(first).await.unwrap().resume_token.unwrap();

        session
            .start(request(dir.path(), Some(token)))
            .await
            .unwrap();

        match wait_for_terminal(&mut rx).await {
            TransferEvent::Finished { bytes, path, .. } => {
                assert_eq!(bytes, 100);
                assert_eq!(std::fs::read(path).unwrap(), audio());
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_restarts_when_partial_file_changed() {
        let dir = tempdir().unwrap();
        let client = ScriptedClient {
            stall_after: Some(30),
            ..ScriptedClient::new()
        };
        let (session, mut rx) = HttpTransferSession::new(client.clone(), 5);

        let first = session.start(request(dir.path(), None)).await.unwrap();
        loop {
            if let TransferEvent::Progress { bytes_written: 30, .. } = next_event(&mut rx).await {
                break;
            }
        }
        let token = session.cancel(first).await.unwrap().resume_token.unwrap();

        // Appending at offset 30 onto 20 bytes would corrupt the file
        let partial = partial_path_for(&dir.path().join("ep.mp3"));
        std::fs::write(&partial, &audio()[..20]).unwrap();

        session
            .start(request(dir.path(), Some(token)))
            .await
            .unwrap();

        match wait_for_terminal(&mut rx).await {
            TransferEvent::Finished {
                bytes,
                path,
                content_hash,
                ..
            } => {
                assert_eq!(bytes, 100);
                assert_eq!(std::fs::read(path).unwrap(), audio());
                assert_eq!(content_hash, Some(sha256_of(&audio())));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(client.requests(), vec![None, None]);
    }

    #[tokio::test]
    async fn hash_file_streams_in_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.partial");
        let data: Vec<u8> = (0..HASH_CHUNK_SIZE * 2 + 17).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut hasher = Sha256::new();
        let len = hash_file(&path, &mut hasher).await.unwrap();

        assert_eq!(len, data.len() as u64);
        assert_eq!(format!("sha256:{:x}", hasher.finalize()), sha256_of(&data));
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_none() {
        let (session, _rx) = HttpTransferSession::new(ScriptedClient::new(), 5);
        assert!(session.cancel(TaskId(42)).await.is_none());
    }

    #[tokio::test]
    async fn garbage_resume_token_is_rejected() {
        let dir = tempdir().unwrap();
        let (session, _rx) = HttpTransferSession::new(ScriptedClient::new(), 5);

        let result = session
            .start(request(dir.path(), Some(ResumeToken::new(b"XYZ".to_vec()))))
            .await;
        assert!(matches!(result, Err(TransferError::InvalidResumeToken(_))));
    }

    #[tokio::test]
    async fn transfers_beyond_limit_wait_for_a_slot() {
        let dir = tempdir().unwrap();
        let client = ScriptedClient {
            stall_after: Some(10),
            ..ScriptedClient::new()
        };
        let (session, mut rx) = HttpTransferSession::new(client.clone(), 1);
        assert_eq!(session.max_concurrent(), 1);

        let first = session.start(request(dir.path(), None)).await.unwrap();
        let second_dir = dir.path().join("second");
        let second = session.start(request(&second_dir, None)).await.unwrap();

        // First transfer stalls holding the only slot
        next_event(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.requests().len(), 1);

        // Canceling a queued transfer never touches the network
        let queued = session.cancel(second).await.unwrap();
        assert_eq!(queued.bytes_received, 0);
        assert!(queued.resume_token.is_none());

        session.cancel(first).await.unwrap();
        assert_eq!(client.requests().len(), 1);
        assert_eq!(session.running_count().await, 0);
    }
}
