// SPDX-License-Identifier: GPL-2.0-or-later

use async_trait::async_trait;
use common::{time::Duration, ArcConfigProvider, ArcMsgLogger, LogLevel, StreamRequest};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub type DynAsyncCall = Box<dyn AsyncCall>;

/// A deferred callback executed by the worker, off the media path. Tasks
/// capture everything they need by value at creation time.
#[async_trait]
pub trait AsyncCall: Send {
    async fn call(&self) -> Result<(), HookError>;
    fn name(&self) -> String;
}

// Overflowing tasks are dropped oldest-first.
const QUEUE_LIMIT: usize = 128;

const STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Single worker executing queued calls in FIFO order.
pub struct AsyncCallWorker {
    logger: ArcMsgLogger,
    queue: Arc<Mutex<VecDeque<DynAsyncCall>>>,
    notify: Arc<Notify>,
    token: Option<CancellationToken>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl AsyncCallWorker {
    #[must_use]
    pub fn new(logger: ArcMsgLogger) -> Self {
        Self {
            logger,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            token: None,
            handle: None,
        }
    }

    /// Spawns the worker task. Starting a started worker is a no-op.
    pub fn start(&mut self) {
        if self.token.is_some() {
            return;
        }
        let token = CancellationToken::new();
        self.handle = Some(tokio::spawn(run_worker(
            token.clone(),
            self.queue.clone(),
            self.notify.clone(),
            self.logger.clone(),
        )));
        self.token = Some(token);
    }

    /// Enqueues a call. The queue is bounded; when full the oldest pending
    /// call is dropped and logged.
    pub fn execute(&self, task: DynAsyncCall) -> Result<(), ExecuteError> {
        if self.token.is_none() {
            return Err(ExecuteError::NotRunning);
        }

        let mut queue = self.queue.lock().expect("not poisoned");
        if queue.len() >= QUEUE_LIMIT {
            if let Some(dropped) = queue.pop_front() {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("hook queue full, dropping {}", dropped.name()),
                );
            }
        }
        queue.push_back(task);
        drop(queue);

        self.notify.notify_one();
        Ok(())
    }

    /// Cancels the worker and waits for pending calls to drain, bounded by a
    /// timeout. Stopping a stopped worker is a no-op.
    pub async fn stop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        token.cancel();

        let Some(handle) = self.handle.take() else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
            self.logger
                .log(LogLevel::Warning, "hook worker did not drain in time");
            abort.abort();
        }
    }
}

async fn run_worker(
    token: CancellationToken,
    queue: Arc<Mutex<VecDeque<DynAsyncCall>>>,
    notify: Arc<Notify>,
    logger: ArcMsgLogger,
) {
    let next = || queue.lock().expect("not poisoned").pop_front();
    loop {
        while let Some(task) = next() {
            if let Err(e) = task.call().await {
                logger.log(LogLevel::Warning, &format!("{}: {e}", task.name()));
            }
        }

        tokio::select! {
            () = token.cancelled() => {
                // Cancelled, drain what is left and exit.
                while let Some(task) = next() {
                    if let Err(e) = task.call().await {
                        logger.log(LogLevel::Warning, &format!("{}: {e}", task.name()));
                    }
                }
                return;
            }
            () = notify.notified() => {}
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("worker is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status {0} from '{1}'")]
    Status(reqwest::StatusCode, String),

    #[error("callback '{0}': {1}")]
    Callback(String, Box<HookError>),
}

/// HTTP transport shared by all hook calls of one stream.
pub struct HttpHooks {
    config: ArcConfigProvider,
    client: reqwest::Client,
}

impl HttpHooks {
    #[must_use]
    pub fn new(config: ArcConfigProvider) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { config, client }
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response, HookError> {
        let res = self.client.post(url).json(body).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(HookError::Status(status, url.to_owned()));
        }
        Ok(res)
    }
}

/// The `on_hls` callback, fired once per published segment.
pub struct OnHlsCall {
    pub hooks: Arc<HttpHooks>,
    pub req: StreamRequest,
    /// Final path of the segment file.
    pub path: String,
    pub ts_url: String,
    pub m3u8: String,
    pub m3u8_url: String,
    pub seq_no: u64,
    pub duration: Duration,
}

#[async_trait]
impl AsyncCall for OnHlsCall {
    async fn call(&self) -> Result<(), HookError> {
        // Hook urls are read at execution time, they may have been reloaded
        // since the segment closed.
        let conf = self.hooks.config.hooks(&self.req.vhost);
        if !conf.enabled {
            return Ok(());
        }

        let body = serde_json::json!({
            "action": "on_hls",
            "client_id": self.req.client_id,
            "ip": self.req.ip,
            "vhost": self.req.vhost,
            "app": self.req.app,
            "stream": self.req.stream,
            "param": self.req.param,
            "duration": self.duration.as_secs_f64(),
            "cwd": std::env::current_dir().unwrap_or_default().to_string_lossy(),
            "file": self.path,
            "url": self.ts_url,
            "seq_no": self.seq_no,
            "m3u8": self.m3u8,
            "m3u8_url": self.m3u8_url,
        });

        for url in &conf.on_hls {
            if let Err(e) = self.hooks.post(url, &body).await {
                return Err(HookError::Callback(url.clone(), Box::new(e)));
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("on_hls: {}", self.path)
    }
}

/// The `on_hls_notify` callback, a lightweight per-segment ping.
pub struct OnHlsNotifyCall {
    pub hooks: Arc<HttpHooks>,
    pub req: StreamRequest,
    pub ts_url: String,
    /// Cap on how much of the endpoint's response is read.
    pub nb_notify: usize,
}

#[async_trait]
impl AsyncCall for OnHlsNotifyCall {
    async fn call(&self) -> Result<(), HookError> {
        let conf = self.hooks.config.hooks(&self.req.vhost);
        if !conf.enabled {
            return Ok(());
        }

        let body = serde_json::json!({
            "action": "on_hls_notify",
            "client_id": self.req.client_id,
            "vhost": self.req.vhost,
            "app": self.req.app,
            "stream": self.req.stream,
            "param": self.req.param,
            "ts_url": self.ts_url,
        });

        for url in &conf.on_hls_notify {
            match self.hooks.post(url, &body).await {
                Ok(mut res) => {
                    let mut read = 0;
                    while let Ok(Some(chunk)) = res.chunk().await {
                        read += chunk.len();
                        if read >= self.nb_notify {
                            break;
                        }
                    }
                }
                Err(e) => return Err(HookError::Callback(url.clone(), Box::new(e))),
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("on_hls_notify: {}", self.ts_url)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::MsgLogger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestLogger;
    impl MsgLogger for TestLogger {
        fn log(&self, _: LogLevel, _: &str) {}
    }

    struct CountedCall {
        counter: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
    }

    #[async_trait]
    impl AsyncCall for CountedCall {
        async fn call(&self) -> Result<(), HookError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.id);
            Ok(())
        }

        fn name(&self) -> String {
            format!("counted: {}", self.id)
        }
    }

    #[tokio::test]
    async fn test_worker_fifo() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut worker = AsyncCallWorker::new(Arc::new(TestLogger));
        worker.start();

        for id in 0..5 {
            worker
                .execute(Box::new(CountedCall {
                    counter: counter.clone(),
                    order: order.clone(),
                    id,
                }))
                .unwrap();
        }
        worker.stop().await;

        assert_eq!(5, counter.load(Ordering::SeqCst));
        assert_eq!(vec![0, 1, 2, 3, 4], *order.lock().unwrap());
    }

    #[tokio::test]
    async fn test_execute_before_start() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let worker = AsyncCallWorker::new(Arc::new(TestLogger));
        let res = worker.execute(Box::new(CountedCall {
            counter,
            order,
            id: 0,
        }));
        assert!(matches!(res, Err(ExecuteError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let mut worker = AsyncCallWorker::new(Arc::new(TestLogger));
        worker.start();
        worker.stop().await;
        worker.stop().await;
    }
}
