//! SharedStream - カメラごとの単一キャプチャ多重化
//!
//! ## 目的
//!
//! - 同一カメラへの多重デバイスオープンを防止
//! - キャプチャループはカメラごとに1スレッドのみ
//! - 最新フレームのみ保持（1スロット）、任意数のコンシューマへ配布
//! - 連続失敗時はループ停止、次回acquireで再起動
//! - 最終フレームが health_window より古いストリームは「フレームなし」扱い、
//!   次回acquireで差し替え

use crate::frame_source::{CaptureBackend, Frame};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// 連続失敗の上限（これを超えるとループ停止）
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// 失敗時のバックオフ（100ms）
const DEFAULT_FAILURE_BACKOFF_MS: u64 = 100;

/// 最終フレームからこの時間以内なら healthy（5秒）
const DEFAULT_HEALTH_WINDOW_MS: u64 = 5000;

/// wait_for_frame のポーリング間隔と回数（100ms x 50 = 5秒）
const DEFAULT_WAIT_POLL_MS: u64 = 100;
const DEFAULT_WAIT_ATTEMPTS: u32 = 50;

/// キャプチャループ設定
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_consecutive_failures: u32,
    pub failure_backoff: Duration,
    pub health_window: Duration,
    pub wait_poll: Duration,
    pub wait_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            failure_backoff: Duration::from_millis(DEFAULT_FAILURE_BACKOFF_MS),
            health_window: Duration::from_millis(DEFAULT_HEALTH_WINDOW_MS),
            wait_poll: Duration::from_millis(DEFAULT_WAIT_POLL_MS),
            wait_attempts: DEFAULT_WAIT_ATTEMPTS,
        }
    }
}

/// ストリーム状態（/api/cameras/:id のレスポンスにも含める）
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub frame_count: u64,
    /// 最終フレーム時刻（epoch秒）
    pub last_frame_at: Option<f64>,
    pub has_frame: bool,
    pub is_running: bool,
    pub is_healthy: bool,
}

/// カメラ1台分の共有ストリーム
pub struct SharedStream {
    camera_id: String,
    source: String,
    /// 最新フレーム（Arcの差し替え/複製の間だけロック）
    latest: Mutex<Option<Frame>>,
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    frame_count: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl SharedStream {
    fn new(camera_id: &str, source: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            source: source.to_string(),
            latest: Mutex::new(None),
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            frame_count: AtomicU64::new(0),
            thread: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// 最新フレームを取得（ノンブロッキング）
    pub fn read(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// キャプチャスレッドが終了済みか
    fn thread_finished(&self) -> bool {
        match self.thread.lock() {
            Ok(guard) => guard.as_ref().map(|h| h.is_finished()).unwrap_or(true),
            Err(_) => true,
        }
    }

    /// 最新フレームが window 内のものなら返す
    fn read_fresh(&self, window: Duration) -> Option<Frame> {
        self.read().filter(|frame| is_fresh(frame, window))
    }

    /// 稼働中だが window 内にフレームが届いていない
    fn is_stale(&self, window: Duration) -> bool {
        match self.read() {
            Some(frame) => !is_fresh(&frame, window),
            None => self.started_at.elapsed() >= window,
        }
    }

    /// そのまま再利用できるか
    fn is_reusable(&self, source: &str, window: Duration) -> bool {
        self.is_running() && !self.thread_finished() && self.source == source && !self.is_stale(window)
    }

    /// ループ停止を要求（スレッドは次の読み取り後に終了）
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            guard.take();
        }
    }

    fn store_frame(&self, frame: Frame) {
        if let Ok(mut slot) = self.latest.lock() {
            *slot = Some(frame);
        }
    }

    /// 健全性
    pub fn health(&self, window: Duration) -> StreamHealth {
        let latest = self.read();
        let is_running = self.is_running();
        let last_frame_at = latest.as_ref().map(|f| f.captured_at);
        let is_healthy = is_running && latest.as_ref().map(|f| is_fresh(f, window)).unwrap_or(false);

        StreamHealth {
            frame_count: self.frame_count(),
            last_frame_at: last_frame_at.map(|at| at.timestamp_millis() as f64 / 1000.0),
            has_frame: latest.is_some(),
            is_running,
            is_healthy,
        }
    }
}

/// 撮影から window 未満か（時計の逆行は新しい扱い）
fn is_fresh(frame: &Frame, window: Duration) -> bool {
    (Utc::now() - frame.captured_at)
        .to_std()
        .map(|age| age < window)
        .unwrap_or(true)
}

/// キャプチャループ本体（専用OSスレッドで実行）
fn capture_loop(stream: Arc<SharedStream>, backend: Arc<dyn CaptureBackend>, config: StreamConfig) {
    let mut device = match backend.open(&stream.source) {
        Ok(device) => device,
        Err(e) => {
            tracing::error!(
                camera_id = %stream.camera_id,
                source = %stream.source,
                error = %e,
                "Failed to open capture device"
            );
            stream.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    tracing::info!(camera_id = %stream.camera_id, "Capture loop started");

    while stream.is_running() {
        match device.read_frame() {
            Ok(frame) => {
                stream.consecutive_failures.store(0, Ordering::SeqCst);
                stream.frame_count.fetch_add(1, Ordering::SeqCst);
                stream.store_frame(frame);
            }
            Err(e) => {
                let failures = stream.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(
                    camera_id = %stream.camera_id,
                    failures = failures,
                    error = %e,
                    "Frame read failed"
                );
                if failures >= config.max_consecutive_failures {
                    tracing::error!(
                        camera_id = %stream.camera_id,
                        failures = failures,
                        "Too many consecutive failures, stopping capture"
                    );
                    break;
                }
                std::thread::sleep(config.failure_backoff);
            }
        }
    }

    stream.running.store(false, Ordering::SeqCst);
    tracing::info!(camera_id = %stream.camera_id, "Capture loop stopped");
}

/// SharedStreamManager - カメラIDごとに共有ストリームを管理
pub struct SharedStreamManager {
    backend: Arc<dyn CaptureBackend>,
    streams: RwLock<HashMap<String, Arc<SharedStream>>>,
    config: StreamConfig,
}

impl SharedStreamManager {
    /// 新規作成
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self::with_config(backend, StreamConfig::default())
    }

    /// 設定を指定して作成
    pub fn with_config(backend: Arc<dyn CaptureBackend>, config: StreamConfig) -> Self {
        Self {
            backend,
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 稼働中のストリームを取得（なければ/停止済み/不健全なら起動）
    pub async fn acquire(&self, camera_id: &str, source: &str) -> Arc<SharedStream> {
        let window = self.config.health_window;

        // 読み取りロックでまず確認
        {
            let streams = self.streams.read().await;
            if let Some(stream) = streams.get(camera_id) {
                if stream.is_reusable(source, window) {
                    return stream.clone();
                }
            }
        }

        // 書き込みロックで再確認してから起動
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(camera_id) {
            if existing.is_reusable(source, window) {
                return existing.clone();
            }
            if existing.is_running() && existing.is_stale(window) {
                tracing::warn!(
                    camera_id = %camera_id,
                    frame_count = existing.frame_count(),
                    "No fresh frames, replacing stalled stream"
                );
            }
            existing.stop();
        }

        let stream = Arc::new(SharedStream::new(camera_id, source));
        stream.running.store(true, Ordering::SeqCst);

        let handle = {
            let stream = stream.clone();
            let backend = self.backend.clone();
            let config = self.config.clone();
            std::thread::Builder::new()
                .name(format!("capture-{}", camera_id))
                .spawn(move || capture_loop(stream, backend, config))
        };

        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = stream.thread.lock() {
                    *slot = Some(handle);
                }
            }
            Err(e) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Failed to spawn capture thread");
                stream.running.store(false, Ordering::SeqCst);
            }
        }

        tracing::debug!(camera_id = %camera_id, source = %source, "Shared stream acquired");
        streams.insert(camera_id.to_string(), stream.clone());
        stream
    }

    /// 登録済みストリームを取得（起動はしない）
    pub async fn get(&self, camera_id: &str) -> Option<Arc<SharedStream>> {
        self.streams.read().await.get(camera_id).cloned()
    }

    /// 新しいフレームが得られるまで待機（最大 wait_poll x wait_attempts）
    ///
    /// health_window より古いフレームは返さない。ストリームが停止したら即None
    pub async fn wait_for_frame(&self, camera_id: &str, source: &str) -> Option<Frame> {
        let window = self.config.health_window;
        let stream = self.acquire(camera_id, source).await;
        for _ in 0..self.config.wait_attempts {
            if let Some(frame) = stream.read_fresh(window) {
                return Some(frame);
            }
            if !stream.is_running() {
                return None;
            }
            tokio::time::sleep(self.config.wait_poll).await;
        }
        stream.read_fresh(window)
    }

    /// ストリーム解放
    pub async fn release(&self, camera_id: &str) {
        if let Some(stream) = self.streams.write().await.remove(camera_id) {
            stream.stop();
            tracing::debug!(camera_id = %camera_id, "Shared stream released");
        }
    }

    /// 全ストリーム解放（シャットダウン時）
    pub async fn release_all(&self) {
        let mut streams = self.streams.write().await;
        for (_, stream) in streams.drain() {
            stream.stop();
        }
        tracing::info!("All shared streams released");
    }

    /// 健全性（未登録ならNone）
    pub async fn health(&self, camera_id: &str) -> Option<StreamHealth> {
        self.streams
            .read()
            .await
            .get(camera_id)
            .map(|s| s.health(self.config.health_window))
    }

    /// 登録済みストリーム数（デバッグ用）
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}
