#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use facekyc_core::errors::{AppError, AppResult};
use facekyc_core::faces::{
    ContentId, ContentStore, Embedding, MemoryContentStore, MemoryUserRegistry, ServiceSettings,
    UserData, UserRecord, UserRegistry, VerificationService,
};
use facekyc_core::secret::SecretKey;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_test_writer()
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised by another test in this binary.
    }
}

pub fn embedding(values: &[f64]) -> Embedding {
    Embedding::new(values.to_vec()).unwrap()
}

pub fn user_data(name: &str) -> UserData {
    let mut data = UserData::new();
    data.insert("name".into(), json!(name));
    data
}

pub async fn service_with(
    secret: &str,
    store: Arc<dyn ContentStore>,
    registry: Arc<dyn UserRegistry>,
    settings: ServiceSettings,
) -> VerificationService {
    init_tracing();
    let key = SecretKey::from_passphrase(secret).unwrap();
    VerificationService::connect(&key, store, registry, settings)
        .await
        .unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryContentStore>,
    pub registry: Arc<MemoryUserRegistry>,
    pub service: VerificationService,
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryContentStore::new());
    let registry = Arc::new(MemoryUserRegistry::new());
    let service = service_with(
        "integration-secret",
        store.clone(),
        registry.clone(),
        ServiceSettings::default(),
    )
    .await;
    Harness {
        store,
        registry,
        service,
    }
}

/// Delegates to a memory store after sleeping on every call.
#[derive(Default)]
pub struct SlowStore {
    pub inner: MemoryContentStore,
    pub delay: Duration,
    pub puts: AtomicUsize,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ContentStore for SlowStore {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId> {
        tokio::time::sleep(self.delay).await;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(bytes).await
    }

    async fn get(&self, cid: &ContentId) -> AppResult<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(cid).await
    }
}

/// Never answers `get`; `put` behaves normally.
#[derive(Default)]
pub struct HangingStore {
    pub inner: MemoryContentStore,
}

#[async_trait]
impl ContentStore for HangingStore {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId> {
        self.inner.put(bytes).await
    }

    async fn get(&self, _cid: &ContentId) -> AppResult<Vec<u8>> {
        std::future::pending().await
    }
}

/// Rejects every upload as a transport failure.
#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl ContentStore for FailingStore {
    async fn put(&self, _bytes: Vec<u8>) -> AppResult<ContentId> {
        Err(AppError::StorageUnavailable("connection refused".into()))
    }

    async fn get(&self, _cid: &ContentId) -> AppResult<Vec<u8>> {
        Err(AppError::StorageUnavailable("connection refused".into()))
    }
}

/// Fails the reachability probe.
pub struct UnreachableStore;

#[async_trait]
impl ContentStore for UnreachableStore {
    async fn put(&self, _bytes: Vec<u8>) -> AppResult<ContentId> {
        Err(AppError::StorageUnavailable("no route to host".into()))
    }

    async fn get(&self, _cid: &ContentId) -> AppResult<Vec<u8>> {
        Err(AppError::StorageUnavailable("no route to host".into()))
    }

    async fn check(&self) -> AppResult<()> {
        Err(AppError::StorageUnavailable("no route to host".into()))
    }
}

/// Cancels `token` the first time a blob is fetched.
pub struct CancellingStore {
    pub inner: Arc<MemoryContentStore>,
    pub token: CancellationToken,
    pub gets: AtomicUsize,
}

#[async_trait]
impl ContentStore for CancellingStore {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId> {
        self.inner.put(bytes).await
    }

    async fn get(&self, cid: &ContentId) -> AppResult<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        self.inner.get(cid).await
    }
}

/// Memory registry whose mutations block the calling thread, like an fsync.
#[derive(Default)]
pub struct SlowRegistry {
    pub inner: MemoryUserRegistry,
    pub delay: Duration,
}

impl SlowRegistry {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

impl UserRegistry for SlowRegistry {
    fn register(&self, user_id: &str, record: UserRecord) -> AppResult<()> {
        std::thread::sleep(self.delay);
        self.inner.register(user_id, record)
    }

    fn get(&self, user_id: &str) -> AppResult<UserRecord> {
        self.inner.get(user_id)
    }

    fn update(
        &self,
        user_id: &str,
        mutation: &mut dyn FnMut(&mut UserRecord),
    ) -> AppResult<UserRecord> {
        std::thread::sleep(self.delay);
        self.inner.update(user_id, mutation)
    }

    fn list(&self) -> AppResult<Vec<(String, UserRecord)>> {
        self.inner.list()
    }
}
