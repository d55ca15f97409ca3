use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use facekyc_config::ResolvedConfig;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, ErrorKind};
use crate::faces::cipher::{EmbeddingPayload, EncryptedBlob, Metadata, VectorCipher};
use crate::faces::comparer::{compare, Similarity};
use crate::faces::embedding::{Embedding, Threshold};
use crate::faces::locks::UserLocks;
use crate::faces::registry::{
    timestamp_now, validate_user_id, FileUserRegistry, UserData, UserRecord, UserRegistry,
};
use crate::faces::store::{ContentId, ContentStore, FilesystemContentStore};
use crate::response::ErrorDetail;
use crate::secret::SecretKey;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub default_threshold: Threshold,
    pub store_timeout: Duration,
    pub find_concurrency: usize,
}

impl ServiceSettings {
    pub fn from_config(config: &ResolvedConfig) -> AppResult<Self> {
        let default_threshold = Threshold::new(config.similarity_threshold)
            .map_err(|err| AppError::Config(format!("similarity_threshold: {err}")))?;
        Ok(Self {
            default_threshold,
            store_timeout: config.store_timeout,
            find_concurrency: config.find_concurrency,
        })
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_threshold: Threshold::default(),
            store_timeout: Duration::from_millis(facekyc_config::DEFAULT_STORE_TIMEOUT_MILLIS),
            find_concurrency: facekyc_config::DEFAULT_FIND_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub user_id: String,
    pub cid: ContentId,
    pub registered_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub user_id: String,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub threshold: f64,
    /// Set when the stored embedding could not be compared at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub user_id: String,
    pub cid: ContentId,
    pub previous_cid: ContentId,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceMatch {
    pub user_id: String,
    pub similarity: f64,
    pub user_data: UserData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedUser {
    pub user_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOutcome {
    pub found: bool,
    pub matches: Vec<FaceMatch>,
    pub best_match: Option<FaceMatch>,
    pub threshold: f64,
    pub scanned: usize,
    pub skipped: Vec<SkippedUser>,
    pub cancelled: bool,
}

/// Entry point for registering, re-verifying and identifying users by
/// face embedding.
pub struct VerificationService {
    cipher: VectorCipher,
    store: Arc<dyn ContentStore>,
    registry: Arc<dyn UserRegistry>,
    settings: ServiceSettings,
    locks: UserLocks,
}

impl VerificationService {
    /// Builds the service and probes the content store once. A missing key
    /// or an unreachable store is a configuration error. A `find_concurrency`
    /// of zero is raised to one.
    pub async fn connect(
        key: &SecretKey,
        store: Arc<dyn ContentStore>,
        registry: Arc<dyn UserRegistry>,
        mut settings: ServiceSettings,
    ) -> AppResult<Self> {
        let cipher = VectorCipher::new(key)?;
        settings.find_concurrency = settings.find_concurrency.max(1);
        let service = Self {
            cipher,
            store,
            registry,
            settings,
            locks: UserLocks::new(),
        };

        service
            .with_timeout("check", service.store.check())
            .await
            .map_err(|err| AppError::Config(format!("content store unreachable: {err}")))?;

        debug!(
            threshold = service.settings.default_threshold.value(),
            timeout_ms = service.settings.store_timeout.as_millis() as u64,
            concurrency = service.settings.find_concurrency,
            "verification service ready"
        );
        Ok(service)
    }

    /// Wires the filesystem store and registry named in `config`.
    pub async fn from_config(config: &ResolvedConfig, key: Option<Vec<u8>>) -> AppResult<Self> {
        let key = SecretKey::require(key)?;
        let settings = ServiceSettings::from_config(config)?;
        let store = Arc::new(FilesystemContentStore::new(&config.content_store_dir));
        let registry = Arc::new(FileUserRegistry::open(&config.registry_path)?);
        Self::connect(&key, store, registry, settings).await
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub async fn register_user(
        &self,
        user_id: &str,
        vector: Embedding,
        user_data: UserData,
    ) -> AppResult<RegistrationOutcome> {
        validate_user_id(user_id)?;
        let _guard = self.locks.acquire(user_id).await;

        let user = user_id.to_string();
        if self
            .with_registry(move |registry| registry.contains(&user))
            .await?
        {
            return Err(AppError::UserAlreadyExists {
                user: user_id.to_string(),
            });
        }

        let cid = self.upload(user_id, &vector).await?;
        let record = UserRecord::new(cid.clone(), user_data);
        let registered_at = record.registered_at.clone();
        let user = user_id.to_string();
        if let Err(err) = self
            .with_registry(move |registry| registry.register(&user, record))
            .await
        {
            warn!(user = %user_id, cid = %cid, error = %err, "registry write failed; uploaded blob left orphaned");
            return Err(err);
        }

        info!(user = %user_id, cid = %cid, dimensions = vector.dimension(), "registered user");
        Ok(RegistrationOutcome {
            user_id: user_id.to_string(),
            cid,
            registered_at,
        })
    }

    pub async fn verify_user(
        &self,
        user_id: &str,
        vector: Embedding,
        threshold: Option<f64>,
    ) -> AppResult<VerificationOutcome> {
        validate_user_id(user_id)?;
        let threshold = self.resolve_threshold(threshold)?;
        let user = user_id.to_string();
        let record = self
            .with_registry(move |registry| registry.get(&user))
            .await?;

        match self
            .score_against(&record.current_cid, &vector, threshold)
            .await
        {
            Ok(similarity) => {
                debug!(user = %user_id, score = similarity.score, matched = similarity.matched, "verified user");
                Ok(VerificationOutcome {
                    user_id: user_id.to_string(),
                    verified: similarity.matched,
                    similarity: Some(similarity.score),
                    threshold: threshold.value(),
                    failure: None,
                })
            }
            Err(err) if matches!(err.kind(), ErrorKind::Crypto | ErrorKind::Validation) => {
                warn!(user = %user_id, kind = %err.kind(), error = %err, "stored embedding could not be compared");
                Ok(VerificationOutcome {
                    user_id: user_id.to_string(),
                    verified: false,
                    similarity: None,
                    threshold: threshold.value(),
                    failure: Some(ErrorDetail::from(&err)),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn update_user_face(
        &self,
        user_id: &str,
        vector: Embedding,
    ) -> AppResult<UpdateOutcome> {
        validate_user_id(user_id)?;
        let _guard = self.locks.acquire(user_id).await;

        // Fail before uploading anything for an unknown user.
        let user = user_id.to_string();
        let existing = self
            .with_registry(move |registry| registry.get(&user))
            .await?;

        let cid = self.upload(user_id, &vector).await?;
        let (user, next) = (user_id.to_string(), cid.clone());
        let updated = self
            .with_registry(move |registry| {
                registry.update(&user, &mut |record: &mut UserRecord| {
                    record.rotate(next.clone())
                })
            })
            .await
            .inspect_err(|err| {
                warn!(user = %user_id, cid = %cid, error = %err, "registry update failed; uploaded blob left orphaned");
            })?;

        let previous_cid = updated
            .previous_cid
            .clone()
            .unwrap_or(existing.current_cid);
        let updated_at = updated.updated_at.clone().unwrap_or_else(timestamp_now);

        info!(user = %user_id, cid = %cid, previous = %previous_cid, "updated user face");
        Ok(UpdateOutcome {
            user_id: user_id.to_string(),
            cid,
            previous_cid,
            updated_at,
        })
    }

    pub async fn find_user_by_face(
        &self,
        vector: Embedding,
        threshold: Option<f64>,
    ) -> AppResult<FindOutcome> {
        self.find_user_by_face_with_cancel(vector, threshold, CancellationToken::new())
            .await
    }

    /// Scans every registered user with at most `find_concurrency` fetches
    /// in flight. Once `cancel` fires no further fetches start; those
    /// already running are allowed to finish.
    pub async fn find_user_by_face_with_cancel(
        &self,
        vector: Embedding,
        threshold: Option<f64>,
        cancel: CancellationToken,
    ) -> AppResult<FindOutcome> {
        let threshold = self.resolve_threshold(threshold)?;
        let users = self.with_registry(|registry| registry.list()).await?;
        let total = users.len();
        let probe = &vector;

        let results = stream::iter(users)
            .take_until(cancel.cancelled())
            .map(|(user_id, record)| async move {
                let result = self
                    .score_against(&record.current_cid, probe, threshold)
                    .await;
                (user_id, record, result)
            })
            .buffer_unordered(self.settings.find_concurrency)
            .collect::<Vec<_>>()
            .await;

        let processed = results.len();
        let mut matches = Vec::new();
        let mut skipped = Vec::new();
        let mut scanned = 0;
        for (user_id, record, result) in results {
            match result {
                Ok(similarity) => {
                    scanned += 1;
                    if similarity.matched {
                        matches.push(FaceMatch {
                            user_id,
                            similarity: similarity.score,
                            user_data: record.user_data,
                        });
                    }
                }
                Err(err) => {
                    warn!(user = %user_id, kind = %err.kind(), error = %err, "skipping user during face search");
                    skipped.push(SkippedUser {
                        user_id,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        }

        sort_matches(&mut matches);
        skipped.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let cancelled = processed < total;
        if cancelled {
            warn!(processed, total, "face search cancelled before scanning every user");
        }
        debug!(
            total,
            scanned,
            skipped = skipped.len(),
            matches = matches.len(),
            "face search finished"
        );

        Ok(FindOutcome {
            found: !matches.is_empty(),
            best_match: matches.first().cloned(),
            matches,
            threshold: threshold.value(),
            scanned,
            skipped,
            cancelled,
        })
    }

    pub fn get_user(&self, user_id: &str) -> AppResult<UserRecord> {
        validate_user_id(user_id)?;
        self.registry.get(user_id)
    }

    /// Fetches and decrypts the blob stored under `cid`.
    pub async fn fetch_embedding(&self, cid: &ContentId) -> AppResult<EmbeddingPayload> {
        let bytes = self.with_timeout("get", self.store.get(cid)).await?;
        self.cipher.decrypt(&EncryptedBlob::from_bytes(bytes))
    }

    async fn upload(&self, user_id: &str, vector: &Embedding) -> AppResult<ContentId> {
        let mut metadata = Metadata::new();
        metadata.insert("userId".into(), json!(user_id));
        metadata.insert("timestamp".into(), json!(timestamp_now()));
        metadata.insert("dimensions".into(), json!(vector.dimension()));

        let blob = self.cipher.encrypt(vector, &metadata)?;
        let cid = self
            .with_timeout("put", self.store.put(blob.into_bytes()))
            .await?;
        debug!(user = %user_id, cid = %cid, "uploaded encrypted embedding");
        Ok(cid)
    }

    async fn score_against(
        &self,
        cid: &ContentId,
        probe: &Embedding,
        threshold: Threshold,
    ) -> AppResult<Similarity> {
        let payload = self.fetch_embedding(cid).await?;
        compare(probe.as_slice(), payload.vector.as_slice(), threshold)
    }

    /// Runs `call` on the blocking pool; file-backed registries fsync on
    /// every mutation.
    async fn with_registry<T, F>(&self, call: F) -> AppResult<T>
    where
        F: FnOnce(&dyn UserRegistry) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || call(registry.as_ref()))
            .await
            .map_err(|err| AppError::RegistryTask(err.to_string()))?
    }

    fn resolve_threshold(&self, threshold: Option<f64>) -> AppResult<Threshold> {
        match threshold {
            Some(value) => Threshold::new(value),
            None => Ok(self.settings.default_threshold),
        }
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, call: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let after = self.settings.store_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::StorageTimeout { operation, after }),
        }
    }
}

/// Highest similarity first; equal scores ordered by user id.
pub fn sort_matches(matches: &mut [FaceMatch]) {
    matches.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}
