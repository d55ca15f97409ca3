pub mod cipher;
pub mod comparer;
pub mod embedding;
pub mod locks;
pub mod registry;
pub mod service;
pub mod store;

pub use cipher::{EmbeddingPayload, EncryptedBlob, Metadata, VectorCipher};

pub use comparer::{compare, cosine_similarity, Similarity};

pub use embedding::{Embedding, Threshold, DEFAULT_THRESHOLD};

pub use locks::{UserLockGuard, UserLocks};

pub use registry::{
    read_registry_document, validate_user_id, write_registry_document, FileUserRegistry,
    MemoryUserRegistry, RegistryDocument, UserData, UserRecord, UserRegistry,
};

pub use service::{
    sort_matches, FaceMatch, FindOutcome, RegistrationOutcome, ServiceSettings, SkippedUser,
    UpdateOutcome, VerificationOutcome, VerificationService,
};

pub use store::{ContentId, ContentStore, FilesystemContentStore, MemoryContentStore};
