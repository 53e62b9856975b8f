//! HTTP fetch utilities and the Cache/Store gateway for the ingestion pipeline.

mod cache;
mod gateway;
mod http;
mod memory;
mod postgres;
mod store;

pub use cache::{ArticleView, ReadCache};
pub use gateway::StoreGateway;
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchMethod, FetchRequest,
    FetchedResponse, HttpClientConfig, HttpFetcher, RequestPolicy, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    ArticleRevision, ArticleStore, ArticleWrite, SnapshotEntry, SourceSnapshot, StoreError, WriteOutcome,
};

pub const CRATE_NAME: &str = "newsagg-storage";
