//! Idempotency
//!
//! Provides the pieces that let the bridge tell "already done" apart from
//! "failed":
//! - Classifier: benign vs. real RPC errors
//! - Token cache: attachment tokens from controller-level publishes
//! - Resolver: publish-state questions answered from remote and host state
//! - Interceptor: a client wrapper that skips already-satisfied RPCs

pub mod classifier;
pub mod interceptor;
pub mod resolver;
pub mod tokens;

pub use classifier::{classify, classify_rpc, Classification};
pub use interceptor::IdempotentClient;
pub use resolver::{ControllerPublishState, IdempotencyResolver, ResolverConfig, BIND_PSEUDO_DEVICE};
pub use tokens::PublishTokenCache;
