pub mod converter;
pub mod models;
pub mod provider;
pub mod reliable;
pub mod sse;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use provider::{OpenAiProvider, ProviderConfig};
pub use reliable::{RetryPolicy, StreamingClient};
