//! REST backend: sessions, speech synthesis and the request transport they share.

pub mod http;
pub mod session;
pub mod speech;
pub mod transport;
pub mod types;

pub use http::{ReqwestTransport, StaticToken, TokenProvider};
pub use session::{MockSessionApi, RestSessionApi, SessionApi, SessionOp};
pub use speech::{MockSpeechApi, RestSpeechApi, SpeechApi};
pub use transport::{
    ApiRequest, ApiResponse, Method, MockRequestTransport, RequestBody, RequestTransport,
};
pub use types::{AssessmentReport, CompletionSummary, Scenario, VoiceParams, VoiceProfile};
