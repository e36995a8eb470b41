// Veera Core — streaming engine for the Veera AI chat client
// Library root. An embedder opens a SessionStore, picks a RemoteClient
// (GeminiClient in production, anything implementing the trait in tests),
// starts turns, and renders the ChatEvent stream.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use engine::providers::{EventStream, GeminiClient, RemoteClient};
pub use engine::sessions::{BlobStore, FileBlobStore, MemoryBlobStore, SessionStore};
pub use engine::turn::{start_turn, start_turn_paced, TurnHandle, TurnInput};
pub use engine::types::{
    ChatEvent, ChatSession, ChatSettings, GroundingSource, ImageAttachment, Message,
    MessagePart, ModelInfo, Role, StreamEvent, TurnPhase, MODEL_CATALOG,
};
