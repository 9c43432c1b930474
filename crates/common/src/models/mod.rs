pub mod event;
pub mod person;
pub mod stream;

pub use event::{DetectionEvent, Event, EventQuery, FrameTask};
pub use person::{Collection, FaceEmbedding, FaceMatch, Person};
pub use stream::{Stream, StreamCommand, StreamMode, StreamStatus, StreamType};
