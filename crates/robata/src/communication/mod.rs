mod event;
mod sequence_stream;

pub use event::{Completion, SequenceEvent, Token};
pub use sequence_stream::SequenceStream;
