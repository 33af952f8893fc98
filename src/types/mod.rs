mod container;
mod media;
mod metadata;
mod progress;
mod rate;
mod record;

pub use container::Container;
pub use media::MediaInfo;
pub use metadata::Metadata;
pub use progress::Progress;
pub use rate::{ByteSize, TransferRate};
pub use record::{now_millis, JobRecord, Playlist, Status};
