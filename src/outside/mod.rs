mod command;
mod ffmpeg;
pub mod process;
mod ytdl;

pub use ffmpeg::{Ffmpeg, MediaInspector};
pub use process::{ProcessEvent, ProcessHandle, StopSignal};
pub use ytdl::{Downloader, LaunchRequest, Ytdl};
