// 播放器核心模块

pub mod buffer_pool;
pub mod native;
pub mod state;
pub mod packet_reader;
pub mod decode_dispatcher;
pub mod decode_thread;
pub mod scheduler;
pub mod manager;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_decoder;
#[cfg(feature = "cpal")]
pub mod audio_output;

pub use buffer_pool::{BufferHandle, BufferManager, BufferPool, PlaneBufferPool};
pub use native::{
    AudioConsumed, AudioSink, EnqueueResult, FrameConsumed, FrameStatus, NativeDecoder, PlayerListener,
    ReadPacketResult, VideoSink,
};
pub use state::{PlayerEvent, PlayerState, RendererState};
pub use scheduler::{RenderEvent, RenderObserver, SyncScheduler};
pub use manager::{PlaybackManager, PlayerComponents};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_decoder::FfmpegDecoder;
#[cfg(feature = "cpal")]
pub use audio_output::CpalAudioSink;
