#![forbid(unsafe_code)]

//! LaTeX-to-visual-asset rendering pipeline.
//!
//! Takes a LaTeX fragment, compiles it through a typesetting engine,
//! converts the DVI intermediate into SVG or PNG, optionally encodes a frame
//! sequence into MP4 via ffmpeg, and caches results by content hash.

pub mod assemble;
pub mod cache;
pub mod compile;
pub mod convert;
pub mod error;
pub mod invoke;
pub mod pipeline;
pub mod request;

pub use assemble::{FrameSequence, SequenceAssembler};
pub use cache::{Claim, RenderCache};
pub use compile::{CompiledDocument, DocumentCompiler};
pub use convert::{AssetConverter, RenderedAsset};
pub use error::{
    AssemblyErrorKind, CompileErrorKind, ConversionErrorKind, ProcessErrorKind, TexcastError,
    TexcastResult,
};
pub use invoke::{CancelToken, InvokeLimits, ToolOutput, ToolchainConfig};
pub use pipeline::{PipelineConfig, RenderPipeline};
pub use request::{CacheKey, OutputFormat, PreambleConfig, RenderRequest, normalize_source};
