use std::sync::Arc;

use sha2::Digest as _;

use crate::{
    assemble::{FrameSequence, SequenceAssembler},
    cache::{Claim, RenderCache},
    compile::DocumentCompiler,
    convert::{AssetConverter, RenderedAsset},
    error::{TexcastError, TexcastResult},
    invoke::{CancelToken, InvokeLimits, ToolchainConfig},
    request::{CacheKey, OutputFormat, PreambleConfig, RenderRequest},
};

/// Pipeline-wide knobs; per-invocation resource limits plus cache policy.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    pub limits: InvokeLimits,
    /// When false every request is produced from scratch and nothing is
    /// stored.
    pub caching: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limits: InvokeLimits::default(),
            caching: true,
        }
    }
}

/// Orchestrates normalize → cache claim → compile → convert → (assemble) →
/// store → return for each request.
///
/// The cache is an injected service with its own lifecycle; the pipeline
/// never creates globals.
pub struct RenderPipeline {
    tools: ToolchainConfig,
    cfg: PipelineConfig,
    cache: Arc<RenderCache>,
}

impl RenderPipeline {
    pub fn new(tools: ToolchainConfig, cfg: PipelineConfig, cache: Arc<RenderCache>) -> Self {
        Self { tools, cfg, cache }
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Render a request to a single asset, consulting the cache first.
    pub fn render(&self, req: &RenderRequest) -> TexcastResult<Arc<RenderedAsset>> {
        self.render_cancellable(req, &CancelToken::new())
    }

    /// Like [`render`](Self::render) but cancellable: cancelling terminates
    /// the currently running tool and reports `Cancelled` after scratch
    /// cleanup.
    pub fn render_cancellable(
        &self,
        req: &RenderRequest,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        req.validate()?;
        let key = req.cache_key();

        if !self.cfg.caching {
            return self.produce(req, &key, cancel);
        }

        match self.cache.claim(&key)? {
            Claim::Hit(asset) => {
                tracing::info!(key = %key, bytes = asset.byte_len(), "cache hit");
                Ok(asset)
            }
            Claim::Miss(ticket) => match self.produce(req, &key, cancel) {
                Ok(asset) => {
                    // Persist before handing the asset back; a store failure
                    // (consistency violation) is surfaced, not swallowed.
                    ticket.complete(asset.clone())?;
                    Ok(asset)
                }
                Err(e) => {
                    // No partial artifact reaches the cache on any failure.
                    ticket.fail(&e);
                    Err(e)
                }
            },
        }
    }

    /// Encode caller-supplied, already-rendered frames into a video.
    ///
    /// This is the entry point for callers that render frames elsewhere; the
    /// pipeline itself never derives per-frame fragment variations.
    pub fn assemble_frames(
        &self,
        seq: FrameSequence,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        let key = frames_key(&seq);
        let assembler = SequenceAssembler::new(&self.tools, self.cfg.limits);

        if !self.cfg.caching {
            return assembler.assemble(seq, &key, cancel);
        }

        match self.cache.claim(&key)? {
            Claim::Hit(asset) => {
                tracing::info!(key = %key, bytes = asset.byte_len(), "cache hit");
                Ok(asset)
            }
            Claim::Miss(ticket) => match assembler.assemble(seq, &key, cancel) {
                Ok(asset) => {
                    ticket.complete(asset.clone())?;
                    Ok(asset)
                }
                Err(e) => {
                    ticket.fail(&e);
                    Err(e)
                }
            },
        }
    }

    fn produce(
        &self,
        req: &RenderRequest,
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        match req.format {
            OutputFormat::Svg | OutputFormat::Png => self.produce_image(
                &req.source,
                req.format,
                req.dpi,
                &req.preamble,
                key,
                cancel,
            ),
            OutputFormat::Mp4 => self.produce_sequence(req, key, cancel),
        }
    }

    fn produce_image(
        &self,
        source: &str,
        format: OutputFormat,
        dpi: u32,
        preamble: &PreambleConfig,
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        self.ensure_live(cancel)?;
        let compiler = DocumentCompiler::new(&self.tools, self.cfg.limits);
        let doc = compiler.compile(source, preamble, cancel)?;

        self.ensure_live(cancel)?;
        let converter = AssetConverter::new(&self.tools, self.cfg.limits);
        // `doc` drops at the end of this call, releasing the intermediate's
        // scratch directory on success and failure alike.
        converter.convert(&doc, format, dpi, key, cancel)
    }

    fn produce_sequence(
        &self,
        req: &RenderRequest,
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        let mut frames = Vec::with_capacity(req.frames.len());
        for (i, src) in req.frames.iter().enumerate() {
            let frame_key =
                RenderRequest::image(src.clone(), OutputFormat::Png, req.dpi).cache_key();
            let frame = self.produce_image(
                src,
                OutputFormat::Png,
                req.dpi,
                &req.preamble,
                &frame_key,
                cancel,
            )?;
            tracing::debug!(frame = i, total = req.frames.len(), "rendered sequence frame");
            frames.push(frame);
        }

        self.ensure_live(cancel)?;
        // Tight per-formula bounding boxes differ between frames; unify them
        // onto one canvas so the assembler's dimension precondition holds.
        let frames = unify_frames(frames)?;
        let assembler = SequenceAssembler::new(&self.tools, self.cfg.limits);
        assembler.assemble(
            FrameSequence {
                frames,
                fps: req.fps,
            },
            key,
            cancel,
        )
    }

    fn ensure_live(&self, cancel: &CancelToken) -> TexcastResult<()> {
        if cancel.is_cancelled() {
            return Err(TexcastError::cancelled("render cancelled by caller"));
        }
        Ok(())
    }
}

/// Recomposite pipeline-produced frames onto a shared white canvas.
///
/// The canvas is the maximum frame extent rounded up to even dimensions
/// (libx264/yuv420p requirement), with each frame centered. Video output has
/// no alpha channel, so transparency is flattened here rather than left for
/// the encoder to blend onto black.
fn unify_frames(frames: Vec<Arc<RenderedAsset>>) -> TexcastResult<Vec<Arc<RenderedAsset>>> {
    let mut decoded = Vec::with_capacity(frames.len());
    let (mut max_w, mut max_h) = (1u32, 1u32);
    for (i, frame) in frames.iter().enumerate() {
        let img = image::load_from_memory(&frame.bytes)
            .map_err(|e| TexcastError::validation(format!("frame {i} failed to decode: {e}")))?
            .to_rgba8();
        max_w = max_w.max(img.width());
        max_h = max_h.max(img.height());
        decoded.push(img);
    }
    let canvas_w = max_w + (max_w & 1);
    let canvas_h = max_h + (max_h & 1);

    let mut out = Vec::with_capacity(frames.len());
    for (img, frame) in decoded.into_iter().zip(frames) {
        let mut canvas =
            image::RgbaImage::from_pixel(canvas_w, canvas_h, image::Rgba([255, 255, 255, 255]));
        let off_x = (canvas_w - img.width()) / 2;
        let off_y = (canvas_h - img.height()) / 2;
        for (x, y, px) in img.enumerate_pixels() {
            let dst = canvas.get_pixel_mut(x + off_x, y + off_y);
            *dst = image::Rgba(blend_over_opaque(px.0, dst.0));
        }

        let mut png = Vec::new();
        image::write_buffer_with_format(
            &mut std::io::Cursor::new(&mut png),
            canvas.as_raw(),
            canvas_w,
            canvas_h,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .map_err(|e| TexcastError::validation(format!("re-encode unified frame: {e}")))?;

        out.push(Arc::new(RenderedAsset {
            format: OutputFormat::Png,
            bytes: png,
            pixel_size: Some((canvas_w, canvas_h)),
            key: frame.key.clone(),
        }));
    }
    Ok(out)
}

/// Straight-alpha source over an opaque background.
fn blend_over_opaque(src: [u8; 4], bg: [u8; 4]) -> [u8; 4] {
    let a = u16::from(src[3]);
    if a == 255 {
        return [src[0], src[1], src[2], 255];
    }
    let inv = 255 - a;
    let mix = |s: u8, b: u8| -> u8 {
        (((u32::from(s) * u32::from(a) + u32::from(b) * u32::from(inv)) + 127) / 255).min(255) as u8
    };
    [mix(src[0], bg[0]), mix(src[1], bg[1]), mix(src[2], bg[2]), 255]
}

/// Content key for a caller-supplied frame sequence: hash of the frame bytes
/// in order plus the frame rate.
fn frames_key(seq: &FrameSequence) -> CacheKey {
    let mut h = sha2::Sha256::new();
    h.update(b"texcast-frames-v1\0");
    h.update(seq.fps.to_le_bytes());
    h.update((seq.frames.len() as u64).to_le_bytes());
    for f in &seq.frames {
        h.update((f.bytes.len() as u64).to_le_bytes());
        h.update(&f.bytes);
    }
    CacheKey::from_digest(h.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessErrorKind;

    fn broken_tools() -> ToolchainConfig {
        ToolchainConfig {
            latex: "/nonexistent/latex".into(),
            dvisvgm: "/nonexistent/dvisvgm".into(),
            ffmpeg: "/nonexistent/ffmpeg".into(),
        }
    }

    fn pipeline_with(cache: Arc<RenderCache>) -> RenderPipeline {
        RenderPipeline::new(broken_tools(), PipelineConfig::default(), cache)
    }

    #[test]
    fn invalid_requests_fail_before_any_tool_runs() {
        let pipeline = pipeline_with(Arc::new(RenderCache::in_memory()));
        let err = pipeline
            .render(&RenderRequest::image("", OutputFormat::Svg, 300))
            .unwrap_err();
        assert!(matches!(err, TexcastError::Validation(_)));
    }

    #[test]
    fn missing_latex_surfaces_as_spawn_failure() {
        let pipeline = pipeline_with(Arc::new(RenderCache::in_memory()));
        let err = pipeline
            .render(&RenderRequest::image("$x$", OutputFormat::Svg, 300))
            .unwrap_err();
        assert!(matches!(
            err,
            TexcastError::Process {
                kind: ProcessErrorKind::SpawnFailure,
                ..
            }
        ));
    }

    #[test]
    fn cache_hit_performs_zero_toolchain_invocations() {
        let cache = Arc::new(RenderCache::in_memory());
        let req = RenderRequest::image("$E=mc^2$", OutputFormat::Svg, 300);
        let key = req.cache_key();
        let asset = Arc::new(RenderedAsset {
            format: OutputFormat::Svg,
            bytes: b"<svg/>".to_vec(),
            pixel_size: Some((4, 4)),
            key: key.clone(),
        });
        cache.store(&key, asset.clone()).unwrap();

        // The toolchain paths are all broken, so success proves the hit path
        // never spawned anything.
        let pipeline = pipeline_with(cache);
        let found = pipeline.render(&req).unwrap();
        assert!(Arc::ptr_eq(&found, &asset));
    }

    #[test]
    fn failed_renders_leave_the_cache_empty_and_claimable() {
        let cache = Arc::new(RenderCache::in_memory());
        let pipeline = pipeline_with(cache.clone());
        let req = RenderRequest::image("$x$", OutputFormat::Svg, 300);
        assert!(pipeline.render(&req).is_err());
        assert!(cache.is_empty());
        // A later attempt is allowed to produce again.
        assert!(pipeline.render(&req).is_err());
    }

    fn png_frame(width: u32, height: u32, rgba: [u8; 4]) -> Arc<RenderedAsset> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
        let mut png = Vec::new();
        image::write_buffer_with_format(
            &mut std::io::Cursor::new(&mut png),
            img.as_raw(),
            width,
            height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .unwrap();
        Arc::new(RenderedAsset {
            format: OutputFormat::Png,
            bytes: png,
            pixel_size: Some((width, height)),
            key: RenderRequest::image("$x$", OutputFormat::Png, 300).cache_key(),
        })
    }

    #[test]
    fn prerendered_frame_jobs_are_served_from_the_cache() {
        let cache = Arc::new(RenderCache::in_memory());
        let seq = FrameSequence {
            frames: vec![png_frame(8, 8, [0, 0, 0, 255])],
            fps: 12,
        };
        let key = frames_key(&seq);

        let mut mp4 = vec![0, 0, 0, 24];
        mp4.extend_from_slice(b"ftypisom");
        mp4.extend_from_slice(&[0; 16]);
        let video = Arc::new(RenderedAsset {
            format: OutputFormat::Mp4,
            bytes: mp4,
            pixel_size: Some((8, 8)),
            key: key.clone(),
        });
        cache.store(&key, video.clone()).unwrap();

        // The encoder path is broken, so success proves the repeat job never
        // spawned ffmpeg.
        let pipeline = pipeline_with(cache);
        let found = pipeline.assemble_frames(seq, &CancelToken::new()).unwrap();
        assert!(Arc::ptr_eq(&found, &video));
    }

    #[test]
    fn unify_frames_pads_to_shared_even_canvas() {
        let frames = vec![
            png_frame(31, 20, [0, 0, 0, 255]),
            png_frame(20, 31, [0, 0, 0, 128]),
        ];
        let unified = unify_frames(frames).unwrap();
        assert_eq!(unified.len(), 2);
        for frame in &unified {
            assert_eq!(frame.pixel_size, Some((32, 32)));
            let img = image::load_from_memory(&frame.bytes).unwrap().to_rgba8();
            assert_eq!((img.width(), img.height()), (32, 32));
            // Flattened: no transparency survives.
            assert!(img.pixels().all(|p| p.0[3] == 255));
        }
    }

    #[test]
    fn blending_over_white_flattens_alpha() {
        assert_eq!(blend_over_opaque([10, 20, 30, 255], [255; 4]), [10, 20, 30, 255]);
        assert_eq!(blend_over_opaque([0, 0, 0, 0], [255; 4]), [255, 255, 255, 255]);
        let half = blend_over_opaque([0, 0, 0, 128], [255; 4]);
        assert!(half[0] > 120 && half[0] < 135);
        assert_eq!(half[3], 255);
    }

    #[test]
    fn cancelled_token_reports_cancellation() {
        let pipeline = pipeline_with(Arc::new(RenderCache::in_memory()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = pipeline
            .render_cancellable(&RenderRequest::image("$x$", OutputFormat::Svg, 300), &cancel)
            .unwrap_err();
        assert!(matches!(err, TexcastError::Cancelled(_)));
    }
}
