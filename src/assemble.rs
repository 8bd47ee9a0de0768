use std::{ffi::OsString, sync::Arc};

use anyhow::Context as _;

use crate::{
    convert::RenderedAsset,
    error::{AssemblyErrorKind, TexcastError, TexcastResult},
    invoke::{CancelToken, InvokeLimits, ToolchainConfig, run_tool, scratch_dir},
    request::{CacheKey, OutputFormat},
};

/// Ordered frames plus target frame rate; consumed once by the assembler.
#[derive(Debug)]
pub struct FrameSequence {
    pub frames: Vec<Arc<RenderedAsset>>,
    pub fps: u32,
}

/// Encodes ordered PNG frames into an MP4 container via ffmpeg.
pub struct SequenceAssembler<'a> {
    tools: &'a ToolchainConfig,
    limits: InvokeLimits,
}

impl<'a> SequenceAssembler<'a> {
    pub fn new(tools: &'a ToolchainConfig, limits: InvokeLimits) -> Self {
        Self { tools, limits }
    }

    /// Assemble `seq` into a video asset, preserving frame order exactly.
    ///
    /// Dimension agreement is checked up front so a mismatched sequence never
    /// pays for a failing encoder run.
    pub fn assemble(
        &self,
        seq: FrameSequence,
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        if seq.frames.is_empty() {
            return Err(TexcastError::assembly(
                AssemblyErrorKind::EmptySequence,
                "sequence has no frames",
            ));
        }
        if seq.fps == 0 {
            return Err(TexcastError::validation("fps must be positive"));
        }

        let (width, height) = check_dimensions(&seq.frames)?;

        let scratch = scratch_dir()?;
        for (i, frame) in seq.frames.iter().enumerate() {
            let path = scratch.path().join(format!("frame_{i:05}.png"));
            std::fs::write(&path, &frame.bytes)
                .with_context(|| format!("write frame '{}'", path.display()))
                .map_err(TexcastError::from)?;
        }

        let out_name = "out.mp4";
        let args: Vec<OsString> = [
            "-y",
            "-loglevel",
            "error",
            "-f",
            "image2",
            "-framerate",
            &seq.fps.to_string(),
            "-i",
            "frame_%05d.png",
            "-an",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            // libx264 with yuv420p requires even dimensions.
            "-vf",
            "pad=ceil(iw/2)*2:ceil(ih/2)*2",
            "-movflags",
            "+faststart",
            // Keep the muxer from stamping creation times into the container.
            "-fflags",
            "+bitexact",
            out_name,
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        tracing::debug!(frames = seq.frames.len(), fps = seq.fps, "encoding sequence");
        let out = run_tool(&self.tools.ffmpeg, &args, scratch.path(), &self.limits, cancel)?;
        if !out.success() {
            return Err(TexcastError::assembly(
                AssemblyErrorKind::EncodingFailure,
                format!("ffmpeg exited {}: {}", out.exit_code, out.log_lossy()),
            ));
        }

        let out_path = scratch.path().join(out_name);
        let bytes = std::fs::read(&out_path)
            .with_context(|| format!("read encoder output '{}'", out_path.display()))
            .map_err(TexcastError::from)?;
        if !looks_like_mp4(&bytes) {
            return Err(TexcastError::assembly(
                AssemblyErrorKind::EncodingFailure,
                "ffmpeg output does not look like an mp4 container",
            ));
        }

        Ok(Arc::new(RenderedAsset {
            format: OutputFormat::Mp4,
            bytes,
            pixel_size: Some((width, height)),
            key: key.clone(),
        }))
    }
}

/// Probe every frame's PNG header and require identical pixel dimensions.
fn check_dimensions(frames: &[Arc<RenderedAsset>]) -> TexcastResult<(u32, u32)> {
    let mut expected: Option<(u32, u32)> = None;
    for (i, frame) in frames.iter().enumerate() {
        if frame.format != OutputFormat::Png {
            return Err(TexcastError::assembly(
                AssemblyErrorKind::EncodingFailure,
                format!("frame {i} is {:?}, expected png", frame.format),
            ));
        }
        let dims = image::ImageReader::new(std::io::Cursor::new(&frame.bytes))
            .with_guessed_format()
            .ok()
            .and_then(|r| r.into_dimensions().ok())
            .ok_or_else(|| {
                TexcastError::assembly(
                    AssemblyErrorKind::EncodingFailure,
                    format!("frame {i} is not a decodable image"),
                )
            })?;

        match expected {
            None => expected = Some(dims),
            Some(e) if e != dims => {
                return Err(TexcastError::assembly(
                    AssemblyErrorKind::DimensionMismatch,
                    format!(
                        "frame {i} is {}x{}, expected {}x{} (from frame 0)",
                        dims.0, dims.1, e.0, e.1
                    ),
                ));
            }
            Some(_) => {}
        }
    }
    // Non-empty is checked by the caller.
    Ok(expected.unwrap_or((0, 0)))
}

fn looks_like_mp4(bytes: &[u8]) -> bool {
    bytes.len() > 12 && &bytes[4..8] == b"ftyp"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RenderRequest;

    fn png_frame(width: u32, height: u32) -> Arc<RenderedAsset> {
        let rgba = vec![255u8; (width * height * 4) as usize];
        let mut png = Vec::new();
        image::write_buffer_with_format(
            &mut std::io::Cursor::new(&mut png),
            &rgba,
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

    fn broken_tools() -> ToolchainConfig {
        // Any spawn attempt against these paths would fail loudly, proving the
        // precondition checks run before the encoder.
        ToolchainConfig {
            latex: "/nonexistent/latex".into(),
            dvisvgm: "/nonexistent/dvisvgm".into(),
            ffmpeg: "/nonexistent/ffmpeg".into(),
        }
    }

    fn dummy_key() -> CacheKey {
        RenderRequest::sequence(vec!["$x$".into()], 300, 30).cache_key()
    }

    #[test]
    fn empty_sequence_fails_fast() {
        let tools = broken_tools();
        let assembler = SequenceAssembler::new(&tools, InvokeLimits::default());
        let err = assembler
            .assemble(
                FrameSequence {
                    frames: vec![],
                    fps: 30,
                },
                &dummy_key(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TexcastError::Assembly {
                kind: AssemblyErrorKind::EmptySequence,
                ..
            }
        ));
    }

    #[test]
    fn mismatched_dimensions_fail_before_the_encoder_runs() {
        let tools = broken_tools();
        let assembler = SequenceAssembler::new(&tools, InvokeLimits::default());
        let err = assembler
            .assemble(
                FrameSequence {
                    frames: vec![png_frame(32, 32), png_frame(32, 32), png_frame(64, 32)],
                    fps: 30,
                },
                &dummy_key(),
                &CancelToken::new(),
            )
            .unwrap_err();
        let TexcastError::Assembly { kind, message } = err else {
            panic!("wrong variant");
        };
        assert_eq!(kind, AssemblyErrorKind::DimensionMismatch);
        assert!(message.contains("frame 2"));
    }

    #[test]
    fn zero_fps_is_rejected() {
        let tools = broken_tools();
        let assembler = SequenceAssembler::new(&tools, InvokeLimits::default());
        let err = assembler
            .assemble(
                FrameSequence {
                    frames: vec![png_frame(32, 32)],
                    fps: 0,
                },
                &dummy_key(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TexcastError::Validation(_)));
    }

    #[test]
    fn dimension_check_accepts_uniform_frames() {
        let frames = vec![png_frame(48, 24), png_frame(48, 24)];
        assert_eq!(check_dimensions(&frames).unwrap(), (48, 24));
    }

    #[test]
    fn mp4_signature_probe() {
        let mut fake = vec![0, 0, 0, 24];
        fake.extend_from_slice(b"ftypisom");
        fake.extend_from_slice(&[0; 16]);
        assert!(looks_like_mp4(&fake));
        assert!(!looks_like_mp4(b"<svg/>"));
    }
}
