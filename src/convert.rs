use std::{ffi::OsString, sync::Arc};

use anyhow::Context as _;

use crate::{
    compile::CompiledDocument,
    error::{ConversionErrorKind, TexcastError, TexcastResult},
    invoke::{CancelToken, InvokeLimits, ToolchainConfig, run_tool},
    request::{CacheKey, OutputFormat},
};

/// Reference density of the SVG coordinate space (CSS pixels per inch).
const SVG_BASE_DPI: f64 = 96.0;

/// Upper bound on raster dimensions to avoid pathological allocations.
const MAX_RASTER_DIM: u32 = 16_384;

/// Final render product.
///
/// Stored assets are owned by the cache as `Arc<RenderedAsset>`; callers hold
/// read-only references.
#[derive(Clone, Debug)]
pub struct RenderedAsset {
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
    /// Pixel dimensions, when known (raster output, or the nominal raster
    /// size of vector output at the requested DPI).
    pub pixel_size: Option<(u32, u32)>,
    /// Key of the request this asset was produced for.
    pub key: CacheKey,
}

impl RenderedAsset {
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Converts DVI intermediates into SVG or PNG assets.
pub struct AssetConverter<'a> {
    tools: &'a ToolchainConfig,
    limits: InvokeLimits,
}

impl<'a> AssetConverter<'a> {
    pub fn new(tools: &'a ToolchainConfig, limits: InvokeLimits) -> Self {
        Self { tools, limits }
    }

    pub fn convert(
        &self,
        doc: &CompiledDocument,
        format: OutputFormat,
        dpi: u32,
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> TexcastResult<Arc<RenderedAsset>> {
        if dpi == 0 {
            return Err(TexcastError::validation("dpi must be positive"));
        }

        let asset = match format {
            OutputFormat::Mp4 => {
                return Err(TexcastError::conversion(
                    ConversionErrorKind::UnsupportedFormat,
                    "mp4 is produced by the sequence assembler, not the converter",
                ));
            }
            OutputFormat::Svg => {
                let svg = self.dvi_to_svg(doc, cancel)?;
                let tree = parse_svg(&svg)?;
                RenderedAsset {
                    format,
                    pixel_size: Some(raster_size(&tree, dpi)?),
                    bytes: svg,
                    key: key.clone(),
                }
            }
            OutputFormat::Png => {
                let svg = self.dvi_to_svg(doc, cancel)?;
                let tree = parse_svg(&svg)?;
                let (w, h) = raster_size(&tree, dpi)?;
                let png = rasterize(&tree, w, h)?;
                RenderedAsset {
                    format,
                    bytes: png,
                    pixel_size: Some((w, h)),
                    key: key.clone(),
                }
            }
        };

        tracing::debug!(
            format = ?asset.format,
            bytes = asset.byte_len(),
            "converted intermediate"
        );
        Ok(Arc::new(asset))
    }

    /// Run dvisvgm over the DVI. `--no-fonts` turns glyphs into vector paths,
    /// so text is never rasterized; `--exact-bbox` tightens the bounding box
    /// to the actual ink.
    fn dvi_to_svg(&self, doc: &CompiledDocument, cancel: &CancelToken) -> TexcastResult<Vec<u8>> {
        let out_name = "out.svg";
        let args: Vec<OsString> = vec![
            OsString::from("--no-fonts"),
            OsString::from("--exact-bbox"),
            OsString::from("-o"),
            OsString::from(out_name),
            doc.dvi_path().as_os_str().to_owned(),
        ];

        let out = run_tool(
            &self.tools.dvisvgm,
            &args,
            doc.scratch_path(),
            &self.limits,
            cancel,
        )?;
        if !out.success() {
            return Err(TexcastError::conversion(
                ConversionErrorKind::ToolFailure,
                format!("dvisvgm exited {}: {}", out.exit_code, out.log_lossy()),
            ));
        }

        let out_path = doc.scratch_path().join(out_name);
        let bytes = std::fs::read(&out_path)
            .with_context(|| format!("read dvisvgm output '{}'", out_path.display()))
            .map_err(TexcastError::from)?;
        if bytes.is_empty() {
            return Err(TexcastError::conversion(
                ConversionErrorKind::ToolFailure,
                "dvisvgm produced an empty file",
            ));
        }

        // dvisvgm embeds a generator comment that can carry a date; strip all
        // comments so identical inputs hash to identical outputs.
        let bytes = strip_xml_comments(&bytes);
        if !looks_like_svg(&bytes) {
            return Err(TexcastError::conversion(
                ConversionErrorKind::ToolFailure,
                "dvisvgm output does not look like svg",
            ));
        }
        Ok(bytes)
    }
}

fn parse_svg(bytes: &[u8]) -> TexcastResult<usvg::Tree> {
    usvg::Tree::from_data(bytes, &usvg::Options::default()).map_err(|e| {
        TexcastError::conversion(
            ConversionErrorKind::ToolFailure,
            format!("produced svg failed to parse: {e}"),
        )
    })
}

fn raster_size(tree: &usvg::Tree, dpi: u32) -> TexcastResult<(u32, u32)> {
    let scale = f64::from(dpi) / SVG_BASE_DPI;
    let size = tree.size();
    if !size.width().is_finite() || size.width() <= 0.0 || size.height() <= 0.0 {
        return Err(TexcastError::conversion(
            ConversionErrorKind::ToolFailure,
            "svg has invalid width/height",
        ));
    }

    let w = (f64::from(size.width()) * scale).ceil().max(1.0) as u32;
    let h = (f64::from(size.height()) * scale).ceil().max(1.0) as u32;
    if w > MAX_RASTER_DIM || h > MAX_RASTER_DIM {
        return Err(TexcastError::validation(format!(
            "raster size too large: {w}x{h} (max {MAX_RASTER_DIM}x{MAX_RASTER_DIM})"
        )));
    }
    Ok((w, h))
}

/// Rasterize an SVG tree to PNG bytes at fixed pixel dimensions.
///
/// Deterministic: the PNG encoder embeds no timestamps, so same tree + same
/// dimensions yields byte-identical output.
fn rasterize(tree: &usvg::Tree, width: u32, height: u32) -> TexcastResult<Vec<u8>> {
    let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| TexcastError::validation("failed to allocate raster pixmap"))?;

    let sx = (width as f32) / tree.size().width();
    let sy = (height as f32) / tree.size().height();
    let xform = resvg::tiny_skia::Transform::from_scale(sx, sy);
    resvg::render(tree, xform, &mut pixmap.as_mut());

    // tiny-skia pixels are premultiplied; PNG wants straight alpha.
    let mut rgba = Vec::with_capacity((width as usize) * (height as usize) * 4);
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }

    let mut png = Vec::new();
    image::write_buffer_with_format(
        &mut std::io::Cursor::new(&mut png),
        &rgba,
        width,
        height,
        image::ExtendedColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .context("encode png")
    .map_err(TexcastError::from)?;
    Ok(png)
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head);
    head.contains("<svg")
}

/// Remove all `<!-- ... -->` spans from an XML document.
fn strip_xml_comments(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"<!--") {
            match bytes[i + 4..]
                .windows(3)
                .position(|w| w == b"-->")
            {
                Some(end) => {
                    i += 4 + end + 3;
                    continue;
                }
                // Unterminated comment: keep the rest verbatim.
                None => {
                    out.extend_from_slice(&bytes[i..]);
                    break;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
