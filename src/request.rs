use sha2::Digest as _;

use crate::error::{TexcastError, TexcastResult};

/// Target format of a rendered asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Svg,
    Png,
    Mp4,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Svg => "svg",
            Self::Png => "png",
            Self::Mp4 => "mp4",
        }
    }

    fn key_tag(self) -> u8 {
        match self {
            Self::Svg => b'S',
            Self::Png => b'P',
            Self::Mp4 => b'V',
        }
    }
}

/// Recognized preamble options for the generated document shell.
///
/// This is a closed set: unknown keys are rejected at deserialization time
/// rather than forwarded into the document verbatim.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreambleConfig {
    /// Extra packages to `\usepackage`, loaded in the given order after the
    /// defaults (`amsmath`, `amssymb`).
    pub packages: Vec<String>,
    /// Options forwarded to the `geometry` package, e.g. `margin=1cm`.
    pub geometry: Option<String>,
    /// Font encoding passed to `fontenc`.
    pub font_encoding: String,
}

impl Default for PreambleConfig {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            geometry: None,
            font_encoding: "T1".to_string(),
        }
    }
}

impl PreambleConfig {
    pub fn validate(&self) -> TexcastResult<()> {
        for name in &self.packages {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(TexcastError::validation(format!(
                    "invalid package name '{name}' (expected ascii letters, digits, '-')"
                )));
            }
        }
        if let Some(g) = &self.geometry {
            if g.is_empty()
                || !g
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | ',' | '.' | ' '))
            {
                return Err(TexcastError::validation(format!(
                    "invalid geometry options '{g}'"
                )));
            }
        }
        if self.font_encoding.is_empty()
            || !self.font_encoding.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(TexcastError::validation(format!(
                "invalid font encoding '{}'",
                self.font_encoding
            )));
        }
        Ok(())
    }
}

/// Immutable description of one render.
///
/// For `Svg`/`Png` the `source` fragment is compiled once. For `Mp4` the
/// caller supplies the full ordered list of per-frame fragments in `frames`;
/// the pipeline never derives frame variations itself.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderRequest {
    pub source: String,
    pub format: OutputFormat,
    /// Raster density. Also controls the nominal pixel scale reported for
    /// vector output.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Per-frame LaTeX fragments, ordered; only meaningful for `Mp4`.
    #[serde(default)]
    pub frames: Vec<String>,
    /// Target frame rate; only meaningful for `Mp4`.
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub preamble: PreambleConfig,
}

fn default_dpi() -> u32 {
    300
}

fn default_fps() -> u32 {
    30
}

impl RenderRequest {
    /// Static image request with default preamble.
    pub fn image(source: impl Into<String>, format: OutputFormat, dpi: u32) -> Self {
        Self {
            source: source.into(),
            format,
            dpi,
            frames: Vec::new(),
            fps: default_fps(),
            preamble: PreambleConfig::default(),
        }
    }

    /// Sequence request from ordered per-frame fragments.
    pub fn sequence(frames: Vec<String>, dpi: u32, fps: u32) -> Self {
        Self {
            source: String::new(),
            format: OutputFormat::Mp4,
            dpi,
            frames,
            fps,
            preamble: PreambleConfig::default(),
        }
    }

    pub fn validate(&self) -> TexcastResult<()> {
        if self.dpi == 0 {
            return Err(TexcastError::validation("dpi must be positive"));
        }
        self.preamble.validate()?;

        match self.format {
            OutputFormat::Svg | OutputFormat::Png => {
                if self.source.trim().is_empty() {
                    return Err(TexcastError::validation("source must be non-empty"));
                }
                if !self.frames.is_empty() {
                    return Err(TexcastError::validation(
                        "frames are only valid for mp4 requests",
                    ));
                }
            }
            OutputFormat::Mp4 => {
                if self.frames.is_empty() {
                    return Err(TexcastError::validation(
                        "mp4 requests need at least one frame source",
                    ));
                }
                if self.frames.iter().any(|f| f.trim().is_empty()) {
                    return Err(TexcastError::validation("frame sources must be non-empty"));
                }
                if self.fps == 0 {
                    return Err(TexcastError::validation("fps must be positive"));
                }
            }
        }
        Ok(())
    }

    /// Derive the content-addressed cache key from the normalized request.
    ///
    /// Strings are length-prefixed before hashing so adjacent fields can
    /// never alias.
    pub fn cache_key(&self) -> CacheKey {
        let mut h = sha2::Sha256::new();
        h.update(b"texcast-key-v1\0");
        h.update([self.format.key_tag()]);
        h.update(self.dpi.to_le_bytes());
        if self.format == OutputFormat::Mp4 {
            h.update(self.fps.to_le_bytes());
        }

        hash_str(&mut h, &self.preamble.font_encoding);
        hash_str(&mut h, self.preamble.geometry.as_deref().unwrap_or(""));
        h.update((self.preamble.packages.len() as u64).to_le_bytes());
        for p in &self.preamble.packages {
            hash_str(&mut h, p);
        }

        hash_str(&mut h, &normalize_source(&self.source));
        h.update((self.frames.len() as u64).to_le_bytes());
        for f in &self.frames {
            hash_str(&mut h, &normalize_source(f));
        }

        CacheKey {
            digest: h.finalize().into(),
        }
    }
}

fn hash_str(h: &mut sha2::Sha256, s: &str) {
    h.update((s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}

/// Normalize a LaTeX fragment for hashing.
///
/// TeX collapses interword whitespace runs, ignores leading/trailing spaces
/// on a line, and treats any run of blank lines as one paragraph break, so
/// those differences are erased here. Content inside verbatim environments is
/// assumed absent (math/scientific fragments).
pub fn normalize_source(source: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending_blank = false;
    for line in source.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if pending_blank {
            out.push(String::new());
            pending_blank = false;
        }
        out.push(collapsed);
    }
    out.join("\n")
}

/// Content hash identifying a normalized render request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: [u8; 32],
}

impl CacheKey {
    /// Build a key from a precomputed SHA-256 digest (used for derived keys
    /// such as caller-supplied frame sequences).
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self { digest }
    }

    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.digest {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Two-character shard prefix used for the on-disk layout
    /// `cache/<prefix>/<hash>.<ext>`.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.digest[0])
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}
