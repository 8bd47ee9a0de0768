use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{
    error::{CompileErrorKind, TexcastError, TexcastResult, truncate_diagnostic},
    invoke::{CancelToken, InvokeLimits, ToolchainConfig, run_tool, scratch_dir},
    request::PreambleConfig,
};

const DOC_STEM: &str = "doc";

/// Intermediate product of one LaTeX compilation.
///
/// Owns the scratch directory holding the DVI; dropping the document removes
/// the directory and everything in it, on success and failure paths alike.
#[derive(Debug)]
pub struct CompiledDocument {
    pub(crate) scratch: tempfile::TempDir,
    pub(crate) dvi_path: PathBuf,
    /// Captured compiler log (bounded by the invoker's output cap).
    pub log: String,
}

impl CompiledDocument {
    pub fn dvi_path(&self) -> &Path {
        &self.dvi_path
    }

    /// Scratch directory the DVI lives in; converters may place their own
    /// products here so everything is reclaimed together.
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }
}

/// Compiles LaTeX fragments into DVI intermediates via the typesetting engine.
pub struct DocumentCompiler<'a> {
    tools: &'a ToolchainConfig,
    limits: InvokeLimits,
}

impl<'a> DocumentCompiler<'a> {
    pub fn new(tools: &'a ToolchainConfig, limits: InvokeLimits) -> Self {
        Self { tools, limits }
    }

    /// Compile `fragment` inside a minimal document shell.
    ///
    /// The fragment is trusted content from an authenticated caller; macros
    /// are not filtered or sandboxed here.
    pub fn compile(
        &self,
        fragment: &str,
        preamble: &PreambleConfig,
        cancel: &CancelToken,
    ) -> TexcastResult<CompiledDocument> {
        preamble.validate()?;

        let scratch = scratch_dir()?;
        let tex_path = scratch.path().join(format!("{DOC_STEM}.tex"));
        std::fs::write(&tex_path, document_shell(fragment, preamble)).map_err(|e| {
            TexcastError::Other(
                anyhow::Error::new(e).context(format!("write '{}'", tex_path.display())),
            )
        })?;

        let args: Vec<OsString> = vec![
            OsString::from("-interaction=nonstopmode"),
            OsString::from("-halt-on-error"),
            OsString::from(format!("{DOC_STEM}.tex")),
        ];

        tracing::debug!(fragment_len = fragment.len(), "compiling latex fragment");
        let out = run_tool(
            &self.tools.latex,
            &args,
            scratch.path(),
            &self.limits,
            cancel,
        )?;

        let log = out.log_lossy();
        if let Some(err) = classify_failure(out.success(), &log) {
            return Err(err);
        }

        let dvi_path = scratch.path().join(format!("{DOC_STEM}.dvi"));
        let dvi_ok = std::fs::metadata(&dvi_path).map(|m| m.len() > 0).unwrap_or(false);
        if !dvi_ok {
            // Exit code 0 but no product: the toolchain contradicted itself.
            // Surface the captured log verbatim (bounded) so operators can
            // see what the engine actually did.
            return Err(TexcastError::compile(
                CompileErrorKind::ToolingInconsistency,
                format!("latex exited 0 but produced no dvi\n{log}"),
            ));
        }

        Ok(CompiledDocument {
            scratch,
            dvi_path,
            log,
        })
    }
}

/// Wrap a fragment in the minimal compilable shell built from `preamble`.
///
/// The `preview` package with `tightpage` crops the page to the typeset
/// content, which is what gives formulas their tight bounding boxes
/// downstream.
pub fn document_shell(fragment: &str, preamble: &PreambleConfig) -> String {
    let mut doc = String::new();
    doc.push_str("\\documentclass{article}\n");
    doc.push_str(&format!(
        "\\usepackage[{}]{{fontenc}}\n",
        preamble.font_encoding
    ));
    if let Some(g) = &preamble.geometry {
        doc.push_str(&format!("\\usepackage[{g}]{{geometry}}\n"));
    }
    doc.push_str("\\usepackage{amsmath}\n\\usepackage{amssymb}\n");
    for p in &preamble.packages {
        doc.push_str(&format!("\\usepackage{{{p}}}\n"));
    }
    doc.push_str("\\usepackage[active,tightpage,textmath,displaymath]{preview}\n");
    doc.push_str("\\begin{document}\n");
    doc.push_str(fragment);
    if !fragment.ends_with('\n') {
        doc.push('\n');
    }
    doc.push_str("\\end{document}\n");
    doc
}

/// Classify a finished compiler run from its exit status and log.
///
/// Returns `None` when the run looks clean. TeX engines print error lines
/// starting with `! `, so those mark a failure even on the rare exit code 0.
pub fn classify_failure(exit_ok: bool, log: &str) -> Option<TexcastError> {
    let has_error_marker = log.lines().any(|l| l.starts_with("! "));
    if exit_ok && !has_error_marker {
        return None;
    }

    let kind = if is_missing_package(log) {
        CompileErrorKind::MissingPackage
    } else {
        CompileErrorKind::SyntaxError
    };
    Some(TexcastError::compile(kind, error_excerpt(log)))
}

fn is_missing_package(log: &str) -> bool {
    log.lines().any(|l| {
        l.starts_with("! LaTeX Error:") && l.contains(".sty' not found")
            || l.starts_with("! I can't find file")
    })
}

/// Extract the part of a TeX log a caller actually needs: everything from the
/// first `! ` marker through the `l.<line>` locator, bounded in length.
fn error_excerpt(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let Some(start) = lines.iter().position(|l| l.starts_with("! ")) else {
        return truncate_diagnostic(log);
    };

    let mut excerpt = Vec::new();
    for line in &lines[start..] {
        excerpt.push(*line);
        if line.starts_with("l.") || excerpt.len() >= 20 {
            break;
        }
    }
    truncate_diagnostic(&excerpt.join("\n"))
}
