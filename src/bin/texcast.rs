use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "texcast", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a request JSON to an SVG/PNG/MP4 file.
    Render(RenderArgs),
    /// Print the content-addressed cache key for a request JSON.
    Key(KeyArgs),
    /// Check which toolchain binaries are reachable.
    Doctor(ToolArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Input render request JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output file path.
    #[arg(long)]
    out: PathBuf,

    /// Cache directory (content-addressed); omit for in-memory only.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Per-tool wall clock limit in seconds.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    #[command(flatten)]
    tools: ToolArgs,
}

#[derive(Parser, Debug)]
struct KeyArgs {
    /// Input render request JSON.
    #[arg(long = "in")]
    in_path: PathBuf,
}

#[derive(Parser, Debug)]
struct ToolArgs {
    /// LaTeX engine binary.
    #[arg(long, default_value = "latex")]
    latex_bin: PathBuf,

    /// DVI-to-SVG converter binary.
    #[arg(long, default_value = "dvisvgm")]
    dvisvgm_bin: PathBuf,

    /// Media encoder binary.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_bin: PathBuf,
}

impl ToolArgs {
    fn to_config(&self) -> texcast::ToolchainConfig {
        texcast::ToolchainConfig {
            latex: self.latex_bin.clone(),
            dvisvgm: self.dvisvgm_bin.clone(),
            ffmpeg: self.ffmpeg_bin.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Key(args) => cmd_key(args),
        Command::Doctor(args) => cmd_doctor(args),
    }
}

fn read_request(path: &Path) -> anyhow::Result<texcast::RenderRequest> {
    let f = File::open(path).with_context(|| format!("open request '{}'", path.display()))?;
    let r = BufReader::new(f);
    let req: texcast::RenderRequest =
        serde_json::from_reader(r).with_context(|| "parse request JSON")?;
    Ok(req)
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let req = read_request(&args.in_path)?;

    let cfg = texcast::PipelineConfig {
        limits: texcast::InvokeLimits {
            timeout: Duration::from_secs(args.timeout_secs),
            ..Default::default()
        },
        caching: true,
    };
    let cache = Arc::new(texcast::RenderCache::new(0, args.cache_dir));
    let pipeline = texcast::RenderPipeline::new(args.tools.to_config(), cfg, cache);

    let asset = pipeline.render(&req)?;

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&args.out, &asset.bytes)
        .with_context(|| format!("write output '{}'", args.out.display()))?;

    eprintln!("wrote {} ({} bytes)", args.out.display(), asset.byte_len());
    Ok(())
}

fn cmd_key(args: KeyArgs) -> anyhow::Result<()> {
    let req = read_request(&args.in_path)?;
    req.validate()?;
    println!("{}", req.cache_key());
    Ok(())
}

fn cmd_doctor(args: ToolArgs) -> anyhow::Result<()> {
    let tools = args.to_config();
    let mut all_ok = true;
    for (name, path) in [
        ("latex", &tools.latex),
        ("dvisvgm", &tools.dvisvgm),
        ("ffmpeg", &tools.ffmpeg),
    ] {
        let ok = texcast::invoke::is_tool_available(path);
        all_ok &= ok;
        eprintln!(
            "{name:8} {} ({})",
            if ok { "ok" } else { "MISSING" },
            path.display()
        );
    }
    if !all_ok {
        anyhow::bail!("one or more toolchain binaries are unavailable");
    }
    Ok(())
}
