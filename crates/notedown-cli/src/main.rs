//! notedown CLI entry point.
//!
//! Splits documents into segments, converts between documents and
//! notebooks, and executes documents through a long-lived kernel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use notedown::{
    document_metadata, extract_widget_dependencies, notebook_from_segments, segment, to_markdown,
    AssetPaths, KernelspecRegistry, Notebook, RenderOptions, Segment, SegmentKind, SourceText,
    TargetProfile,
};
use notedown_kernel::{ExecuteOptions, Keepalive, KernelConfig, KernelDaemon, ProcessLauncher};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "notedown")]
#[command(about = "Executable markdown documents backed by Jupyter kernels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the segments of a document
    Segment {
        input: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Convert a document to a notebook
    Convert {
        input: PathBuf,

        /// Output path (default: input with .ipynb extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render an executed notebook to markdown
    Render {
        input: PathBuf,

        /// Target format: html, latex or markdown
        #[arg(long, default_value = "html")]
        to: TargetProfile,

        /// Output path (default: input with .md extension, or .out.md for a
        /// markdown input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Execute a document or notebook and render the result to markdown
    Execute {
        input: PathBuf,

        #[arg(long, default_value = "html")]
        to: TargetProfile,

        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Python interpreter that runs the kernel driver
        #[arg(long, default_value = "python3")]
        python: PathBuf,

        /// Kernel driver script
        #[arg(long)]
        script: PathBuf,

        /// Seconds an idle kernel stays alive (0 runs without a daemon)
        #[arg(long)]
        keepalive: Option<u64>,

        /// Shut down a running kernel first
        #[arg(long)]
        restart: bool,

        /// Directory for kernel transport files
        #[arg(long)]
        runtime_dir: Option<PathBuf>,

        /// Ask the kernel for debug output
        #[arg(long)]
        debug: bool,
    },

    /// Shut down the kernel serving a document
    Abort {
        input: PathBuf,

        #[arg(long)]
        runtime_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Segment { input, json } => print_segments(&input, json),
        Commands::Convert { input, output } => convert(&input, output),
        Commands::Render { input, to, output } => render(&input, to, output),
        Commands::Execute {
            input,
            to,
            output,
            python,
            script,
            keepalive,
            restart,
            runtime_dir,
            debug,
        } => {
            let mut config = kernel_config(runtime_dir).with_debug(debug);
            if let Some(secs) = keepalive {
                config = config.with_keepalive(Keepalive::from_secs(secs));
            }
            let launcher = ProcessLauncher::python(python, script);
            let daemon = KernelDaemon::new(config, Arc::new(launcher));
            execute(&daemon, &input, to, output, restart).await
        }
        Commands::Abort { input, runtime_dir } => {
            let daemon = KernelDaemon::new(
                kernel_config(runtime_dir),
                Arc::new(ProcessLauncher::new("python3")),
            );
            daemon.abort(&input).await?;
            info!("Kernel for {} stopped", input.display());
            Ok(())
        }
    }
}

fn kernel_config(runtime_dir: Option<PathBuf>) -> KernelConfig {
    let config = KernelConfig::from_env();
    match runtime_dir {
        Some(dir) => config.with_runtime_dir(dir),
        None => config,
    }
}

fn read_segments(input: &Path) -> anyhow::Result<Vec<Segment>> {
    let source = SourceText::from_file(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    Ok(segment(&source))
}

fn print_segments(input: &Path, as_json: bool) -> anyhow::Result<()> {
    let segments = read_segments(input)?;
    if as_json {
        let values: Vec<Value> = segments
            .iter()
            .map(|s| {
                json!({
                    "kind": kind_name(&s.kind),
                    "language": s.language(),
                    "start_line": s.start_line,
                    "options": s.options,
                    "text": s.text(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    for s in &segments {
        let first = s.text().lines().next().unwrap_or_default();
        println!("{:>5}  {:<12} {}", s.start_line + 1, kind_name(&s.kind), first);
    }
    Ok(())
}

fn kind_name(kind: &SegmentKind) -> String {
    match kind {
        SegmentKind::Frontmatter => "frontmatter".to_string(),
        SegmentKind::Markdown => "markdown".to_string(),
        SegmentKind::Raw => "raw".to_string(),
        SegmentKind::Math => "math".to_string(),
        SegmentKind::Code { language } => format!("code:{language}"),
    }
}

fn convert(input: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let segments = read_segments(input)?;
    let notebook = notebook_from_segments(&segments, &KernelspecRegistry::default())?;
    let output = output.unwrap_or_else(|| input.with_extension("ipynb"));
    fs::write(&output, notebook.to_ipynb_string()?)?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn render(input: &Path, profile: TargetProfile, output: Option<PathBuf>) -> anyhow::Result<()> {
    let json = fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let notebook = Notebook::from_ipynb_str(&json)?;
    write_markdown(input, notebook, profile, output)
}

async fn execute(
    daemon: &KernelDaemon,
    input: &Path,
    profile: TargetProfile,
    output: Option<PathBuf>,
    restart: bool,
) -> anyhow::Result<()> {
    let is_notebook = input.extension().is_some_and(|ext| ext == "ipynb");
    let (notebook, mut options) = if is_notebook {
        let json = fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        (Notebook::from_ipynb_str(&json)?, ExecuteOptions::default())
    } else {
        let segments = read_segments(input)?;
        let execute = document_metadata(&segments)
            .and_then(|mut metadata| metadata.remove("execute"))
            .and_then(|execute| execute.as_object().cloned())
            .unwrap_or_default();
        (
            notebook_from_segments(&segments, &KernelspecRegistry::default())?,
            ExecuteOptions::from_document(&execute),
        )
    };
    options.restart |= restart;
    if notebook.cells.iter().all(|cell| !cell.is_code()) {
        bail!("{} has no code to execute", input.display());
    }

    let mut sink = |text: &str| eprint!("{text}");
    let executed = daemon
        .execute_notebook(input, notebook, &options, &mut sink)
        .await?;
    write_markdown(input, executed, profile, output)
}

fn write_markdown(
    input: &Path,
    notebook: Notebook,
    profile: TargetProfile,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let assets = AssetPaths::for_input(input, profile);
    let widgets = match profile {
        TargetProfile::Html => extract_widget_dependencies(&notebook),
        _ => None,
    };

    let output = output.unwrap_or_else(|| default_markdown_output(input));
    if same_file(&output, input) {
        bail!(
            "Refusing to overwrite {} with rendered output; pass a different --output",
            input.display()
        );
    }

    let markdown = to_markdown(notebook, &RenderOptions::new(profile, assets.clone()))?;
    fs::write(&output, markdown)?;
    info!("Wrote {}", output.display());

    if let Some(widgets) = widgets {
        let dir = assets.base_dir.join(&assets.files_dir);
        fs::create_dir_all(&dir)?;
        for (name, html) in [
            ("widgets-in-header.html", &widgets.in_header),
            ("widgets-after-body.html", &widgets.after_body),
        ] {
            if !html.is_empty() {
                fs::write(dir.join(name), html)?;
                info!("Wrote {}", dir.join(name).display());
            }
        }
    }
    Ok(())
}

/// `doc.ipynb` renders to `doc.md`; a markdown input renders to `doc.out.md`
/// so the source document is never replaced.
fn default_markdown_output(input: &Path) -> PathBuf {
    let output = input.with_extension("md");
    if output == input {
        input.with_extension("out.md")
    } else {
        output
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
