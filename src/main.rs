mod app;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about=None)]
struct CLIArguments {
    #[arg(short, long, default_value = "./page.toml")]
    manifest: String,

    /// Directory local script sources are resolved against with --fetch
    #[arg(short, long, default_value = ".")]
    root: String,

    /// Probe every script source instead of completing it immediately
    #[arg(short, long, default_value_t = false)]
    fetch: bool,

    /// Handlebars template for the rendered page
    #[arg(short, long)]
    template: Option<String>,

    #[arg(short, long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let CLIArguments {
        manifest,
        root,
        fetch,
        template,
        output,
    } = CLIArguments::parse();

    let manifest = PathBuf::from(manifest);
    let root = PathBuf::from(root);

    info!("Loading page from `{}`.", manifest.display());

    if fetch {
        info!("Probing script sources under `{}`.", root.display());
    }

    let manifest = app::Manifest::read(&manifest).await?;
    let report = app::Session::new(manifest, fetch.then_some(root))
        .run()
        .await?;

    let template = match template {
        Some(path) => Some(
            tokio::fs::read_to_string(&path)
                .await
                .context(format!("Failed to read template {}", path))?,
        ),
        None => None,
    };

    let html = app::render(&report, template.as_deref())?;

    match output {
        Some(path) => tokio::fs::write(&path, html)
            .await
            .context(format!("Failed to write page to {}", path))?,
        None => println!("{html}"),
    }

    Ok(())
}
