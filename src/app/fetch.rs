use std::{fmt::Display, path::PathBuf};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use tracing::debug;

#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub enum ResourcePath {
    Local(PathBuf),
    URL(String),
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ResourcePath::*;
        match self {
            Local(path) => write!(f, "local file `{}`", path.display()),
            URL(url) => write!(f, "`{}` over http", url),
        }
    }
}

const URL_REGEX_SPEC: &str = r"^(http|https)://(.+)$";

impl From<String> for ResourcePath {
    fn from(value: String) -> Self {
        static URL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(URL_REGEX_SPEC).unwrap());

        use ResourcePath::*;

        if URL_REGEX.is_match(&value) {
            URL(value)
        } else {
            // query and fragment mean nothing on disk, and paths are relative to the root
            let path = value.split(['?', '#']).next().unwrap_or_default();
            Local(path.trim_start_matches('/').into())
        }
    }
}

/// Check that a script source can be fetched. Local paths resolve under `root`.
pub async fn probe(root: PathBuf, src: String) -> anyhow::Result<()> {
    let resource_path = ResourcePath::from(src);
    debug!("Probing {}", resource_path);

    use ResourcePath::*;
    match resource_path {
        Local(path) => probe_local(root, &path).await,
        URL(url) => probe_url(&url).await,
    }
}

async fn probe_local(mut root: PathBuf, path: &PathBuf) -> anyhow::Result<()> {
    root.push(path);
    let metadata = tokio::fs::metadata(&root)
        .await
        .context(format!("Failed to stat file {}", root.display()))?;

    if !metadata.is_file() {
        anyhow::bail!("{} is not a file", root.display())
    }
    Ok(())
}

async fn probe_url(url: &str) -> anyhow::Result<()> {
    let response = reqwest::get(url).await.context("Failed to get resource!")?;

    if response.status() != StatusCode::OK {
        anyhow::bail!("Status code is {}, not OK.", response.status())
    }
    Ok(())
}
