use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use scriptloader::attrs::{extend, from_toml, is_object, Attributes};

const DEFAULT_TITLE: &str = "Untitled page";

/// A page description: what to request, in which order, with which attributes.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub page: PageConfig,

    #[serde(default)]
    defaults: Defaults,

    #[serde(default, rename = "stylesheet")]
    pub stylesheets: Vec<StylesheetEntry>,

    #[serde(default, rename = "script")]
    pub scripts: Vec<ScriptEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PageConfig {
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for PageConfig {
    fn default() -> Self {
        PageConfig {
            title: default_title(),
        }
    }
}

fn default_title() -> String {
    DEFAULT_TITLE.to_owned()
}

#[derive(Debug, Default, Deserialize)]
struct Defaults {
    script: Option<toml::Value>,
    stylesheet: Option<toml::Value>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachPoint {
    #[default]
    Head,
    Body,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StylesheetEntry {
    pub url: String,
    #[serde(default)]
    pub attach: AttachPoint,
    attrs: Option<toml::Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptEntry {
    pub url: String,
    #[serde(default)]
    pub attach: AttachPoint,
    attrs: Option<toml::Value>,
    // requested once this script has loaded
    #[serde(default)]
    pub then: Vec<String>,
}

impl Manifest {
    pub fn parse(contents: &str) -> anyhow::Result<Manifest> {
        toml::from_str(contents).context("Failed to parse manifest")
    }

    pub async fn read(path: &PathBuf) -> anyhow::Result<Manifest> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context(format!("Failed to read manifest {}", path.display()))?;

        Self::parse(&contents).context(format!("In manifest {}", path.display()))
    }

    /// Attributes every script gets unless its own entry overrides them.
    pub fn default_script_attrs(&self) -> Attributes {
        table_attrs(self.defaults.script.as_ref(), "defaults.script")
    }

    pub fn script_attrs(&self, entry: &ScriptEntry) -> Attributes {
        let mut attrs = self.default_script_attrs();
        extend(&mut attrs, &table_attrs(entry.attrs.as_ref(), &entry.url));
        attrs
    }

    pub fn stylesheet_attrs(&self, entry: &StylesheetEntry) -> Attributes {
        let mut attrs = table_attrs(self.defaults.stylesheet.as_ref(), "defaults.stylesheet");
        extend(&mut attrs, &table_attrs(entry.attrs.as_ref(), &entry.url));
        attrs
    }
}

fn table_attrs(value: Option<&toml::Value>, owner: &str) -> Attributes {
    let Some(value) = value else {
        return Attributes::new();
    };

    if !is_object(value) {
        warn!("Ignoring attrs of `{}`: expected a table, found {}", owner, value.type_str());
        return Attributes::new();
    }

    value.as_table().map(from_toml).unwrap_or_default()
}
