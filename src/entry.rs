//! Page-level `loadCSS(url, doc?, attrs?, attachEl?)` and
//! `loadScript(url, doc?, attrs?, callback?, attachEl?)`.
//!
//! Arguments keep the positions callers on a page use. An absent document
//! falls back to `default_doc`, absent attributes to none, and an absent
//! attach point to the document head.

use tracing::error;

use crate::{
    attrs::Attributes,
    dom::Document,
    loader::{Callback, Loader, ScriptOptions, StylesheetOptions},
};

fn resolve<D>(
    doc: Option<D>,
    default_doc: impl FnOnce() -> anyhow::Result<D>,
) -> anyhow::Result<D> {
    match doc {
        Some(doc) => Ok(doc),
        None => default_doc(),
    }
}

pub fn load_css<D: Document>(
    loader: &Loader,
    url: &str,
    doc: Option<D>,
    attrs: Option<Attributes>,
    attach_to: Option<D::Element>,
    default_doc: impl FnOnce() -> anyhow::Result<D>,
) {
    let doc = match resolve(doc, default_doc) {
        Ok(doc) => doc,
        Err(err) => {
            error!("Cannot load stylesheet `{}`: {:#}", url, err);
            return;
        }
    };

    let mut options = StylesheetOptions::default().attrs(attrs.unwrap_or_default());
    if let Some(element) = attach_to {
        options = options.attach_to(element);
    }
    loader.load_css(&doc, url, options);
}

pub fn load_script<D: Document>(
    loader: &Loader,
    url: &str,
    doc: Option<D>,
    attrs: Option<Attributes>,
    callback: Option<Callback>,
    attach_to: Option<D::Element>,
    default_doc: impl FnOnce() -> anyhow::Result<D>,
) {
    let doc = match resolve(doc, default_doc) {
        Ok(doc) => doc,
        Err(err) => {
            error!("Cannot load script `{}`: {:#}", url, err);
            return;
        }
    };

    let mut options = ScriptOptions::default().attrs(attrs.unwrap_or_default());
    if let Some(callback) = callback {
        options = options.on_load(callback);
    }
    if let Some(element) = attach_to {
        options = options.attach_to(element);
    }
    loader.load_script(&doc, url, options);
}
