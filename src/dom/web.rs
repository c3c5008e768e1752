//! Browser adapter over `web_sys`, plus the page-wide entry points.
//!
//! `loadCSS` / `loadScript` are exported to JavaScript and share one lazily
//! created [`Loader`] per page, so every caller on the page is deduplicated
//! against every other.

use std::{cell::RefCell, rc::Rc};

use anyhow::Context;
use tracing::error;
use wasm_bindgen::{prelude::*, JsCast};
use web_sys::{Element, Event};

use super::{CompletionHandler, Document, Signal};
use crate::{
    attrs::{from_scalars, AttrValue, Attributes, Scalar},
    entry,
    loader::{Callback, Loader},
};

const EVENT_PROPERTIES: &[&str] = &["onload", "onreadystatechange", "onerror"];

thread_local! {
    static PAGE_LOADER: Loader = Loader::new();
}

struct Listeners {
    element: Element,
    // held only to keep the JS callbacks alive
    _on_load: Closure<dyn FnMut(Event)>,
    _on_error: Closure<dyn FnMut(Event)>,
}

#[derive(Clone)]
pub struct WebDocument {
    document: web_sys::Document,
    listeners: Rc<RefCell<Vec<Listeners>>>,
}

fn js_error(value: JsValue) -> anyhow::Error {
    anyhow::anyhow!("{:?}", value)
}

impl WebDocument {
    pub fn new(document: web_sys::Document) -> Self {
        WebDocument {
            document,
            listeners: Rc::new(RefCell::new(vec![])),
        }
    }

    /// The document of the global window.
    pub fn current() -> anyhow::Result<Self> {
        let window = web_sys::window().context("no global window exists")?;
        let document = window.document().context("window has no document")?;
        Ok(Self::new(document))
    }

    fn set_property(element: &Element, name: &str, value: &JsValue) -> anyhow::Result<()> {
        js_sys::Reflect::set(element.as_ref(), &JsValue::from_str(name), value)
            .map(|_| ())
            .map_err(js_error)
    }

    fn remove_listeners(&self, element: &Element) -> Option<Listeners> {
        let mut listeners = self.listeners.borrow_mut();
        let idx = listeners.iter().position(|l| &l.element == element)?;
        Some(listeners.swap_remove(idx))
    }
}

impl Document for WebDocument {
    type Element = Element;

    fn elements_by_tag_name(&self, tag: &str) -> Vec<Element> {
        let collection = self.document.get_elements_by_tag_name(tag);
        (0..collection.length())
            .filter_map(|idx| collection.item(idx))
            .collect()
    }

    fn create_element(&self, tag: &str) -> anyhow::Result<Element> {
        self.document.create_element(tag).map_err(js_error)
    }

    fn head(&self) -> Option<Element> {
        self.document.head().map(Element::from)
    }

    fn body(&self) -> Option<Element> {
        self.document.body().map(Element::from)
    }

    fn append_child(&self, parent: &Element, child: &Element) -> anyhow::Result<()> {
        parent.append_child(child).map(|_| ()).map_err(js_error)
    }

    fn attribute(&self, element: &Element, name: &str) -> Option<String> {
        element.get_attribute(name)
    }

    fn set_attribute(
        &self,
        element: &Element,
        name: &str,
        value: &AttrValue,
    ) -> anyhow::Result<()> {
        match value {
            AttrValue::Text(text) => element.set_attribute(name, text),
            AttrValue::Flag(true) => element.set_attribute(name, ""),
            AttrValue::Flag(false) => element.remove_attribute(name),
        }
        .map_err(js_error)
    }

    fn set_completion_handler(
        &self,
        element: &Element,
        handler: CompletionHandler,
    ) -> anyhow::Result<()> {
        self.clear_completion_handler(element);

        let handler = Rc::new(RefCell::new(handler));

        let on_load = {
            let handler = handler.clone();
            let element = element.clone();
            Closure::wrap(Box::new(move |_event: Event| {
                // only legacy engines expose readyState on script elements
                let ready_state =
                    js_sys::Reflect::get(element.as_ref(), &JsValue::from_str("readyState"))
                        .ok()
                        .and_then(|value| value.as_string());
                (*handler.borrow_mut())(Signal::Load { ready_state });
            }) as Box<dyn FnMut(_)>)
        };

        let on_error = Closure::wrap(Box::new(move |_event: Event| {
            (*handler.borrow_mut())(Signal::Error);
        }) as Box<dyn FnMut(_)>);

        Self::set_property(element, "onload", on_load.as_ref())?;
        Self::set_property(element, "onreadystatechange", on_load.as_ref())?;
        Self::set_property(element, "onerror", on_error.as_ref())?;

        self.listeners.borrow_mut().push(Listeners {
            element: element.clone(),
            _on_load: on_load,
            _on_error: on_error,
        });
        Ok(())
    }

    fn clear_completion_handler(&self, element: &Element) {
        let Some(listeners) = self.remove_listeners(element) else {
            return;
        };

        for property in EVENT_PROPERTIES {
            if let Err(err) = Self::set_property(element, property, &JsValue::NULL) {
                error!("Failed to unset `{}`: {:#}", property, err);
            }
        }

        // we may be running inside one of these closures, release them on a later task
        wasm_bindgen_futures::spawn_local(async move {
            drop(listeners);
        });
    }
}

/// Handle to the loader shared by the whole page.
pub fn page_loader() -> Loader {
    PAGE_LOADER.with(Loader::clone)
}

/// Add a stylesheet to `doc`, or to the global window's document if `doc` is absent.
pub fn load_css(
    url: &str,
    doc: Option<web_sys::Document>,
    attrs: Option<Attributes>,
    attach_to: Option<Element>,
) {
    let doc = doc.map(WebDocument::new);
    entry::load_css(&page_loader(), url, doc, attrs, attach_to, WebDocument::current);
}

/// Load a script into `doc`, or into the global window's document if `doc` is absent.
pub fn load_script(
    url: &str,
    doc: Option<web_sys::Document>,
    attrs: Option<Attributes>,
    callback: Option<Callback>,
    attach_to: Option<Element>,
) {
    let doc = doc.map(WebDocument::new);
    entry::load_script(
        &page_loader(),
        url,
        doc,
        attrs,
        callback,
        attach_to,
        WebDocument::current,
    );
}

fn scalar(value: &JsValue) -> Scalar {
    if let Some(flag) = value.as_bool() {
        Scalar::Bool(flag)
    } else if let Some(text) = value.as_string() {
        Scalar::Text(text)
    } else if let Some(number) = value.as_f64() {
        Scalar::Number(number)
    } else {
        Scalar::Other
    }
}

/// Attributes from a plain JS object. `null`, `undefined` and primitives mean none.
fn attrs_from_js(value: &JsValue) -> Option<Attributes> {
    if !value.is_object() {
        return None;
    }

    let entries = js_sys::Object::entries(value.unchecked_ref());
    let pairs = entries.iter().filter_map(|entry| {
        let pair: js_sys::Array = entry.unchecked_into();
        let key = pair.get(0).as_string()?;
        Some((key, scalar(&pair.get(1))))
    });
    Some(from_scalars(pairs))
}

#[wasm_bindgen(js_name = loadCSS)]
pub fn load_css_js(
    url: &str,
    doc: Option<web_sys::Document>,
    attrs: JsValue,
    attach_to: Option<Element>,
) {
    load_css(url, doc, attrs_from_js(&attrs), attach_to);
}

#[wasm_bindgen(js_name = loadScript)]
pub fn load_script_js(
    url: &str,
    doc: Option<web_sys::Document>,
    attrs: JsValue,
    callback: Option<js_sys::Function>,
    attach_to: Option<Element>,
) {
    let callback = callback.map(|function| {
        Box::new(move || {
            if let Err(err) = function.call0(&JsValue::NULL) {
                error!("Script load callback threw: {:?}", err);
            }
        }) as Callback
    });

    load_script(url, doc, attrs_from_js(&attrs), callback, attach_to);
}
