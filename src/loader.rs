//! Script and stylesheet injection with per-URL deduplication.
//!
//! A script URL moves through `Loading` to `Loaded` (or `Failed`) exactly once per
//! [`Loader`]. Requests made while it is loading join a queue and are answered,
//! in the order they were made, when the element's completion signal arrives.
//! Stylesheets carry no state: a `<link>` whose `href` already contains the URL
//! is taken as proof the stylesheet is present.

use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::{
    attrs::{extend, Attributes},
    dom::{exists_on_page, CompletionHandler, Document, Signal},
    error::LoadFailure,
};

// readyState values that mean the script is done
const READY_STATE_REGEX_SPEC: &str = r"loaded|complete";

pub type Callback = Box<dyn FnOnce()>;
pub type ErrorCallback = Box<dyn FnOnce(&LoadFailure)>;

struct Waiter {
    on_load: Option<Callback>,
    on_error: Option<ErrorCallback>,
}

impl Waiter {
    fn loaded(self) {
        if let Some(on_load) = self.on_load {
            on_load()
        }
    }

    fn failed(self, failure: &LoadFailure) {
        if let Some(on_error) = self.on_error {
            on_error(failure)
        }
    }
}

enum State {
    Loading(Vec<Waiter>),
    Loaded,
    Failed(LoadFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Loading,
    Loaded,
    Failed,
}

/// Options for [`Loader::load_script`].
pub struct ScriptOptions<E> {
    attrs: Attributes,
    on_load: Option<Callback>,
    on_error: Option<ErrorCallback>,
    attach_to: Option<E>,
}

impl<E> Default for ScriptOptions<E> {
    fn default() -> Self {
        ScriptOptions {
            attrs: Attributes::new(),
            on_load: None,
            on_error: None,
            attach_to: None,
        }
    }
}

impl<E> ScriptOptions<E> {
    /// Extra attributes, merged over the defaults.
    pub fn attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn on_load(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.on_load = Some(Box::new(callback));
        self
    }

    /// Called instead of `on_load` if the script reports an error or cannot be attached.
    pub fn on_error(mut self, callback: impl FnOnce(&LoadFailure) + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Parent for the new element. Defaults to the document head.
    pub fn attach_to(mut self, element: E) -> Self {
        self.attach_to = Some(element);
        self
    }
}

/// Options for [`Loader::load_css`].
pub struct StylesheetOptions<E> {
    attrs: Attributes,
    attach_to: Option<E>,
}

impl<E> Default for StylesheetOptions<E> {
    fn default() -> Self {
        StylesheetOptions {
            attrs: Attributes::new(),
            attach_to: None,
        }
    }
}

impl<E> StylesheetOptions<E> {
    pub fn attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn attach_to(mut self, element: E) -> Self {
        self.attach_to = Some(element);
        self
    }
}

/// Shared handle to the load state of every script requested through it.
///
/// Cloning is cheap and every clone sees the same state. Not `Send`: all calls and
/// completion signals are expected on one thread, like a page's event loop.
#[derive(Clone, Default)]
pub struct Loader {
    states: Rc<RefCell<HashMap<String, State>>>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, url: &str) -> Option<LoadStatus> {
        self.states.borrow().get(url).map(|state| match state {
            State::Loading(_) => LoadStatus::Loading,
            State::Loaded => LoadStatus::Loaded,
            State::Failed(_) => LoadStatus::Failed,
        })
    }

    /// Number of callbacks waiting on `url`.
    pub fn pending(&self, url: &str) -> usize {
        match self.states.borrow().get(url) {
            Some(State::Loading(waiters)) => waiters.len(),
            _ => 0,
        }
    }

    /// Add a stylesheet `<link>` unless one whose `href` contains `url` is already there.
    pub fn load_css<D: Document>(
        &self,
        doc: &D,
        url: &str,
        options: StylesheetOptions<D::Element>,
    ) {
        if url.is_empty() {
            warn!("Ignoring stylesheet request with an empty url");
            return;
        }

        if exists_on_page(doc, "link", "href", url) {
            debug!("Stylesheet `{}` already on page", url);
            return;
        }

        let StylesheetOptions { attrs, attach_to } = options;

        match attach_stylesheet(doc, url, &attrs, attach_to) {
            Ok(()) => info!("Attached stylesheet `{}`", url),
            Err(err) => error!("Failed to attach stylesheet `{}`: {:#}", url, err),
        }
    }

    /// Make sure the script at `url` is on the page and call `on_load` once it has run.
    ///
    /// Only the first request for a URL creates an element. Later requests wait for
    /// that one, or are answered immediately if it already finished.
    pub fn load_script<D: Document>(
        &self,
        doc: &D,
        url: &str,
        options: ScriptOptions<D::Element>,
    ) {
        let ScriptOptions {
            attrs,
            on_load,
            on_error,
            attach_to,
        } = options;

        if url.is_empty() {
            warn!("Ignoring script request with an empty url");
            return;
        }

        let waiter = Waiter { on_load, on_error };

        // decide under the borrow, run callbacks after it is released
        let mut states = self.states.borrow_mut();
        let settled = match states.entry(url.to_owned()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                State::Loaded => Some((waiter, Ok(()))),
                State::Failed(failure) => Some((waiter, Err(failure.clone()))),
                State::Loading(waiters) => {
                    waiters.push(waiter);
                    debug!("Script `{}` already loading, {} waiting", url, waiters.len());
                    return;
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(State::Loading(vec![waiter]));
                None
            }
        };
        drop(states);

        match settled {
            Some((waiter, Ok(()))) => waiter.loaded(),
            Some((waiter, Err(failure))) => waiter.failed(&failure),
            None => {
                if let Err(err) = self.attach_script(doc, url, &attrs, attach_to) {
                    error!("Failed to attach script `{}`: {:#}", url, err);
                    self.fail(
                        url,
                        LoadFailure::Dom {
                            url: url.to_owned(),
                            reason: format!("{:#}", err),
                        },
                    );
                }
            }
        }
    }

    fn attach_script<D: Document>(
        &self,
        doc: &D,
        url: &str,
        extra: &Attributes,
        attach_to: Option<D::Element>,
    ) -> anyhow::Result<()> {
        let parent = attach_point(doc, attach_to)?;
        let script = doc.create_element("script")?;

        let mut attrs = Attributes::new();
        attrs.insert("type".into(), "text/javascript".into());
        attrs.insert("src".into(), url.into());
        attrs.insert("async".into(), true.into());
        attrs.insert("defer".into(), true.into());
        extend(&mut attrs, extra);
        apply_attributes(doc, &script, &attrs)?;

        let handler = self.completion_handler(doc.clone(), url.to_owned(), script.clone());
        doc.set_completion_handler(&script, handler)?;

        if let Err(err) = doc.append_child(&parent, &script) {
            doc.clear_completion_handler(&script);
            return Err(err);
        }

        info!("Requested script `{}`", url);
        Ok(())
    }

    fn completion_handler<D: Document>(
        &self,
        doc: D,
        url: String,
        script: D::Element,
    ) -> CompletionHandler {
        let loader = self.clone();
        let mut script = Some(script);

        Box::new(move |signal| {
            let outcome = match &signal {
                Signal::Load { ready_state } if is_complete(ready_state.as_deref()) => Ok(()),
                Signal::Load { ready_state } => {
                    debug!("Script `{}` in ready state {:?}", url, ready_state);
                    return;
                }
                Signal::Error => Err(LoadFailure::Network { url: url.clone() }),
            };

            // drop the handler and our reference to the element
            if let Some(script) = script.take() {
                doc.clear_completion_handler(&script);
            }

            match outcome {
                Ok(()) => loader.complete(&url),
                Err(failure) => loader.fail(&url, failure),
            }
        })
    }

    fn complete(&self, url: &str) {
        let Some(waiters) = self.settle(url, State::Loaded) else {
            debug!("Ignoring completion of `{}`: not loading", url);
            return;
        };

        info!("Loaded script `{}`, notifying {} waiter(s)", url, waiters.len());
        for waiter in waiters {
            waiter.loaded();
        }
    }

    fn fail(&self, url: &str, failure: LoadFailure) {
        let Some(waiters) = self.settle(url, State::Failed(failure.clone())) else {
            debug!("Ignoring failure of `{}`: not loading", url);
            return;
        };

        warn!("{}, notifying {} waiter(s)", failure, waiters.len());
        for waiter in waiters {
            waiter.failed(&failure);
        }
    }

    // Move a loading url to its final state and hand back its queue. The entry is
    // replaced before any waiter runs, so a waiter asking for the same url again
    // is answered from the final state.
    fn settle(&self, url: &str, next: State) -> Option<Vec<Waiter>> {
        let mut states = self.states.borrow_mut();

        if !matches!(states.get(url), Some(State::Loading(_))) {
            return None;
        }

        match states.insert(url.to_owned(), next) {
            Some(State::Loading(waiters)) => Some(waiters),
            _ => None,
        }
    }
}

fn is_complete(ready_state: Option<&str>) -> bool {
    static READY_STATE_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(READY_STATE_REGEX_SPEC).unwrap());

    match ready_state {
        None => true,
        Some(state) => READY_STATE_REGEX.is_match(state),
    }
}

fn attach_point<D: Document>(
    doc: &D,
    attach_to: Option<D::Element>,
) -> anyhow::Result<D::Element> {
    attach_to
        .or_else(|| doc.head())
        .or_else(|| doc.body())
        .context("Document has no head or body to attach to")
}

fn attach_stylesheet<D: Document>(
    doc: &D,
    url: &str,
    extra: &Attributes,
    attach_to: Option<D::Element>,
) -> anyhow::Result<()> {
    let parent = attach_point(doc, attach_to)?;
    let link = doc.create_element("link")?;

    let mut attrs = Attributes::new();
    attrs.insert("rel".into(), "stylesheet".into());
    attrs.insert("type".into(), "text/css".into());
    attrs.insert("href".into(), url.into());
    attrs.insert("media".into(), "all".into());
    extend(&mut attrs, extra);
    apply_attributes(doc, &link, &attrs)?;

    doc.append_child(&parent, &link)
}

fn apply_attributes<D: Document>(
    doc: &D,
    element: &D::Element,
    attrs: &Attributes,
) -> anyhow::Result<()> {
    for (name, value) in attrs {
        doc.set_attribute(element, name, value)
            .context(format!("Failed to set attribute `{}`", name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attrs::AttrValue,
        dom::memory::{MemoryDocument, NodeRef},
    };

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) -> impl FnOnce() + 'static {
        let log = log.clone();
        move || log.borrow_mut().push(entry)
    }

    fn only_fetch(doc: &MemoryDocument) -> NodeRef {
        let fetches = doc.drain_fetches();
        assert_eq!(fetches.len(), 1, "expected exactly one fetch: {:?}", fetches);
        fetches[0].0
    }

    #[test]
    fn test_concurrent_requests_share_one_element() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        loader.load_script(&doc, "a.js", ScriptOptions::default().on_load(record(&log, "cb1")));
        loader.load_script(&doc, "a.js", ScriptOptions::default().on_load(record(&log, "cb2")));

        let scripts = doc.elements_by_tag_name("script");
        assert_eq!(scripts.len(), 1);
        assert_eq!(doc.attribute(&scripts[0], "src").as_deref(), Some("a.js"));
        assert_eq!(loader.status("a.js"), Some(LoadStatus::Loading));
        assert_eq!(loader.pending("a.js"), 2);
        assert!(log.borrow().is_empty());

        let script = only_fetch(&doc);
        assert!(doc.dispatch(script, Signal::loaded()));

        assert_eq!(*log.borrow(), vec!["cb1", "cb2"]);
        assert_eq!(loader.status("a.js"), Some(LoadStatus::Loaded));
        assert_eq!(loader.pending("a.js"), 0);
    }

    #[test]
    fn test_many_requests_fire_in_order_exactly_once() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();
        let names = ["one", "two", "three", "four", "five"];

        for name in names {
            let options = ScriptOptions::default().on_load(record(&log, name));
            loader.load_script(&doc, "lib.js", options);
        }
        assert_eq!(doc.elements_by_tag_name("script").len(), 1);

        let script = only_fetch(&doc);
        doc.dispatch(script, Signal::loaded());
        // handler is gone, a late duplicate signal does nothing
        assert!(!doc.dispatch(script, Signal::loaded()));

        assert_eq!(*log.borrow(), names.to_vec());
    }

    #[test]
    fn test_loaded_script_calls_back_synchronously() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        loader.load_script(&doc, "a.js", ScriptOptions::default());
        doc.dispatch(only_fetch(&doc), Signal::loaded());

        loader.load_script(&doc, "a.js", ScriptOptions::default().on_load(record(&log, "late")));

        assert_eq!(*log.borrow(), vec!["late"]);
        assert_eq!(doc.elements_by_tag_name("script").len(), 1);
        assert!(doc.drain_fetches().is_empty());
    }

    #[test]
    fn test_callback_requesting_same_url_is_answered_immediately() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        let doc_ = doc.clone();
        let loader_ = loader.clone();
        let log_ = log.clone();
        loader.load_script(
            &doc,
            "a.js",
            ScriptOptions::default().on_load(move || {
                log_.borrow_mut().push("outer");
                let options = ScriptOptions::default().on_load(record(&log_, "inner"));
                loader_.load_script(&doc_, "a.js", options);
            }),
        );
        loader.load_script(&doc, "a.js", ScriptOptions::default().on_load(record(&log, "second")));

        doc.dispatch(only_fetch(&doc), Signal::loaded());

        assert_eq!(*log.borrow(), vec!["outer", "inner", "second"]);
        assert_eq!(doc.elements_by_tag_name("script").len(), 1);
    }

    #[test]
    fn test_intermediate_ready_state_is_ignored() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        let options = ScriptOptions::default().on_load(record(&log, "done"));
        loader.load_script(&doc, "legacy.js", options);
        let script = only_fetch(&doc);

        doc.dispatch(script, Signal::Load { ready_state: Some("loading".into()) });
        assert!(log.borrow().is_empty());
        assert!(doc.has_completion_handler(script));

        doc.dispatch(script, Signal::Load { ready_state: Some("complete".into()) });
        assert_eq!(*log.borrow(), vec!["done"]);
        assert!(!doc.has_completion_handler(script));
    }

    #[test]
    fn test_loaded_ready_state_completes() {
        assert!(is_complete(None));
        assert!(is_complete(Some("loaded")));
        assert!(is_complete(Some("complete")));
        assert!(!is_complete(Some("interactive")));
        assert!(!is_complete(Some("uninitialized")));
    }

    #[test]
    fn test_error_signal_fails_all_waiters() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();
        let failures = Rc::new(RefCell::new(vec![]));

        for name in ["first", "second"] {
            let failures = failures.clone();
            loader.load_script(
                &doc,
                "missing.js",
                ScriptOptions::default()
                    .on_load(record(&log, name))
                    .on_error(move |failure| failures.borrow_mut().push(failure.clone())),
            );
        }

        let script = only_fetch(&doc);
        doc.dispatch(script, Signal::Error);

        let expected = LoadFailure::Network {
            url: "missing.js".into(),
        };
        assert!(log.borrow().is_empty());
        assert_eq!(*failures.borrow(), vec![expected.clone(), expected.clone()]);
        assert_eq!(loader.status("missing.js"), Some(LoadStatus::Failed));
        assert!(!doc.has_completion_handler(script));

        // later requests fail fast without a new element
        let failures_ = failures.clone();
        loader.load_script(
            &doc,
            "missing.js",
            ScriptOptions::default()
                .on_error(move |failure| failures_.borrow_mut().push(failure.clone())),
        );
        assert_eq!(failures.borrow().len(), 3);
        assert_eq!(doc.elements_by_tag_name("script").len(), 1);
    }

    #[test]
    fn test_unsignalled_script_stays_pending() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        let options = ScriptOptions::default().on_load(record(&log, "never"));
        loader.load_script(&doc, "slow.js", options);

        assert!(log.borrow().is_empty());
        assert_eq!(loader.status("slow.js"), Some(LoadStatus::Loading));
        assert_eq!(loader.status("other.js"), None);
    }

    #[test]
    fn test_script_default_and_extra_attributes() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();

        let mut extra = Attributes::new();
        extra.insert("type".into(), "module".into());
        extra.insert("defer".into(), false.into());
        extra.insert("data-main".into(), "app".into());

        loader.load_script(&doc, "app.js", ScriptOptions::default().attrs(extra));

        let script = doc.elements_by_tag_name("script")[0];
        assert_eq!(doc.attribute(&script, "type").as_deref(), Some("module"));
        assert_eq!(doc.attribute(&script, "src").as_deref(), Some("app.js"));
        assert_eq!(doc.attribute(&script, "async").as_deref(), Some(""));
        assert_eq!(doc.attribute(&script, "defer"), None);
        assert_eq!(doc.attribute(&script, "data-main").as_deref(), Some("app"));
    }

    #[test]
    fn test_script_attach_point() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let body = doc.body().unwrap();

        loader.load_script(&doc, "head.js", ScriptOptions::default());
        loader.load_script(&doc, "body.js", ScriptOptions::default().attach_to(body));

        let scripts = doc.elements_by_tag_name("script");
        assert_eq!(doc.parent(scripts[0]), doc.head());
        assert_eq!(doc.parent(scripts[1]), Some(body));
    }

    #[test]
    fn test_attach_failure_reports_dom_error() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let failures = Rc::new(RefCell::new(vec![]));

        // a node handle from a larger document does not exist in `doc`
        let foreign = {
            let other = MemoryDocument::new();
            for _ in 0..16 {
                other.create_element("div").unwrap();
            }
            other.create_element("div").unwrap()
        };

        let failures_ = failures.clone();
        loader.load_script(
            &doc,
            "broken.js",
            ScriptOptions::default()
                .attach_to(foreign)
                .on_error(move |failure| failures_.borrow_mut().push(failure.clone())),
        );

        assert_eq!(failures.borrow().len(), 1);
        assert!(matches!(
            &failures.borrow()[0],
            LoadFailure::Dom { url, .. } if url == "broken.js"
        ));
        assert_eq!(loader.status("broken.js"), Some(LoadStatus::Failed));
        assert!(doc.elements_by_tag_name("script").is_empty());
    }

    #[test]
    fn test_detached_parent_defers_fetch() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let container = doc.create_element("div").unwrap();

        loader.load_script(&doc, "later.js", ScriptOptions::default().attach_to(container));

        assert!(doc.drain_fetches().is_empty());
        assert_eq!(loader.status("later.js"), Some(LoadStatus::Loading));

        // the fetch starts once the container joins the page
        doc.append_child(&doc.body().unwrap(), &container).unwrap();
        assert_eq!(doc.drain_fetches().len(), 1);
    }

    #[test]
    fn test_empty_url_is_ignored() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let log = Log::default();

        loader.load_script(&doc, "", ScriptOptions::default().on_load(record(&log, "cb")));
        loader.load_css(&doc, "", StylesheetOptions::default());

        assert!(log.borrow().is_empty());
        assert!(doc.elements_by_tag_name("script").is_empty());
        assert!(doc.elements_by_tag_name("link").is_empty());
    }

    #[test]
    fn test_loaders_do_not_share_state() {
        let doc = MemoryDocument::new();
        let first = Loader::new();
        let second = Loader::new();

        first.load_script(&doc, "a.js", ScriptOptions::default());
        second.load_script(&doc, "a.js", ScriptOptions::default());

        assert_eq!(doc.elements_by_tag_name("script").len(), 2);
    }

    #[test]
    fn test_stylesheet_requested_twice_creates_one_link() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();

        loader.load_css(&doc, "theme.css", StylesheetOptions::default());
        loader.load_css(&doc, "theme.css", StylesheetOptions::default());

        let links = doc.elements_by_tag_name("link");
        assert_eq!(links.len(), 1);
        assert_eq!(doc.attribute(&links[0], "href").as_deref(), Some("theme.css"));
        assert_eq!(doc.attribute(&links[0], "rel").as_deref(), Some("stylesheet"));
        assert_eq!(doc.attribute(&links[0], "type").as_deref(), Some("text/css"));
        assert_eq!(doc.attribute(&links[0], "media").as_deref(), Some("all"));
    }

    #[test]
    fn test_stylesheet_substring_guard_ignores_case() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();

        loader.load_css(&doc, "/assets/Site-Theme.css", StylesheetOptions::default());
        loader.load_css(&doc, "site-theme", StylesheetOptions::default());
        loader.load_css(&doc, "THEME.CSS", StylesheetOptions::default());
        assert_eq!(doc.elements_by_tag_name("link").len(), 1);

        loader.load_css(&doc, "print.css", StylesheetOptions::default());
        assert_eq!(doc.elements_by_tag_name("link").len(), 2);
    }

    #[test]
    fn test_stylesheet_extra_attributes_override_defaults() {
        let doc = MemoryDocument::new();
        let loader = Loader::new();
        let body = doc.body().unwrap();

        let mut extra = Attributes::new();
        extra.insert("media".into(), AttrValue::Text("print".into()));
        extra.insert("id".into(), "print-styles".into());

        loader.load_css(
            &doc,
            "print.css",
            StylesheetOptions::default().attrs(extra).attach_to(body),
        );

        let link = doc.elements_by_tag_name("link")[0];
        assert_eq!(doc.parent(link), Some(body));
        assert_eq!(doc.attribute(&link, "media").as_deref(), Some("print"));
        assert_eq!(doc.attribute(&link, "id").as_deref(), Some("print-styles"));
    }
}
