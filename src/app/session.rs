use std::{
    cell::{Cell, RefCell},
    path::PathBuf,
    rc::Rc,
};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use scriptloader::{
    attrs::Attributes,
    dom::{
        memory::{MemoryDocument, NodeRef},
        Document, Signal,
    },
    Loader, ScriptOptions, StylesheetOptions,
};

use super::{
    fetch,
    manifest::{AttachPoint, Manifest},
    page::PageReport,
};

struct Completion {
    element: NodeRef,
    signal: Signal,
}

// Shared by every callback the session hands to the loader.
#[derive(Clone)]
struct Page {
    doc: MemoryDocument,
    loader: Loader,
    log: Rc<RefCell<Vec<String>>>,
    requests: Rc<Cell<usize>>,
    chained_attrs: Rc<Attributes>,
}

impl Page {
    fn attach_point(&self, attach: AttachPoint) -> Option<NodeRef> {
        match attach {
            AttachPoint::Head => self.doc.head(),
            AttachPoint::Body => self.doc.body(),
        }
    }

    fn request_script(&self, url: &str, attach: AttachPoint, attrs: Attributes, then: Vec<String>) {
        let request = self.requests.get() + 1;
        self.requests.set(request);

        let on_load = {
            let page = self.clone();
            let url = url.to_owned();
            move || {
                page.log
                    .borrow_mut()
                    .push(format!("#{} loaded {}", request, url));

                for next in then {
                    let attrs = (*page.chained_attrs).clone();
                    page.request_script(&next, AttachPoint::Head, attrs, vec![]);
                }
            }
        };

        let on_error = {
            let log = self.log.clone();
            move |failure: &scriptloader::LoadFailure| {
                log.borrow_mut().push(format!("#{} {}", request, failure));
            }
        };

        let mut options = ScriptOptions::default()
            .attrs(attrs)
            .on_load(on_load)
            .on_error(on_error);
        if let Some(parent) = self.attach_point(attach) {
            options = options.attach_to(parent);
        }

        self.loader.load_script(&self.doc, url, options);
    }
}

/// One run of a manifest against an in-memory page.
pub struct Session {
    manifest: Manifest,
    page: Page,
    // probe sources under this root, or complete every script at once
    fetch_root: Option<PathBuf>,
}

impl Session {
    pub fn new(manifest: Manifest, fetch_root: Option<PathBuf>) -> Self {
        let page = Page {
            doc: MemoryDocument::new(),
            loader: Loader::new(),
            log: Rc::new(RefCell::new(vec![])),
            requests: Rc::new(Cell::new(0)),
            chained_attrs: Rc::new(manifest.default_script_attrs()),
        };

        Session {
            manifest,
            page,
            fetch_root,
        }
    }

    fn request_all(&self) {
        let Session { manifest, page, .. } = self;

        for entry in &manifest.stylesheets {
            let mut options = StylesheetOptions::default().attrs(manifest.stylesheet_attrs(entry));
            if let Some(parent) = page.attach_point(entry.attach) {
                options = options.attach_to(parent);
            }
            page.loader.load_css(&page.doc, &entry.url, options);
        }

        for entry in &manifest.scripts {
            page.request_script(
                &entry.url,
                entry.attach,
                manifest.script_attrs(entry),
                entry.then.clone(),
            );
        }
    }

    /// Issue every request, then deliver completion signals until nothing is in flight.
    pub async fn run(self) -> anyhow::Result<PageReport> {
        let (sender, mut receiver) = mpsc::channel::<Completion>(16);
        let mut in_flight = 0usize;

        self.request_all();

        loop {
            // callbacks may have requested more scripts since the last round
            for (element, src) in self.page.doc.drain_fetches() {
                in_flight += 1;

                let sender = sender.clone();
                let root = self.fetch_root.clone();

                tokio::spawn(async move {
                    let signal = match root {
                        None => Signal::loaded(),
                        Some(root) => match fetch::probe(root, src.clone()).await {
                            Ok(()) => Signal::loaded(),
                            Err(err) => {
                                warn!("Fetching `{}` failed: {:#}", src, err);
                                Signal::Error
                            }
                        },
                    };
                    // error caught on other side
                    let _ = sender.send(Completion { element, signal }).await;
                });
            }

            if in_flight == 0 {
                break;
            }

            let Completion { element, signal } = receiver
                .recv()
                .await
                .context("Failed to receive completion from fetch worker!")?;
            in_flight -= 1;

            self.page.doc.dispatch(element, signal);
        }

        info!("All requests settled");

        let Page { doc, log, .. } = &self.page;
        let head = doc.head().map(|head| doc.inner_html(head)).unwrap_or_default();
        let body = doc.body().map(|body| doc.inner_html(body)).unwrap_or_default();
        let log = log.borrow().clone();

        Ok(PageReport {
            title: self.manifest.page.title.clone(),
            head,
            body,
            log,
        })
    }
}
