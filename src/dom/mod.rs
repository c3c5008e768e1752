// Everything the loader needs from a document, behind one trait so the
// state machine can run against a real page or an in-memory tree.

pub mod memory;
#[cfg(feature = "web")]
pub mod web;

use crate::attrs::AttrValue;

/// Completion signal delivered by an element's load machinery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// `onload` / `onreadystatechange`. `ready_state` is `None` when the element has
    /// no `readyState` property, which means it always completes.
    Load { ready_state: Option<String> },
    /// `onerror`.
    Error,
}

impl Signal {
    pub fn loaded() -> Self {
        Signal::Load { ready_state: None }
    }
}

pub type CompletionHandler = Box<dyn FnMut(Signal)>;

pub trait Document: Clone + 'static {
    type Element: Clone + 'static;

    /// Attached elements with the given tag, in document order.
    fn elements_by_tag_name(&self, tag: &str) -> Vec<Self::Element>;

    fn create_element(&self, tag: &str) -> anyhow::Result<Self::Element>;

    fn head(&self) -> Option<Self::Element>;

    fn body(&self) -> Option<Self::Element>;

    fn append_child(&self, parent: &Self::Element, child: &Self::Element) -> anyhow::Result<()>;

    fn attribute(&self, element: &Self::Element, name: &str) -> Option<String>;

    fn set_attribute(
        &self,
        element: &Self::Element,
        name: &str,
        value: &AttrValue,
    ) -> anyhow::Result<()>;

    /// Install `handler` for load, ready-state and error events of `element`,
    /// replacing any previous handler.
    fn set_completion_handler(
        &self,
        element: &Self::Element,
        handler: CompletionHandler,
    ) -> anyhow::Result<()>;

    /// Must be safe to call from inside the handler being cleared.
    fn clear_completion_handler(&self, element: &Self::Element);
}

/// Whether some `tag` element has an `attr` containing `value`, ignoring case.
pub fn exists_on_page<D: Document>(doc: &D, tag: &str, attr: &str, value: &str) -> bool {
    let value = value.to_lowercase();

    doc.elements_by_tag_name(tag).iter().any(|element| {
        doc.attribute(element, attr)
            .is_some_and(|found| found.to_lowercase().contains(&value))
    })
}
