use std::{cell::RefCell, rc::Rc};

use anyhow::Context;

use super::{CompletionHandler, Document, Signal};
use crate::attrs::{AttrValue, Attributes};

const ROOT: usize = 0;
const HEAD: usize = 1;
const BODY: usize = 2;

const VOID_TAGS: &[&str] = &["link", "meta", "base", "br", "img", "input"];

/// Handle to a node of a [`MemoryDocument`]. Only meaningful for the document
/// that created it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct NodeRef(usize);

type SharedHandler = Rc<RefCell<CompletionHandler>>;

struct Node {
    tag: String,
    attrs: Attributes,
    parent: Option<usize>,
    children: Vec<usize>,
    handler: Option<SharedHandler>,
    // a script is fetched once, the first time it is connected
    started: bool,
}

impl Node {
    fn new(tag: &str) -> Self {
        Node {
            tag: tag.to_lowercase(),
            attrs: Attributes::new(),
            parent: None,
            children: vec![],
            handler: None,
            started: false,
        }
    }
}

struct Tree {
    nodes: Vec<Node>,
    // scripts attached with a src, waiting for someone to fetch them
    fetches: Vec<(NodeRef, String)>,
}

/// A bare `html/head/body` tree.
///
/// Attaching a `<script src>` records a fetch request instead of fetching, the
/// owner drains those with [`MemoryDocument::drain_fetches`] and answers them with
/// [`MemoryDocument::dispatch`].
#[derive(Clone)]
pub struct MemoryDocument {
    tree: Rc<RefCell<Tree>>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let mut nodes = vec![Node::new("html"), Node::new("head"), Node::new("body")];
        nodes[ROOT].children = vec![HEAD, BODY];
        nodes[HEAD].parent = Some(ROOT);
        nodes[BODY].parent = Some(ROOT);

        MemoryDocument {
            tree: Rc::new(RefCell::new(Tree {
                nodes,
                fetches: vec![],
            })),
        }
    }

    pub fn drain_fetches(&self) -> Vec<(NodeRef, String)> {
        std::mem::take(&mut self.tree.borrow_mut().fetches)
    }

    /// Fire the completion handler of `element`. Returns false if none is installed.
    pub fn dispatch(&self, element: NodeRef, signal: Signal) -> bool {
        // the handler may touch the document, so no borrow is held while it runs
        let handler = {
            let tree = self.tree.borrow();
            tree.nodes.get(element.0).and_then(|node| node.handler.clone())
        };

        match handler {
            Some(handler) => {
                (*handler.borrow_mut())(signal);
                true
            }
            None => false,
        }
    }

    pub fn has_completion_handler(&self, element: NodeRef) -> bool {
        let tree = self.tree.borrow();
        tree.nodes
            .get(element.0)
            .is_some_and(|node| node.handler.is_some())
    }

    pub fn tag_name(&self, element: NodeRef) -> Option<String> {
        let tree = self.tree.borrow();
        tree.nodes.get(element.0).map(|node| node.tag.clone())
    }

    pub fn parent(&self, element: NodeRef) -> Option<NodeRef> {
        let tree = self.tree.borrow();
        tree.nodes
            .get(element.0)
            .and_then(|node| node.parent)
            .map(NodeRef)
    }

    /// Serialized children of `element`, one per line.
    pub fn inner_html(&self, element: NodeRef) -> String {
        let tree = self.tree.borrow();
        let mut out = vec![];
        if let Some(node) = tree.nodes.get(element.0) {
            for child in &node.children {
                let mut buf = String::new();
                write_node(&tree, *child, &mut buf);
                out.push(buf);
            }
        }
        out.join("\n")
    }

    fn is_connected(tree: &Tree, mut id: usize) -> bool {
        loop {
            if id == ROOT {
                return true;
            }
            match tree.nodes[id].parent {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    fn start_scripts(tree: &mut Tree, id: usize) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let node = &mut tree.nodes[id];
            stack.extend(node.children.iter().rev());

            if node.tag != "script" || node.started {
                continue;
            }
            let src = node.attrs.get("src").and_then(AttrValue::as_text).map(str::to_owned);
            if let Some(src) = src {
                node.started = true;
                tree.fetches.push((NodeRef(id), src));
            }
        }
    }

    fn is_ancestor(tree: &Tree, ancestor: usize, mut id: usize) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match tree.nodes[id].parent {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }
}

fn write_node(tree: &Tree, id: usize, buf: &mut String) {
    let node = &tree.nodes[id];

    buf.push('<');
    buf.push_str(&node.tag);
    for (name, value) in &node.attrs {
        match value {
            AttrValue::Text(text) => {
                buf.push_str(&format!(" {}=\"{}\"", name, escape(text)));
            }
            AttrValue::Flag(true) => {
                buf.push(' ');
                buf.push_str(name);
            }
            AttrValue::Flag(false) => {}
        }
    }
    buf.push('>');

    if VOID_TAGS.contains(&node.tag.as_str()) {
        return;
    }

    for child in &node.children {
        write_node(tree, *child, buf);
    }
    buf.push_str(&format!("</{}>", node.tag));
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

impl Document for MemoryDocument {
    type Element = NodeRef;

    fn elements_by_tag_name(&self, tag: &str) -> Vec<NodeRef> {
        let tree = self.tree.borrow();
        let tag = tag.to_lowercase();

        // pre-order walk from the root gives document order
        let mut found = vec![];
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &tree.nodes[id];
            if node.tag == tag {
                found.push(NodeRef(id));
            }
            stack.extend(node.children.iter().rev());
        }
        found
    }

    fn create_element(&self, tag: &str) -> anyhow::Result<NodeRef> {
        if tag.is_empty() {
            anyhow::bail!("Cannot create an element without a tag name");
        }

        let mut tree = self.tree.borrow_mut();
        tree.nodes.push(Node::new(tag));
        Ok(NodeRef(tree.nodes.len() - 1))
    }

    fn head(&self) -> Option<NodeRef> {
        Some(NodeRef(HEAD))
    }

    fn body(&self) -> Option<NodeRef> {
        Some(NodeRef(BODY))
    }

    fn append_child(&self, parent: &NodeRef, child: &NodeRef) -> anyhow::Result<()> {
        let mut tree = self.tree.borrow_mut();

        if parent.0 >= tree.nodes.len() || child.0 >= tree.nodes.len() {
            anyhow::bail!("Unknown node in append_child");
        }
        if child.0 == ROOT || Self::is_ancestor(&tree, child.0, parent.0) {
            anyhow::bail!("Cannot append a node inside itself");
        }

        if let Some(old_parent) = tree.nodes[child.0].parent.take() {
            tree.nodes[old_parent].children.retain(|id| *id != child.0);
        }
        tree.nodes[child.0].parent = Some(parent.0);
        tree.nodes[parent.0].children.push(child.0);

        if Self::is_connected(&tree, child.0) {
            Self::start_scripts(&mut tree, child.0);
        }

        Ok(())
    }

    fn attribute(&self, element: &NodeRef, name: &str) -> Option<String> {
        let tree = self.tree.borrow();
        match tree.nodes.get(element.0)?.attrs.get(name)? {
            AttrValue::Text(text) => Some(text.clone()),
            AttrValue::Flag(true) => Some(String::new()),
            AttrValue::Flag(false) => None,
        }
    }

    fn set_attribute(
        &self,
        element: &NodeRef,
        name: &str,
        value: &AttrValue,
    ) -> anyhow::Result<()> {
        let mut tree = self.tree.borrow_mut();
        let node = tree
            .nodes
            .get_mut(element.0)
            .context(format!("Unknown node {:?}", element))?;

        match value {
            AttrValue::Flag(false) => {
                node.attrs.shift_remove(name);
            }
            _ => {
                node.attrs.insert(name.to_owned(), value.clone());
            }
        }
        Ok(())
    }

    fn set_completion_handler(
        &self,
        element: &NodeRef,
        handler: CompletionHandler,
    ) -> anyhow::Result<()> {
        let mut tree = self.tree.borrow_mut();
        let node = tree
            .nodes
            .get_mut(element.0)
            .context(format!("Unknown node {:?}", element))?;

        node.handler = Some(Rc::new(RefCell::new(handler)));
        Ok(())
    }

    fn clear_completion_handler(&self, element: &NodeRef) {
        // dispatch holds its own Rc, so dropping ours here is fine mid-call
        if let Some(node) = self.tree.borrow_mut().nodes.get_mut(element.0) {
            node.handler = None;
        }
    }
}
