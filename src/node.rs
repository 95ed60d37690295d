//! UI trees handed to the page.
//!
//! A [`Node`] is plain data except for attributes that reference server
//! objects (callbacks, files, virtual files, values). Those are registered
//! with the session when the tree is rendered and replaced by ids or URLs.

use std::path::PathBuf;

use serde_json::Value;

use crate::registry::{Anchor, Callback, VirtualFile};

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
    /// Markup inserted verbatim.
    Raw(String),
    Fragment(Vec<Node>),
}

impl Node {
    pub fn el(tag: impl Into<String>) -> Element {
        Element::new(tag)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    pub fn raw(markup: impl Into<String>) -> Self {
        Node::Raw(markup.into())
    }

    /// Plain text becomes a `span` so it can be targeted like any element.
    pub(crate) fn into_element_node(self) -> Node {
        match self {
            Node::Text(text) => Node::Element(Element::new("span").text(text)),
            other => other,
        }
    }
}

impl From<Element> for Node {
    fn from(el: Element) -> Self {
        Node::Element(el)
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Node::Text(text.to_string())
    }
}

impl From<String> for Node {
    fn from(text: String) -> Self {
        Node::Text(text)
    }
}

impl From<Vec<Node>> for Node {
    fn from(nodes: Vec<Node>) -> Self {
        Node::Fragment(nodes)
    }
}

#[derive(Debug, Clone)]
pub enum Attr {
    Text(String),
    /// Boolean attribute, rendered without a value.
    Flag,
    /// Rendered as a client call to the registered callback.
    Callback(Callback),
    /// Rendered as `obj#<id>`; the value stays on the server.
    Reference(Value),
    /// Rendered as the session's URL for the local file.
    File(PathBuf),
    VFile(VirtualFile),
}

/// A stylesheet or script the content needs in the document head.
/// Emitted once per session, keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Stylesheet(String),
    Script { src: String, module: bool },
}

impl Resource {
    pub fn key(&self) -> &str {
        match self {
            Resource::Stylesheet(href) => href,
            Resource::Script { src, .. } => src,
        }
    }
}

/// Code run after the content is inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub code: String,
    pub module: bool,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, Attr)>,
    pub children: Vec<Node>,
    pub resources: Vec<Resource>,
    pub scripts: Vec<Script>,
    /// Markup the representer appends in a hidden container instead of
    /// inline, e.g. templates or dialog bodies.
    pub hidden: Vec<Node>,
    pub anchor: Option<Anchor>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            resources: Vec::new(),
            scripts: Vec::new(),
            hidden: Vec::new(),
            anchor: None,
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), Attr::Text(value.into())));
        self
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.attrs.push((name.into(), Attr::Flag));
        self
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.attr("id", id)
    }

    pub fn class(self, class: impl Into<String>) -> Self {
        self.attr("class", class)
    }

    /// Bind a DOM event (`click`, `input`, ...) to a server callback. When
    /// the element carries an anchor the callback is tied to it.
    pub fn on(mut self, event: &str, callback: Callback) -> Self {
        let callback = match &self.anchor {
            Some(anchor) => callback.anchored(anchor),
            None => callback,
        };
        self.attrs
            .push((format!("on{event}"), Attr::Callback(callback)));
        self
    }

    pub fn reference(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attrs.push((name.into(), Attr::Reference(value)));
        self
    }

    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.attrs.push((name.into(), Attr::File(path.into())));
        self
    }

    pub fn vfile(mut self, name: impl Into<String>, file: VirtualFile) -> Self {
        self.attrs.push((name.into(), Attr::VFile(file)));
        self
    }

    /// Anchor callbacks bound after this call.
    pub fn anchored(mut self, anchor: &Anchor) -> Self {
        self.anchor = Some(anchor.clone());
        self
    }

    pub fn child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn children<I, N>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.child(Node::Text(text.into()))
    }

    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn script(mut self, code: impl Into<String>) -> Self {
        self.scripts.push(Script {
            code: code.into(),
            module: false,
        });
        self
    }

    pub fn module_script(mut self, code: impl Into<String>) -> Self {
        self.scripts.push(Script {
            code: code.into(),
            module: true,
        });
        self
    }

    pub fn hidden(mut self, node: impl Into<Node>) -> Self {
        self.hidden.push(node.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_wrapped_in_span() {
        match Node::from("hi").into_element_node() {
            Node::Element(el) => {
                assert_eq!(el.tag, "span");
                assert!(matches!(&el.children[0], Node::Text(t) if t == "hi"));
            }
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn builder_collects_attrs_and_children() {
        let el = Node::el("div")
            .id("root")
            .flag("hidden")
            .child(Node::el("b").text("x"))
            .children(["a", "b"]);
        assert_eq!(el.attrs.len(), 2);
        assert_eq!(el.children.len(), 3);
    }

    #[test]
    fn on_uses_element_anchor() {
        let anchor = Anchor::new();
        let el = Node::el("button")
            .anchored(&anchor)
            .on("click", Callback::new(|_| async { Ok(()) }));
        let (name, attr) = &el.attrs[0];
        assert_eq!(name, "onclick");
        assert!(format!("{attr:?}").contains("anchored: true"));
    }
}
