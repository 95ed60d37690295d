//! Turning UI trees into markup.

use std::collections::HashSet;

use crate::node::{Attr, Element, Node, Resource, Script};
use crate::registry::{RefError, RefObject, Registries};

/// Path the embedded browser client is served from.
pub const CLIENT_SCRIPT: &str = "/_/livepage.js";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("cannot register reference: {0}")]
    Reference(#[from] RefError),
    #[error("invalid node: {0}")]
    Invalid(String),
}

/// What a representer needs from the session while rendering.
pub struct RenderContext<'a> {
    /// URL prefix of the session, e.g. `/abc123`.
    pub route: &'a str,
    pub registries: &'a Registries,
    /// Resource keys already sent to this session.
    pub emitted: &'a HashSet<String>,
}

/// Output of rendering one tree.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Rendered {
    pub markup: String,
    /// Resources not yet sent to the session, in first-use order.
    pub resources: Vec<Resource>,
    pub scripts: Vec<Script>,
    /// Markup to insert in a hidden container.
    pub hidden: Vec<String>,
}

pub struct ShellParams<'a> {
    pub title: &'a str,
    pub route: &'a str,
    pub debug: bool,
}

/// Pluggable conversion of UI trees to markup.
pub trait Representer: Send + Sync {
    fn render(&self, node: &Node, ctx: &RenderContext<'_>) -> Result<Rendered, RenderError>;

    /// Markup for a resource command.
    fn resources(&self, resources: &[Resource]) -> String;

    /// The initial HTML document for a session.
    fn shell(&self, params: &ShellParams<'_>) -> String;
}

/// Plain HTML representer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRepresenter;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}

impl HtmlRepresenter {
    fn walk(
        &self,
        node: &Node,
        ctx: &RenderContext<'_>,
        out: &mut Rendered,
        seen: &mut HashSet<String>,
    ) -> Result<(), RenderError> {
        match node {
            Node::Text(text) => out.markup.push_str(&escape(text)),
            Node::Raw(markup) => out.markup.push_str(markup),
            Node::Fragment(nodes) => {
                for node in nodes {
                    self.walk(node, ctx, out, seen)?;
                }
            }
            Node::Element(el) => self.element(el, ctx, out, seen)?,
        }
        Ok(())
    }

    fn element(
        &self,
        el: &Element,
        ctx: &RenderContext<'_>,
        out: &mut Rendered,
        seen: &mut HashSet<String>,
    ) -> Result<(), RenderError> {
        if !is_valid_name(&el.tag) {
            return Err(RenderError::Invalid(format!("bad tag name {:?}", el.tag)));
        }
        for resource in &el.resources {
            if !ctx.emitted.contains(resource.key()) && seen.insert(resource.key().to_string()) {
                out.resources.push(resource.clone());
            }
        }

        out.markup.push('<');
        out.markup.push_str(&el.tag);
        for (name, attr) in &el.attrs {
            if !is_valid_name(name) {
                return Err(RenderError::Invalid(format!("bad attribute name {name:?}")));
            }
            let value = match attr {
                Attr::Flag => {
                    out.markup.push(' ');
                    out.markup.push_str(name);
                    continue;
                }
                Attr::Text(text) => text.clone(),
                Attr::Callback(callback) => {
                    let id = ctx
                        .registries
                        .objects
                        .lock()
                        .register(RefObject::Function(callback.clone()))?;
                    format!("livepage.call(this, {id}, event)")
                }
                Attr::Reference(value) => {
                    let id = ctx
                        .registries
                        .objects
                        .lock()
                        .register(RefObject::Value(value.clone()))?;
                    format!("obj#{id}")
                }
                Attr::File(path) => {
                    let url = ctx.registries.files.lock().register(path);
                    format!("{}/file/{url}", ctx.route)
                }
                Attr::VFile(file) => {
                    let name = ctx.registries.vfiles.lock().register(file.clone());
                    format!("{}/vfile/{name}", ctx.route)
                }
            };
            out.markup.push(' ');
            out.markup.push_str(name);
            out.markup.push_str("=\"");
            out.markup.push_str(&escape(&value));
            out.markup.push('"');
        }
        out.markup.push('>');

        if VOID_ELEMENTS.contains(&el.tag.as_str()) {
            if !el.children.is_empty() {
                return Err(RenderError::Invalid(format!(
                    "<{}> cannot have children",
                    el.tag
                )));
            }
        } else {
            for child in &el.children {
                self.walk(child, ctx, out, seen)?;
            }
            out.markup.push_str("</");
            out.markup.push_str(&el.tag);
            out.markup.push('>');
        }

        out.scripts.extend(el.scripts.iter().cloned());
        for node in &el.hidden {
            let mut inner = Rendered::default();
            self.walk(node, ctx, &mut inner, seen)?;
            out.resources.append(&mut inner.resources);
            out.scripts.append(&mut inner.scripts);
            out.hidden.push(inner.markup);
            out.hidden.append(&mut inner.hidden);
        }
        Ok(())
    }
}

impl Representer for HtmlRepresenter {
    fn render(&self, node: &Node, ctx: &RenderContext<'_>) -> Result<Rendered, RenderError> {
        let mut out = Rendered::default();
        let mut seen = HashSet::new();
        self.walk(node, ctx, &mut out, &mut seen)?;
        Ok(out)
    }

    fn resources(&self, resources: &[Resource]) -> String {
        resources
            .iter()
            .map(|resource| match resource {
                Resource::Stylesheet(href) => {
                    format!("<link rel=\"stylesheet\" href=\"{}\">", escape(href))
                }
                Resource::Script { src, module } => format!(
                    "<script src=\"{}\"{}></script>",
                    escape(src),
                    if *module { " type=\"module\"" } else { "" }
                ),
            })
            .collect()
    }

    fn shell(&self, params: &ShellParams<'_>) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{title}</title>\n<script src=\"{CLIENT_SCRIPT}\"></script>\n</head>\n\
             <body data-livepage-route=\"{route}\" data-livepage-debug=\"{debug}\"></body>\n</html>\n",
            title = escape(params.title),
            route = escape(params.route),
            debug = params.debug,
        )
    }
}
