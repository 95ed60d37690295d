//! The application's handle on its browser page.
//!
//! Mutations (`print`, `set`, ...) return immediately. Each one schedules a
//! background task that renders the tree, emits any new head resources,
//! and enqueues the resulting commands. Tasks take a sequence ticket when
//! scheduled, so commands reach the browser in call order.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::node::{Node, Resource};
use crate::protocol::{Command, Event, SwapMethod};
use crate::registry::{Callback, RefError, RefId, RefObject, Registries, RemoteError, VirtualFile};
use crate::representer::{escape, RenderContext, RenderError, Representer};
use crate::session::AuthContext;
use crate::supervisor::{Sequencer, TaskSet};
use crate::transport::{Outbound, Queue};

/// Selector of the hidden container used for out-of-flow markup.
pub const HIDDEN_CONTAINER: &str = "#livepage-hidden";

const DEFAULT_SELECTOR: &str = "body";

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("session ended before the client answered")]
    Closed,
    #[error(transparent)]
    Reference(#[from] RefError),
}

/// Build the markup of a user-visible error. Details only show in debug mode.
pub(crate) fn format_error(message: &str, detail: Option<&str>, debug: bool) -> String {
    match detail {
        Some(detail) if debug => format!(
            "<div class=\"livepage-error\"><b>{}</b><pre>{}</pre></div>",
            escape(message),
            escape(detail)
        ),
        _ => format!(
            "<div class=\"livepage-error\"><b>{}</b></div>",
            escape(message)
        ),
    }
}

/// State shared by every `Page` view of one session.
pub(crate) struct PageCore {
    pub process: String,
    pub route: String,
    pub representer: Arc<dyn Representer>,
    pub registries: Registries,
    pub outbound: Arc<Queue<Outbound>>,
    pub inbound: Queue<Event>,
    pub tasks: TaskSet,
    pub sequencer: Sequencer,
    /// Resource keys already sent.
    pub emitted: Mutex<HashSet<String>>,
    pub query: HashMap<String, String>,
    pub auth: AuthContext,
    pub debug: bool,
}

impl PageCore {
    pub fn render_commands(
        &self,
        node: Option<Node>,
        selector: &str,
        method: SwapMethod,
    ) -> Result<Vec<Command>, RenderError> {
        let Some(node) = node else {
            return Ok(vec![Command::put(selector, method, "")]);
        };
        let node = node.into_element_node();

        let rendered = {
            let mut emitted = self.emitted.lock();
            let rendered = self.representer.render(
                &node,
                &RenderContext {
                    route: &self.route,
                    registries: &self.registries,
                    emitted: &emitted,
                },
            )?;
            for resource in &rendered.resources {
                emitted.insert(resource.key().to_string());
            }
            rendered
        };

        let mut commands = Vec::with_capacity(2 + rendered.scripts.len() + rendered.hidden.len());
        if !rendered.resources.is_empty() {
            commands.push(Command::Resource {
                content: self.representer.resources(&rendered.resources),
            });
        }
        commands.push(Command::put(selector, method, rendered.markup));
        for script in rendered.scripts {
            commands.push(Command::Eval {
                code: script.code,
                module: script.module,
            });
        }
        for markup in rendered.hidden {
            commands.push(Command::put(HIDDEN_CONTAINER, SwapMethod::BeforeEnd, markup));
        }
        Ok(commands)
    }

    /// Markup for a callback result. Resources are prepended inline.
    pub fn render_fragment(&self, node: &Node) -> Result<String, RenderError> {
        let mut emitted = self.emitted.lock();
        let rendered = self.representer.render(
            node,
            &RenderContext {
                route: &self.route,
                registries: &self.registries,
                emitted: &emitted,
            },
        )?;
        for resource in &rendered.resources {
            emitted.insert(resource.key().to_string());
        }
        let mut markup = self.representer.resources(&rendered.resources);
        markup.push_str(&rendered.markup);
        for hidden in rendered.hidden {
            markup.push_str(&hidden);
        }
        Ok(markup)
    }

    /// Enqueue an error banner directly, bypassing the task set.
    pub fn push_error(&self, message: &str, detail: Option<&str>) {
        let content = format_error(message, detail, self.debug);
        self.outbound
            .push(Outbound::single(Command::Error { content }, true));
    }
}

/// A view of the session's page, scoped to a selector and history policy.
#[derive(Clone)]
pub struct Page {
    core: Arc<PageCore>,
    selector: Option<String>,
    retain: bool,
}

impl Page {
    pub(crate) fn new(core: Arc<PageCore>) -> Self {
        Self {
            core,
            selector: None,
            retain: true,
        }
    }

    pub(crate) fn core(&self) -> &Arc<PageCore> {
        &self.core
    }

    pub fn process(&self) -> &str {
        &self.core.process
    }

    pub fn route(&self) -> &str {
        &self.core.route
    }

    /// Query parameters of the request that created the session.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.core.query
    }

    pub fn auth(&self) -> &AuthContext {
        &self.core.auth
    }

    pub fn selector(&self) -> &str {
        self.selector.as_deref().unwrap_or(DEFAULT_SELECTOR)
    }

    /// A view targeting `selector`, nested under this view's selector.
    pub fn select(&self, selector: impl AsRef<str>) -> Page {
        let selector = match &self.selector {
            Some(outer) => format!("{outer} {}", selector.as_ref()),
            None => selector.as_ref().to_string(),
        };
        Page {
            core: self.core.clone(),
            selector: Some(selector),
            retain: self.retain,
        }
    }

    /// A view whose commands are (or are not) replayed after a reload.
    pub fn with_history(&self, retain: bool) -> Page {
        Page {
            core: self.core.clone(),
            selector: self.selector.clone(),
            retain,
        }
    }

    pub fn without_history(&self) -> Page {
        self.with_history(false)
    }

    fn schedule_mutation(&self, node: Option<Node>, method: SwapMethod) {
        let ticket = self.core.sequencer.ticket();
        let core = self.core.clone();
        let selector = self.selector().to_string();
        let retain = self.retain;
        self.core.tasks.spawn(None, async move {
            ticket.wait_turn().await;
            match core.render_commands(node, &selector, method) {
                Ok(commands) => core.outbound.push(Outbound::new(commands, retain)),
                Err(e) => {
                    tracing::warn!(process = %core.process, error = %e, "render failed");
                    core.push_error(
                        "An error occurred trying to represent data.",
                        Some(&e.to_string()),
                    );
                }
            }
            Ok(())
        });
    }

    /// Append to the selected element.
    pub fn print(&self, node: impl Into<Node>) {
        self.schedule_mutation(Some(node.into()), SwapMethod::BeforeEnd);
    }

    pub fn print_text(&self, text: impl Into<String>) {
        self.print(Node::Text(text.into()));
    }

    pub fn print_html(&self, html: impl Into<String>) {
        self.print(Node::Raw(html.into()));
    }

    /// Replace the selected element's children.
    pub fn set(&self, node: impl Into<Node>) {
        self.schedule_mutation(Some(node.into()), SwapMethod::InnerHtml);
    }

    /// Replace the selected element itself.
    pub fn replace(&self, node: impl Into<Node>) {
        self.schedule_mutation(Some(node.into()), SwapMethod::OuterHtml);
    }

    pub fn insert(&self, method: SwapMethod, node: impl Into<Node>) {
        self.schedule_mutation(Some(node.into()), method);
    }

    pub fn clear(&self) {
        self.schedule_mutation(None, SwapMethod::InnerHtml);
    }

    pub fn delete(&self) {
        self.schedule_mutation(None, SwapMethod::OuterHtml);
    }

    /// Enqueue a raw command, in order with scheduled mutations.
    pub fn queue_command(&self, command: Command) {
        let ticket = self.core.sequencer.ticket();
        let core = self.core.clone();
        let retain = self.retain;
        self.core.tasks.spawn(None, async move {
            ticket.wait_turn().await;
            core.outbound.push(Outbound::single(command, retain));
            Ok(())
        });
    }

    pub fn set_title(&self, title: impl AsRef<str>) {
        self.queue_command(Command::put(
            "head title",
            SwapMethod::InnerHtml,
            escape(title.as_ref()),
        ));
    }

    /// Emit head resources that have not been sent yet.
    pub fn add_resources(&self, resources: Vec<Resource>) {
        let ticket = self.core.sequencer.ticket();
        let core = self.core.clone();
        let retain = self.retain;
        self.core.tasks.spawn(None, async move {
            ticket.wait_turn().await;
            // Filtered on our turn, after earlier mutations marked theirs.
            let fresh: Vec<Resource> = {
                let mut emitted = core.emitted.lock();
                resources
                    .into_iter()
                    .filter(|r| emitted.insert(r.key().to_string()))
                    .collect()
            };
            if !fresh.is_empty() {
                let content = core.representer.resources(&fresh);
                core.outbound
                    .push(Outbound::single(Command::Resource { content }, retain));
            }
            Ok(())
        });
    }

    pub fn add_resource(&self, resource: Resource) {
        self.add_resources(vec![resource]);
    }

    /// Show an error banner. `detail` is only rendered in debug mode.
    pub fn error(&self, message: impl AsRef<str>, detail: Option<&anyhow::Error>) {
        let detail = detail.map(|e| format!("{e:?}"));
        let content = format_error(message.as_ref(), detail.as_deref(), self.core.debug);
        self.queue_command(Command::Error { content });
    }

    /// Write to the browser console.
    pub fn log(&self, message: impl Into<String>) {
        self.queue_command(Command::Log {
            content: message.into(),
        });
    }

    /// Run a one-shot script in the browser.
    pub fn exec(&self, code: impl Into<String>) {
        self.queue_command(Command::eval(code));
    }

    pub fn exec_module(&self, code: impl Into<String>) {
        self.queue_command(Command::Eval {
            code: code.into(),
            module: true,
        });
    }

    /// Evaluate a JavaScript expression in the browser and wait for its
    /// value, which comes back through the `post` route.
    pub async fn eval(&self, expression: impl AsRef<str>) -> Result<Value, PageError> {
        let (id, rx) = self.core.registries.futures.lock().register();
        // History replay must not re-run the expression.
        self.without_history().exec(format!(
            "livepage.evaluate({id}, async () => ({}))",
            expression.as_ref()
        ));
        match rx.await {
            Ok(settled) => Ok(settled?),
            Err(_) => Err(PageError::Closed),
        }
    }

    /// A queue the browser can push values into with `livepage.push(id, value)`.
    pub fn channel(&self) -> (RefId, mpsc::UnboundedReceiver<Value>) {
        self.core.registries.queues.lock().channel()
    }

    /// Register a callback for use from scripts; returns its id.
    pub fn register(&self, callback: Callback) -> Result<RefId, PageError> {
        Ok(self
            .core
            .registries
            .objects
            .lock()
            .register(RefObject::Function(callback))?)
    }

    /// URL under which the session serves a local file.
    pub fn file_url(&self, path: &Path) -> String {
        let url = self.core.registries.files.lock().register(path);
        format!("{}/file/{url}", self.core.route)
    }

    pub fn vfile_url(&self, file: VirtualFile) -> String {
        let name = self.core.registries.vfiles.lock().register(file);
        format!("{}/vfile/{name}", self.core.route)
    }

    /// Run a supervised background task. Failures show as error banners.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.core.tasks.spawn(None, fut);
    }

    /// Run a task the browser can cancel with a `live-disconnected` event
    /// carrying `id`, e.g. a producer feeding a removed element.
    pub fn spawn_live<F>(&self, id: impl Into<String>, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.core.tasks.spawn(Some(id.into()), fut);
    }

    /// Next application event from the browser.
    pub async fn recv(&self) -> Event {
        self.core.inbound.pop().await
    }

    /// Wait for every scheduled mutation and task to finish.
    pub async fn sync(&self) {
        self.core.tasks.sync().await;
    }

    /// Sleep for `duration`, or until the session ends when `None`.
    pub async fn wait(&self, duration: Option<Duration>) {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ReferenceConfig;
    use crate::node::Node;
    use crate::representer::HtmlRepresenter;
    use crate::supervisor::TaskFailure;

    pub(crate) fn test_core(debug: bool) -> Arc<PageCore> {
        let outbound = Arc::new(Queue::new());
        let hook_queue = outbound.clone();
        let tasks = TaskSet::new(Arc::new(move |f: TaskFailure| {
            let content = format_error("An error occurred in a background task.", Some(&f.to_string()), debug);
            hook_queue.push(Outbound::single(Command::Error { content }, true));
        }));
        Arc::new(PageCore {
            process: "p1".into(),
            route: "/p1".into(),
            representer: Arc::new(HtmlRepresenter),
            registries: Registries::new(&ReferenceConfig::default()),
            outbound,
            inbound: Queue::new(),
            tasks,
            sequencer: Sequencer::new(),
            emitted: Mutex::new(HashSet::new()),
            query: HashMap::new(),
            auth: AuthContext::default(),
            debug,
        })
    }

    fn drain(core: &PageCore) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Some(item) = core.outbound.try_pop() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn print_emits_resource_before_put() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        page.print(
            Node::el("div")
                .resource(Resource::Stylesheet("/a.css".into()))
                .text("hi"),
        );
        page.sync().await;
        let sent = drain(&core);
        assert_eq!(sent.len(), 1);
        let cmds = &sent[0].commands;
        assert!(matches!(&cmds[0], Command::Resource { content } if content.contains("/a.css")));
        assert!(matches!(&cmds[1], Command::Put { selector, method: SwapMethod::BeforeEnd, content }
            if selector == "body" && content == "<div>hi</div>"));
        assert!(sent[0].retain);

        page.print(Node::el("div").resource(Resource::Stylesheet("/a.css".into())));
        page.sync().await;
        let again = drain(&core);
        assert_eq!(again[0].commands.len(), 1, "resource must not be re-sent");
    }

    #[tokio::test]
    async fn add_resource_after_print_does_not_steal_its_resource() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        page.print(
            Node::el("div")
                .resource(Resource::Stylesheet("/a.css".into()))
                .text("hi"),
        );
        page.add_resource(Resource::Stylesheet("/a.css".into()));
        page.add_resource(Resource::Stylesheet("/b.css".into()));
        page.sync().await;

        let kinds: Vec<&str> = drain(&core)
            .iter()
            .flat_map(|out| out.commands.iter())
            .map(|cmd| match cmd {
                Command::Resource { .. } => "resource",
                Command::Put { .. } => "put",
                _ => "other",
            })
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["resource", "put", "resource"]);
    }

    #[tokio::test]
    async fn mutations_arrive_in_call_order() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        for i in 0..50 {
            page.print_text(i.to_string());
        }
        page.log("end");
        page.sync().await;
        let sent = drain(&core);
        assert_eq!(sent.len(), 51);
        for (i, out) in sent.iter().take(50).enumerate() {
            match &out.commands[0] {
                Command::Put { content, .. } => assert_eq!(content, &format!("<span>{i}</span>")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(&sent[50].commands[0], Command::Log { content } if content == "end"));
    }

    #[tokio::test]
    async fn clear_delete_and_select() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        let list = page.select("#list");
        list.clear();
        list.select("li").delete();
        page.sync().await;
        let sent = drain(&core);
        assert_eq!(
            sent[0].commands[0],
            Command::put("#list", SwapMethod::InnerHtml, "")
        );
        assert_eq!(
            sent[1].commands[0],
            Command::put("#list li", SwapMethod::OuterHtml, "")
        );
    }

    #[tokio::test]
    async fn without_history_marks_outbound() {
        let core = test_core(false);
        let page = Page::new(core.clone()).without_history();
        page.set("x");
        page.sync().await;
        assert!(!drain(&core)[0].retain);
    }

    #[tokio::test]
    async fn render_failure_becomes_error_banner() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        page.print(Node::el("bad tag"));
        page.sync().await;
        let sent = drain(&core);
        assert!(matches!(&sent[0].commands[0], Command::Error { content }
            if content.contains("An error occurred trying to represent data.") && !content.contains("<pre>")));
    }

    #[tokio::test]
    async fn failed_task_surfaces_through_hook() {
        let core = test_core(true);
        let page = Page::new(core.clone());
        page.spawn(async { Err(anyhow::anyhow!("disk on fire")) });
        page.sync().await;
        let sent = drain(&core);
        assert!(matches!(&sent[0].commands[0], Command::Error { content } if content.contains("disk on fire")));
    }

    #[tokio::test]
    async fn scripts_and_hidden_follow_put() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        page.print(Node::el("div").script("go()").hidden(Node::el("template")));
        page.sync().await;
        let cmds = drain(&core).remove(0).commands;
        assert!(matches!(&cmds[0], Command::Put { .. }));
        assert_eq!(cmds[1], Command::eval("go()"));
        assert_eq!(
            cmds[2],
            Command::put(HIDDEN_CONTAINER, SwapMethod::BeforeEnd, "<template></template>")
        );
    }

    async fn next_eval_id(core: &PageCore) -> RefId {
        loop {
            if let Some(out) = core.outbound.try_pop() {
                assert!(!out.retain, "eval must not be replayed");
                let Command::Eval { code, .. } = &out.commands[0] else {
                    panic!("unexpected {:?}", out.commands);
                };
                return code
                    .trim_start_matches("livepage.evaluate(")
                    .split(',')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn eval_resolves_through_future_registry() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        let evaluating = tokio::spawn({
            let page = page.clone();
            async move { page.eval("1 + 1").await }
        });
        let id = next_eval_id(&core).await;
        assert!(core.registries.futures.lock().resolve(id, Value::from(2)));
        assert_eq!(evaluating.await.unwrap().unwrap(), Value::from(2));
    }

    #[tokio::test]
    async fn eval_reports_client_errors() {
        let core = test_core(false);
        let page = Page::new(core.clone());
        let evaluating = tokio::spawn({
            let page = page.clone();
            async move { page.eval("nope()").await }
        });
        let id = next_eval_id(&core).await;
        assert!(core.registries.futures.lock().reject(id, "ReferenceError"));
        assert!(matches!(evaluating.await.unwrap(), Err(PageError::Remote(_))));
    }

    #[test]
    fn format_error_hides_detail_outside_debug() {
        let prod = format_error("Oops", Some("trace <x>"), false);
        assert!(!prod.contains("trace"));
        let debug = format_error("Oops", Some("trace <x>"), true);
        assert!(debug.contains("trace &lt;x&gt;"));
    }
}
