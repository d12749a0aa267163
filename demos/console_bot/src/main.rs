//! Console Bot
//!
//! A terminal adapter for Parley: every line read from stdin becomes a
//! request, every response is printed to stdout. Logs go to stderr.
//!
//! - Lines starting with `/` are commands.
//! - Lines starting with `!` are button presses; the rest of the line is
//!   the callback payload (try `/order 42`, then `!confirm 42`).
//! - Anything else is a plain message, answered by the fallback module.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package console-bot -- --user 7 --role admin
//! ```

use std::sync::OnceLock;

use anyhow::Result;
use clap::Parser;
use parley::core::{Button, ButtonAction, MessageContent};
use parley::framework::RouteInfo;
use parley::prelude::*;
use parley::runtime::config::{ConfigLoader, LogOutput};
use serde_json::{Map, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const SOURCE: &str = "console";

#[derive(Debug, Parser)]
#[command(name = "console-bot", about = "Talk to a Parley bot from the terminal")]
struct Cli {
    /// Configuration file (defaults to parley.toml in the current directory)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Configuration profile
    #[arg(short, long)]
    profile: Option<String>,

    /// User id attached to every request; 0 is anonymous
    #[arg(short, long, default_value_t = 1)]
    user: i64,

    #[arg(long, default_value_t = 1)]
    chat: i64,

    /// Roles granted to the user (repeatable)
    #[arg(short, long = "role")]
    roles: Vec<String>,

    /// Print responses as JSON instead of text
    #[arg(long)]
    json: bool,
}

// ============================================================================
// Modules
// ============================================================================

/// `/ping`, `/echo` and `/help`.
struct Basics {
    /// Filled once every module is registered.
    help: &'static OnceLock<Vec<RouteInfo>>,
}

#[async_trait]
impl Module for Basics {
    fn name(&self) -> &str {
        "basics"
    }

    fn description(&self) -> &str {
        "Connectivity checks and help"
    }

    fn routes(&self) -> Vec<Route> {
        let help = self.help;
        vec![
            Route::builder(["/ping"])
                .describe("ping", "Check that the bot is alive")
                .handler(|_ctx| async { "Pong!" }),
            Route::builder(["/echo {text}"])
                .describe("echo", "Repeat the text back")
                .example("/echo hello there")
                .handler(|ctx: Arc<RequestContext>| async move {
                    ctx.param("text").unwrap_or_default()
                }),
            Route::builder(["/help", "/start"])
                .describe("help", "List the available commands")
                .priority(10)
                .handler(move |_ctx| async move { render_help(help.get()) }),
        ]
    }
}

fn render_help(routes: Option<&Vec<RouteInfo>>) -> String {
    let Some(routes) = routes else {
        return "Help is not ready yet.".to_string();
    };
    let mut lines = vec!["Commands:".to_string()];
    for route in routes.iter().filter(|r| r.visible() && r.kind == RouteKind::Command) {
        let pattern = route.patterns.first().map_or("", String::as_str);
        lines.push(format!("  {pattern:<20} {}", route.description));
    }
    lines.join("\n")
}

/// Orders with an inline confirmation button.
struct Orders {
    bus: EventBus,
}

#[async_trait]
impl Module for Orders {
    fn name(&self) -> &str {
        "orders"
    }

    fn routes(&self) -> Vec<Route> {
        let bus = self.bus.clone();
        vec![
            Route::builder(["/order {id}"])
                .describe("order", "Show an order")
                .category("shop")
                .handler(|ctx: Arc<RequestContext>| async move {
                    let id = ctx.param("id").unwrap_or_default();
                    let confirm = Button::callback("Confirm", format!("confirm {id}"));
                    Response::message(format!("Order #{id} is waiting for confirmation."))
                        .with_keyboard(Keyboard::inline().row([confirm]))
                }),
            Route::builder(["confirm {id}"])
                .kind(RouteKind::Callback)
                .security(SecurityPolicy::new().require_auth())
                .handler(move |ctx: Arc<RequestContext>| confirm_order(bus.clone(), ctx)),
        ]
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<(), BoxError> {
        ctx.bus().subscribe(topics::USER_ACTION, |event: Arc<Event>| async move {
            if event.get_str("action") == Some("order_confirmed") {
                info!(order = ?event.get("order"), user = ?event.user_id, "Order confirmed");
            }
            Ok(())
        });
        Ok(())
    }
}

async fn confirm_order(bus: EventBus, ctx: Arc<RequestContext>) -> Response {
    let id = ctx.param("id").unwrap_or_default();
    bus.publish_async(
        Event::new(topics::USER_ACTION, "orders")
            .with_data("action", "order_confirmed")
            .with_data("order", id.clone())
            .with_user(ctx.user_id())
            .with_chat(ctx.chat_id()),
    );
    Response::multiple([
        Response::answer_callback("Confirmed"),
        Response::edit(
            ctx.message_id().unwrap_or("0"),
            format!("Order #{id} confirmed. Thank you!"),
        ),
    ])
}

/// Operator commands, restricted to the `admin` role.
struct Admin {
    bus: EventBus,
}

#[async_trait]
impl Module for Admin {
    fn name(&self) -> &str {
        "admin"
    }

    fn routes(&self) -> Vec<Route> {
        let bus = self.bus.clone();
        vec![
            Route::builder(["/stats"])
                .describe("stats", "Event bus statistics (admins only)")
                .security(
                    SecurityPolicy::new()
                        .require_auth()
                        .roles(["admin"])
                        .rate_limit(RateLimitPolicy::per_minute(5)),
                )
                .handler(move |_ctx| {
                    let stats = bus.stats();
                    async move {
                        format!(
                            "published={} dropped={} failed={} queued={}/{} subscribers={}",
                            stats.published,
                            stats.dropped,
                            stats.failed,
                            stats.queue_len,
                            stats.queue_capacity,
                            stats.total_subscribers
                        )
                    }
                }),
        ]
    }
}

/// Answers plain messages no route matched.
struct Fallback;

#[async_trait]
impl Module for Fallback {
    fn name(&self) -> &str {
        "fallback"
    }

    fn routes(&self) -> Vec<Route> {
        Vec::new()
    }

    fn as_wildcard(self: Arc<Self>) -> Option<Arc<dyn WildcardHandler>> {
        Some(self)
    }

    fn as_event_aware(&self) -> Option<&dyn EventAware> {
        Some(self)
    }
}

#[async_trait]
impl WildcardHandler for Fallback {
    fn should_handle(&self, ctx: &RequestContext) -> bool {
        !ctx.is_command() && !ctx.text().trim().is_empty()
    }

    async fn handle_wildcard(&self, ctx: Arc<RequestContext>) -> HandlerResult {
        Ok(Response::message(format!(
            "I don't understand \"{}\". Try /help.",
            ctx.text()
        )))
    }
}

impl EventAware for Fallback {
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(
            parley::framework::WILDCARD_TOPIC,
            |event: Arc<Event>| async move {
                tracing::debug!(topic = %event.topic, source = %event.source, "Event observed");
                Ok(())
            },
        )]
    }
}

// ============================================================================
// Console adapter
// ============================================================================

fn request(cli: &Cli, line: &str, seq: u64) -> RequestContext {
    let kind = if line.starts_with('!') {
        InteractionKind::Callback
    } else if line.starts_with('/') {
        InteractionKind::Command
    } else {
        InteractionKind::Message
    };

    let mut builder = RequestContext::builder(kind)
        .user(cli.user)
        .chat(cli.chat)
        .message_id(seq.to_string())
        .source(SOURCE)
        .roles(cli.roles.iter().cloned());
    builder = match kind {
        InteractionKind::Callback => builder.callback_data(line[1..].trim()),
        _ => builder.text(line),
    };
    builder.build()
}

fn print_response(response: &Response, json: bool) {
    if json {
        match serde_json::to_string(response) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize response"),
        }
        return;
    }
    match response {
        Response::Message(out) | Response::Stream(out) => print_content(&out.content),
        Response::Edit { message_id, message } => {
            print!("(edit #{message_id}) ");
            print_content(&message.content);
        }
        Response::Delete { message_id } => println!("(deleted #{message_id})"),
        Response::AnswerCallback(answer) => {
            println!("(toast) {}", answer.text.as_deref().unwrap_or(""));
        }
        Response::Multiple { actions } => {
            for action in actions {
                print_response(action, false);
            }
        }
        Response::Redirect { target } => println!("(redirect to {target})"),
        Response::Silent => {}
    }
}

fn print_content(content: &MessageContent) {
    println!("{}", content.text);
    if let Some(keyboard) = &content.keyboard {
        for row in &keyboard.rows {
            let buttons: Vec<String> = row
                .iter()
                .map(|button| match &button.action {
                    ButtonAction::Callback { data } => format!("[{}] (!{data})", button.text),
                    ButtonAction::Url { url } => format!("[{}] ({url})", button.text),
                    ButtonAction::Text => format!("[{}]", button.text),
                })
                .collect();
            println!("  {}", buttons.join("  "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new().with_current_dir();
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    if let Some(profile) = &cli.profile {
        loader = loader.profile(profile);
    }
    let mut config = loader.load()?;
    // stdout carries the conversation
    if config.logging.output == LogOutput::Stdout {
        config.logging.output = LogOutput::Stderr;
    }

    let runtime = ParleyRuntime::from_config(config)?;
    static HELP: OnceLock<Vec<RouteInfo>> = OnceLock::new();
    runtime.register_module(Basics { help: &HELP })?;
    runtime.register_module(Orders {
        bus: runtime.bus().clone(),
    })?;
    runtime.register_module(Admin {
        bus: runtime.bus().clone(),
    })?;
    runtime.register_module(Fallback)?;
    let _ = HELP.set(runtime.router().routes());

    runtime.start().await?;
    info!(user = cli.user, chat = cli.chat, "Console bot ready, type /help");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        seq += 1;
        let ctx = request(&cli, line, seq);
        emit(
            runtime.bus(),
            topics::MESSAGE_RECEIVED,
            SOURCE,
            Map::from_iter([("text".to_string(), json!(line))]),
        );
        let response = runtime.handle(ctx).await;
        print_response(&response, cli.json);
    }

    runtime.stop().await?;
    Ok(())
}
