//! The response model produced by handlers and consumed by adapters.
//!
//! Handlers never talk to a transport. They return a [`Response`] and the
//! adapter translates it into its own wire format. The model serializes to
//! JSON with a `type` tag so adapters living in other processes can forward
//! it unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the adapter should do after a request has been handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Send a new message.
    Message(Outgoing),
    /// Replace the content of an existing message.
    Edit { message_id: String, message: Outgoing },
    /// Delete an existing message.
    Delete { message_id: String },
    /// Acknowledge a callback button press.
    AnswerCallback(CallbackAnswer),
    /// Perform several actions in order.
    Multiple { actions: Vec<Response> },
    /// Do nothing.
    Silent,
    /// Re-dispatch the interaction with different text.
    Redirect { target: String },
    /// Deliver a message incrementally.
    Stream(Outgoing),
}

impl Response {
    /// A plain text message with default content options.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(Outgoing::text(text))
    }

    pub fn edit(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Edit {
            message_id: message_id.into(),
            message: Outgoing::text(text),
        }
    }

    pub fn delete(message_id: impl Into<String>) -> Self {
        Self::Delete {
            message_id: message_id.into(),
        }
    }

    pub fn answer_callback(text: impl Into<String>) -> Self {
        Self::AnswerCallback(CallbackAnswer {
            text: Some(text.into()),
            ..Default::default()
        })
    }

    pub fn multiple(actions: impl IntoIterator<Item = Response>) -> Self {
        Self::Multiple {
            actions: actions.into_iter().collect(),
        }
    }

    /// The "nothing to say" sentinel.
    pub fn silent() -> Self {
        Self::Silent
    }

    pub fn redirect(target: impl Into<String>) -> Self {
        Self::Redirect {
            target: target.into(),
        }
    }

    pub fn stream(text: impl Into<String>) -> Self {
        Self::Stream(Outgoing::text(text))
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent)
    }

    /// Tag name of the variant, as used in the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::AnswerCallback(_) => "answer_callback",
            Self::Multiple { .. } => "multiple",
            Self::Silent => "silent",
            Self::Redirect { .. } => "redirect",
            Self::Stream(_) => "stream",
        }
    }

    /// Returns the primary text carried by this response, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message(m) | Self::Stream(m) | Self::Edit { message: m, .. } => {
                Some(m.content.text.as_str())
            }
            Self::AnswerCallback(answer) => answer.text.as_deref(),
            Self::Multiple { actions } => actions.iter().find_map(Response::text),
            _ => None,
        }
    }

    /// Mutable access to the outgoing message, for variants that carry one.
    pub fn outgoing_mut(&mut self) -> Option<&mut Outgoing> {
        match self {
            Self::Message(m) | Self::Stream(m) | Self::Edit { message: m, .. } => Some(m),
            _ => None,
        }
    }

    /// Sets the parse mode on the carried message, if any.
    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.content.parse_mode = mode;
        }
        self
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.content.keyboard = Some(keyboard);
        }
        self
    }

    pub fn with_media(mut self, media: Media) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.content.media.push(media);
        }
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.options.reply_to = Some(message_id.into());
        }
        self
    }

    pub fn without_notification(mut self) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.options.disable_notification = true;
        }
        self
    }

    /// Asks the adapter to remove the message after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if let Some(out) = self.outgoing_mut() {
            out.options.ttl = Some(ttl);
        }
        self
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::Silent
    }
}

impl From<String> for Response {
    fn from(text: String) -> Self {
        Self::message(text)
    }
}

impl From<&str> for Response {
    fn from(text: &str) -> Self {
        Self::message(text)
    }
}

// =============================================================================
// Content
// =============================================================================

/// A message plus how to deliver it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    pub content: MessageContent,
    #[serde(default)]
    pub options: DeliveryOptions,
}

impl Outgoing {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: MessageContent {
                text: text.into(),
                ..Default::default()
            },
            options: DeliveryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    #[default]
    Html,
    Markdown,
    Plain,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default)]
    pub parse_mode: ParseMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<Media>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Animation,
    Sticker,
}

/// A reference to media the adapter should attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    /// Platform file id or URL.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl Media {
    pub fn new(kind: MediaKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            caption: None,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyboardKind {
    #[default]
    Inline,
    Reply,
    Remove,
}

/// A keyboard description. Layout only; rendering is adapter-owned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyboard {
    pub kind: KeyboardKind,
    pub rows: Vec<Vec<Button>>,
    #[serde(default)]
    pub one_time: bool,
    #[serde(default)]
    pub resize: bool,
}

impl Keyboard {
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn reply() -> Self {
        Self {
            kind: KeyboardKind::Reply,
            resize: true,
            ..Default::default()
        }
    }

    pub fn remove() -> Self {
        Self {
            kind: KeyboardKind::Remove,
            ..Default::default()
        }
    }

    /// Appends a row of buttons.
    pub fn row(mut self, buttons: impl IntoIterator<Item = Button>) -> Self {
        self.rows.push(buttons.into_iter().collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ButtonAction {
    Callback { data: String },
    Url { url: String },
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    #[serde(flatten)]
    pub action: ButtonAction,
}

impl Button {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Callback { data: data.into() },
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Url { url: url.into() },
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Text,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub disable_notification: bool,
    #[serde(default)]
    pub disable_preview: bool,
    #[serde(default)]
    pub protect_content: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

/// Acknowledgement of a callback button press.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub show_alert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub cache_time: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_silent() {
        assert!(Response::default().is_silent());
        assert_eq!(Response::silent().text(), None);
    }

    #[test]
    fn test_builders_apply_to_carried_message() {
        let response = Response::message("<b>hi</b>")
            .with_parse_mode(ParseMode::Html)
            .reply_to("17")
            .without_notification()
            .with_keyboard(Keyboard::inline().row([Button::callback("Yes", "confirm 1")]));

        let Response::Message(out) = &response else {
            panic!("expected a message");
        };
        assert_eq!(out.options.reply_to.as_deref(), Some("17"));
        assert!(out.options.disable_notification);
        assert_eq!(out.content.keyboard.as_ref().map(|k| k.rows.len()), Some(1));
    }

    #[test]
    fn test_builders_ignore_variants_without_message() {
        let response = Response::delete("5").reply_to("1");
        assert_eq!(response, Response::delete("5"));
    }

    #[test]
    fn test_multiple_text_is_first_text() {
        let response = Response::multiple([Response::delete("3"), Response::message("done")]);
        assert_eq!(response.text(), Some("done"));
        assert_eq!(response.kind(), "multiple");
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Response::answer_callback("ok")).unwrap();
        assert_eq!(json["type"], "answer_callback");
        assert_eq!(json["text"], "ok");

        let json = serde_json::to_value(Button::callback("Go", "go 1")).unwrap();
        assert_eq!(json["action"], "callback");
        assert_eq!(json["data"], "go 1");
    }
}
