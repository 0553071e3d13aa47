//! The remote interaction surface consumed by the navigator.

use crate::error::InteractionError;
use async_trait::async_trait;
use std::fmt;

pub type InteractionResult<T> = std::result::Result<T, InteractionError>;

/// Ways of locating an element on the portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Id(String),
    Name(String),
    /// One or more class names joined with dots (`a.b.c` matches all three).
    ClassName(String),
    TagName(String),
    Css(String),
    XPath(String),
    /// Any element whose text is exactly this string.
    Text(String),
    PartialLinkText(String),
}

/// A locator lowered to something a browser can evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn id(id: impl Into<String>) -> Self {
        Locator::Id(id.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        Locator::Name(name.into())
    }

    pub fn class_name(class: impl Into<String>) -> Self {
        Locator::ClassName(class.into())
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Locator::TagName(tag.into())
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Locator::XPath(expression.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text(text.into())
    }

    pub fn partial_link_text(text: impl Into<String>) -> Self {
        Locator::PartialLinkText(text.into())
    }

    pub fn to_selector(&self) -> Selector {
        match self {
            Locator::Id(id) => Selector::Css(format!("[id=\"{}\"]", escape_css(id))),
            Locator::Name(name) => Selector::Css(format!("[name=\"{}\"]", escape_css(name))),
            Locator::ClassName(classes) => Selector::Css(
                classes
                    .split('.')
                    .filter(|c| !c.is_empty())
                    .map(|c| format!(".{}", c))
                    .collect(),
            ),
            Locator::TagName(tag) => Selector::Css(tag.clone()),
            Locator::Css(css) => Selector::Css(css.clone()),
            Locator::XPath(xpath) => Selector::XPath(xpath.clone()),
            Locator::Text(text) => Selector::XPath(format!("//*[text()={}]", xpath_literal(text))),
            Locator::PartialLinkText(text) => {
                Selector::XPath(format!("//a[contains(., {})]", xpath_literal(text)))
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Id(v) => write!(f, "id={}", v),
            Locator::Name(v) => write!(f, "name={}", v),
            Locator::ClassName(v) => write!(f, "class={}", v),
            Locator::TagName(v) => write!(f, "tag={}", v),
            Locator::Css(v) => write!(f, "css={}", v),
            Locator::XPath(v) => write!(f, "xpath={}", v),
            Locator::Text(v) => write!(f, "text={}", v),
            Locator::PartialLinkText(v) => write!(f, "link~={}", v),
        }
    }
}

fn escape_css(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Quote a string for XPath 1.0, which has no escape sequences.
fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        let parts: Vec<String> = value.split('\'').map(|p| format!("'{}'", p)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Remote interaction surface (a browser page, or a scripted stand-in in tests).
///
/// Every method may fail transiently (element not present yet, click
/// intercepted) or permanently (connection gone). Callers are expected to go
/// through [`crate::retry::RetryableAction`].
#[async_trait]
pub trait InteractionSurface: Send + Sync {
    type Element: Send + Sync;

    async fn navigate(&self, url: &str) -> InteractionResult<()>;

    async fn find(&self, locator: &Locator) -> InteractionResult<Self::Element>;

    async fn find_all(&self, locator: &Locator) -> InteractionResult<Vec<Self::Element>>;

    async fn click(&self, element: &Self::Element) -> InteractionResult<()>;

    async fn type_text(&self, element: &Self::Element, text: &str) -> InteractionResult<()>;

    async fn current_url(&self) -> InteractionResult<String>;

    async fn page_source(&self) -> InteractionResult<String>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self) -> InteractionResult<Vec<u8>>;

    async fn close(&mut self) -> InteractionResult<()>;
}
