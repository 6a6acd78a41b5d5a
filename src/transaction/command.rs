//! Wire command rendering.
//!
//! Every transaction is executed as a short sequence of line-oriented text
//! commands. Each command is a single line terminated by `;` and a newline.
//! Caller-supplied text (dataset ids, constraint expressions, form URLs) is
//! percent-escaped before it is embedded so that it can never terminate the
//! command early or smuggle in a second one.

use crate::transaction::Product;

fn is_control(ch: char) -> bool {
    (ch as u32) < 0x20 || ch as u32 == 0x7f
}

/// Escapes text destined for a quoted position inside a command.
///
/// `%` itself is escaped, so already-escaped input survives a round trip
/// instead of collapsing. Control characters are escaped along with the
/// quote and the terminator.
pub fn escape_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' | '"' | ';' => out.push_str(&format!("%{:02X}", ch as u32)),
            c if is_control(c) => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Escapes text destined for an unquoted token position.
///
/// Same as [`escape_quoted`] plus space and comma, which would otherwise
/// split the token or introduce a phantom argument.
pub fn escape_token(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' | '"' | ';' | ' ' | ',' => out.push_str(&format!("%{:02X}", ch as u32)),
            c if is_control(c) => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// One line of the backend command language.
///
/// Rendering happens in [`std::fmt::Display`]; [`Command::wire_line`] appends
/// the trailing newline the transport expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bind a dataset to an alias in the backend catalog.
    SetContainer {
        alias: String,
        dataset: String,
        type_hint: Option<String>,
    },
    /// Define a retrievable object over a bound alias, optionally constrained.
    Define {
        alias: String,
        dataset: String,
        constraint: Option<String>,
    },
    /// Request a product for a defined alias.
    Get {
        product: Product,
        alias: String,
        form_url: Option<String>,
    },
    /// Discard all definitions in the session.
    DeleteDefinitions,
    /// Discard all container bindings in the session.
    DeleteContainers,
    /// Request a catalog product, optionally scoped to one dataset node.
    Show {
        product: Product,
        dataset: Option<String>,
    },
}

impl Command {
    /// Full line as sent on the wire.
    pub fn wire_line(&self) -> String {
        format!("{}\n", self)
    }

    /// Short tag for logs and metrics labels.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::SetContainer { .. } => "set-container",
            Command::Define { .. } => "define",
            Command::Get { .. } => "get",
            Command::DeleteDefinitions => "delete-definitions",
            Command::DeleteContainers => "delete-containers",
            Command::Show { .. } => "show",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetContainer {
                alias,
                dataset,
                type_hint,
            } => {
                write!(
                    f,
                    "set container in catalog values {}, {}",
                    alias,
                    escape_token(dataset)
                )?;
                if let Some(hint) = type_hint {
                    write!(f, ", {}", escape_token(hint))?;
                }
                write!(f, ";")
            }
            Command::Define {
                alias,
                dataset,
                constraint,
            } => {
                write!(f, "define {} as {}", alias, escape_token(dataset))?;
                if let Some(ce) = constraint {
                    write!(
                        f,
                        " with {}.constraint=\"{}\"",
                        escape_token(dataset),
                        escape_quoted(ce)
                    )?;
                }
                write!(f, ";")
            }
            Command::Get {
                product,
                alias,
                form_url,
            } => {
                write!(f, "get {} for {}", product.wire_token(), alias)?;
                if let Some(url) = form_url {
                    write!(f, " using {}", escape_token(url))?;
                }
                write!(f, ";")
            }
            Command::DeleteDefinitions => write!(f, "delete definitions;"),
            Command::DeleteContainers => write!(f, "delete containers;"),
            Command::Show { product, dataset } => {
                write!(f, "show {}", product.wire_token())?;
                if let Some(node) = dataset {
                    write!(f, " for \"{}\"", escape_quoted(node))?;
                }
                write!(f, ";")
            }
        }
    }
}
