//! Transaction model and execution.
//!
//! A [`Transaction`] names the dataset, product, and optional qualifiers of
//! one client request. The composer lowers it to wire commands and the
//! runner drives those commands over a pooled session.

pub mod command;
pub mod composer;
pub mod product;
pub mod runner;

pub use command::Command;
pub use composer::{TransactionComposer, WELL_KNOWN_ALIAS};
pub use product::Product;
pub use runner::{TransactionReceipt, TransactionRunner};

use std::time::Duration;

/// One client request against the backend.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Catalog path of the dataset, e.g. `/data/nc/fnoc1.nc`.
    pub dataset_id: String,
    /// Constraint expression applied at define time. `None` or empty means
    /// the full dataset.
    pub constraint: Option<String>,
    /// Product to retrieve.
    pub product: Product,
    /// Optional backend interpretation hint attached to the container bind.
    pub type_hint: Option<String>,
    /// Absolute URL embedded into generated HTML forms.
    pub form_url: Option<String>,
    /// Upper bound applied both to the pool checkout wait and to the final
    /// retrieval command. `None` falls back to the pool configuration.
    pub deadline: Option<Duration>,
}

impl Transaction {
    pub fn new(dataset_id: impl Into<String>, product: Product) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            constraint: None,
            product,
            type_hint: None,
            form_url: None,
            deadline: None,
        }
    }

    /// A catalog transaction with no dataset scope, e.g. a version probe.
    pub fn show(product: Product) -> Self {
        Self::new("", product)
    }

    pub fn with_constraint(mut self, ce: impl Into<String>) -> Self {
        let ce = ce.into();
        self.constraint = if ce.is_empty() { None } else { Some(ce) };
        self
    }

    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    pub fn with_form_url(mut self, url: impl Into<String>) -> Self {
        self.form_url = Some(url.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Dataset scope for `show` commands, when one was given.
    pub fn show_scope(&self) -> Option<&str> {
        if self.dataset_id.is_empty() {
            None
        } else {
            Some(&self.dataset_id)
        }
    }
}
